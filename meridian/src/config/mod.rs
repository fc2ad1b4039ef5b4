use crate::processor::RedeliveryPolicy;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Engine-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub name: String,
    /// How long stopping a route waits for inflight exchanges to drain.
    pub shutdown_timeout_ms: u64,
    /// Used by error handlers declared without a policy of their own.
    pub redelivery: RedeliveryPolicy,
    /// Whether splitters share their unit of work unless told otherwise.
    pub split_share_unit_of_work: bool,
}

impl EngineConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: String::from("meridian"),
            shutdown_timeout_ms: 10_000,
            redelivery: RedeliveryPolicy::default(),
            split_share_unit_of_work: false,
        }
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }

    pub fn load(provider: &impl ConfigProvider<EngineConfig>) -> Result<Self, ConfigProviderError> {
        provider.load()
    }
}

pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    pub fn name(&mut self, name: impl Into<String>) -> &mut Self {
        self.config.name = name.into();
        self
    }

    pub fn shutdown_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.config.shutdown_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn redelivery(&mut self, policy: RedeliveryPolicy) -> &mut Self {
        self.config.redelivery = policy;
        self
    }

    pub fn split_share_unit_of_work(&mut self, share: bool) -> &mut Self {
        self.config.split_share_unit_of_work = share;
        self
    }

    pub fn build(&self) -> EngineConfig {
        self.config.clone()
    }
}

impl Default for EngineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub trait ConfigProvider<C>
where
    C: Default + DeserializeOwned,
{
    fn load(&self) -> Result<C, ConfigProviderError>;
}

pub struct DefaultConfigProvider;

impl<C> ConfigProvider<C> for DefaultConfigProvider
where
    C: Default + DeserializeOwned,
{
    fn load(&self) -> Result<C, ConfigProviderError> {
        Ok(C::default())
    }
}

/// Reads a JSON document from `base_path/config_name`.
pub struct FileConfigProvider {
    pub base_path: String,
    pub config_name: String,
}

impl<C> ConfigProvider<C> for FileConfigProvider
where
    C: Default + DeserializeOwned,
{
    fn load(&self) -> Result<C, ConfigProviderError> {
        let config_path = Path::new(&self.base_path).join(&self.config_name);
        let file = File::open(&config_path).map_err(|e| {
            let msg = format!("Could not open config file {}: {}", config_path.display(), e);
            ConfigProviderError::load_error(msg)
        })?;
        serde_json::from_reader(file).map_err(|e| {
            let msg = format!("Could not load config file from reader: {}", e);
            ConfigProviderError::load_error(msg)
        })
    }
}

pub struct ProgrammaticConfigProvider<C> {
    pub config: C,
}

impl<C> ConfigProvider<C> for ProgrammaticConfigProvider<C>
where
    C: Default + DeserializeOwned + Clone + Serialize,
{
    fn load(&self) -> Result<C, ConfigProviderError> {
        Ok(self.config.clone())
    }
}

#[derive(Error, Debug)]
pub enum ConfigProviderError {
    #[error("Could not load config file. {message}")]
    Load { message: String },
}

impl ConfigProviderError {
    #[inline]
    pub(crate) fn load_error(msg: impl Into<String>) -> Self {
        Self::Load {
            message: msg.into(),
        }
    }
}
