pub mod direct;

pub use direct::DirectComponent;

use crate::exchange::Exchange;
use crate::processor::{ConfigError, ServiceError, SharedAsyncProcessor};
use dashmap::{DashMap, Entry};
use fnv::FnvBuildHasher;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use thiserror::Error;

pub type Parameters = HashMap<String, String, FnvBuildHasher>;

/// A factory for endpoints of one URI scheme.
pub trait Component: Send + Sync {
    /// Creates the endpoint for `uri`. `remaining` is the part after the
    /// scheme, without query parameters.
    fn create_endpoint(
        &self,
        uri: &str,
        remaining: &str,
        parameters: &Parameters,
    ) -> Result<Arc<dyn Endpoint>, ComponentError>;
}

pub trait Endpoint: Send + Sync {
    fn uri(&self) -> &str;

    /// A fresh exchange originating from this endpoint.
    fn create_exchange(&self) -> Exchange {
        let mut exchange = Exchange::new();
        exchange.set_from_endpoint(self.uri());
        exchange
    }

    /// The processor that sends exchanges to this endpoint.
    fn create_producer(&self) -> Result<SharedAsyncProcessor, ComponentError>;

    /// A consumer that pushes exchanges arriving at this endpoint into `processor`.
    fn create_consumer(
        &self,
        processor: SharedAsyncProcessor,
    ) -> Result<Box<dyn Consumer>, ComponentError>;
}

/// The intake side of a route.
pub trait Consumer: Send + Sync {
    fn endpoint_uri(&self) -> &str;

    fn start(&self) -> Result<(), ServiceError>;

    fn stop(&self) -> Result<(), ServiceError>;
}

/// A parsed `scheme:path?key=value&key2=value2` endpoint URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointUri {
    scheme: String,
    path: String,
    parameters: Parameters,
}

impl EndpointUri {
    pub fn parse(uri: &str) -> Result<Self, ComponentError> {
        let uri = uri.trim();
        let Some((scheme, rest)) = uri.split_once(':') else {
            return Err(ComponentError::invalid_uri(uri, "missing scheme"));
        };
        if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(ComponentError::invalid_uri(uri, "invalid scheme"));
        }
        let (path, query) = match rest.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (rest, None),
        };
        let path = path.trim_start_matches("//");

        let mut parameters = Parameters::default();
        if let Some(query) = query {
            for pair in query.split('&').filter(|pair| !pair.is_empty()) {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                if key.is_empty() {
                    return Err(ComponentError::invalid_uri(uri, "empty parameter name"));
                }
                parameters.insert(key.to_string(), value.to_string());
            }
        }

        Ok(Self {
            scheme: scheme.to_string(),
            path: path.to_string(),
            parameters,
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }
}

impl Display for EndpointUri {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.scheme, self.path)?;
        let mut keys: Vec<&String> = self.parameters.keys().collect();
        keys.sort();
        for (i, key) in keys.into_iter().enumerate() {
            let separator = if i == 0 { '?' } else { '&' };
            write!(f, "{}{}={}", separator, key, self.parameters[key])?;
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum ComponentError {
    #[error("No component registered for scheme '{scheme}'.")]
    UnknownComponent { scheme: String },

    #[error("A component is already registered for scheme '{scheme}'.")]
    ConflictingComponent { scheme: String },

    #[error("Invalid endpoint URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("Failed to create endpoint '{uri}': {message}")]
    EndpointCreation { uri: String, message: String },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ComponentError {
    #[inline]
    pub fn unknown_component(scheme: impl Into<String>) -> Self {
        Self::UnknownComponent {
            scheme: scheme.into(),
        }
    }

    #[inline]
    pub fn conflicting_component(scheme: impl Into<String>) -> Self {
        Self::ConflictingComponent {
            scheme: scheme.into(),
        }
    }

    #[inline]
    pub fn invalid_uri(uri: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUri {
            uri: uri.into(),
            reason: reason.into(),
        }
    }

    #[inline]
    pub fn endpoint_creation(uri: impl Into<String>, message: impl Into<String>) -> Self {
        Self::EndpointCreation {
            uri: uri.into(),
            message: message.into(),
        }
    }
}

/// Explicit scheme to component lookup, with one cached endpoint per URI.
pub struct ComponentRegistry {
    components: DashMap<String, Arc<dyn Component>, FnvBuildHasher>,
    endpoints: DashMap<String, Arc<dyn Endpoint>, FnvBuildHasher>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self {
            components: DashMap::with_hasher(FnvBuildHasher::default()),
            endpoints: DashMap::with_hasher(FnvBuildHasher::default()),
        }
    }

    /// A registry with the built-in `direct` component.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry
            .components
            .insert(String::from("direct"), Arc::new(DirectComponent::new()));
        registry
    }

    pub fn register(
        &self,
        scheme: impl Into<String>,
        component: Arc<dyn Component>,
    ) -> Result<(), ComponentError> {
        let scheme = scheme.into();
        match self.components.entry(scheme) {
            Entry::Occupied(entry) => Err(ComponentError::conflicting_component(entry.key())),
            Entry::Vacant(entry) => {
                log::debug!("Registered component for scheme '{}'", entry.key());
                entry.insert(component);
                Ok(())
            }
        }
    }

    pub fn component(&self, scheme: &str) -> Result<Arc<dyn Component>, ComponentError> {
        match self.components.get(scheme) {
            Some(component) => Ok(component.value().clone()),
            None => Err(ComponentError::unknown_component(scheme)),
        }
    }

    /// Returns the endpoint for `uri`, creating and caching it on first use.
    pub fn resolve_endpoint(&self, uri: &str) -> Result<Arc<dyn Endpoint>, ComponentError> {
        let parsed = EndpointUri::parse(uri)?;
        let key = parsed.to_string();
        if let Some(endpoint) = self.endpoints.get(&key) {
            return Ok(endpoint.value().clone());
        }

        let component = self.component(parsed.scheme())?;
        let endpoint = component.create_endpoint(&key, parsed.path(), parsed.parameters())?;
        let endpoint = self.endpoints.entry(key).or_insert(endpoint).value().clone();
        log::debug!("Resolved endpoint '{}'", endpoint.uri());
        Ok(endpoint)
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_uri_with_parameters() {
        let uri = EndpointUri::parse("timer://tick?period=10&fixedRate").unwrap();
        assert_eq!(uri.scheme(), "timer");
        assert_eq!(uri.path(), "tick");
        assert_eq!(uri.parameter("period"), Some("10"));
        assert_eq!(uri.parameter("fixedRate"), Some(""));
        assert_eq!(uri.to_string(), "timer:tick?fixedRate=&period=10");
    }

    #[test]
    fn test_parse_uri_rejects_missing_scheme() {
        assert!(matches!(
            EndpointUri::parse("no-scheme-here"),
            Err(ComponentError::InvalidUri { .. })
        ));
        assert!(matches!(
            EndpointUri::parse(":orders"),
            Err(ComponentError::InvalidUri { .. })
        ));
    }

    #[test]
    fn test_unknown_scheme_is_deterministic_error() {
        let registry = ComponentRegistry::with_defaults();
        match registry.resolve_endpoint("kafka:orders") {
            Err(ComponentError::UnknownComponent { scheme }) => assert_eq!(scheme, "kafka"),
            other => panic!("unexpected result {:?}", other.err()),
        }
    }

    #[test]
    fn test_endpoints_are_cached_per_uri() {
        let registry = ComponentRegistry::with_defaults();
        let first = registry.resolve_endpoint("direct:orders").unwrap();
        let second = registry.resolve_endpoint("direct://orders").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.endpoint_count(), 1);
    }

    #[test]
    fn test_conflicting_registration() {
        let registry = ComponentRegistry::with_defaults();
        assert!(matches!(
            registry.register("direct", Arc::new(DirectComponent::new())),
            Err(ComponentError::ConflictingComponent { .. })
        ));
    }
}
