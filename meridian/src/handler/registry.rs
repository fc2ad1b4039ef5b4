use crate::processor::{ProcessorId, SharedAsyncProcessor};
use dashmap::{DashMap, Entry};
use std::sync::Arc;
use thiserror::Error;

/// Builds a fresh processor instance for the given node id, so every route
/// referencing the same name owns its own instance.
pub type ProcessorFactory = Arc<dyn Fn(ProcessorId) -> SharedAsyncProcessor + Send + Sync>;

/// Errors that can occur during processor registry operations.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Processor factory '{name}' not found.")]
    MissingProcessor { name: String },

    #[error("Processor factory '{name}' already exists.")]
    ConflictingProcessor { name: String },
}

impl RegistryError {
    #[inline]
    pub(crate) fn missing_processor(name: impl Into<String>) -> Self {
        Self::MissingProcessor { name: name.into() }
    }

    #[inline]
    pub(crate) fn conflicting_processor(name: impl Into<String>) -> Self {
        Self::ConflictingProcessor { name: name.into() }
    }
}

/// A thread-safe name to processor factory lookup.
pub struct ProcessorRegistry {
    factories: DashMap<String, ProcessorFactory, fnv::FnvBuildHasher>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self {
            factories: DashMap::with_hasher(fnv::FnvBuildHasher::default()),
        }
    }

    /// Registers `factory` under `name`. Names are unique.
    pub fn register<F>(&self, name: impl Into<String>, factory: F) -> Result<(), RegistryError>
    where
        F: Fn(ProcessorId) -> SharedAsyncProcessor + Send + Sync + 'static,
    {
        match self.factories.entry(name.into()) {
            Entry::Occupied(entry) => Err(RegistryError::conflicting_processor(entry.key())),
            Entry::Vacant(entry) => {
                log::debug!("Registered processor factory '{}'", entry.key());
                entry.insert(Arc::new(factory));
                Ok(())
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Creates a new instance of the processor registered under `name`.
    pub fn create(&self, name: &str, id: ProcessorId) -> Result<SharedAsyncProcessor, RegistryError> {
        let factory = match self.factories.get(name) {
            None => return Err(RegistryError::missing_processor(name)),
            Some(factory) => factory.value().clone(),
        };
        Ok(factory(id))
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl Default for ProcessorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
