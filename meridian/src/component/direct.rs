use crate::component::{Component, ComponentError, Consumer, Endpoint, Parameters};
use crate::exchange::{Exchange, ProcessingError};
use crate::processor::{
    AsyncCallback, AsyncProcessor, ConfigError, ProcessorId, ServiceError, SharedAsyncProcessor,
};
use dashmap::{DashMap, Entry};
use fnv::FnvBuildHasher;
use std::sync::Arc;

type Consumers = Arc<DashMap<String, SharedAsyncProcessor, FnvBuildHasher>>;

/// Synchronous in-memory hand-over between a producer and the consumer of
/// the same `direct:name`.
pub struct DirectComponent {
    consumers: Consumers,
}

impl DirectComponent {
    pub fn new() -> Self {
        Self {
            consumers: Arc::new(DashMap::with_hasher(FnvBuildHasher::default())),
        }
    }
}

impl Default for DirectComponent {
    fn default() -> Self {
        Self::new()
    }
}

impl Component for DirectComponent {
    fn create_endpoint(
        &self,
        uri: &str,
        remaining: &str,
        _parameters: &Parameters,
    ) -> Result<Arc<dyn Endpoint>, ComponentError> {
        if remaining.is_empty() {
            return Err(ConfigError::missing_parameter(uri, "name").into());
        }
        Ok(Arc::new(DirectEndpoint {
            uri: uri.to_string(),
            name: remaining.to_string(),
            consumers: self.consumers.clone(),
        }))
    }
}

pub struct DirectEndpoint {
    uri: String,
    name: String,
    consumers: Consumers,
}

impl DirectEndpoint {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Endpoint for DirectEndpoint {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn create_producer(&self) -> Result<SharedAsyncProcessor, ComponentError> {
        Ok(Arc::new(DirectProducer {
            id: ProcessorId::new(format!("{}-producer", self.uri)),
            uri: self.uri.clone(),
            name: self.name.clone(),
            consumers: self.consumers.clone(),
        }))
    }

    fn create_consumer(
        &self,
        processor: SharedAsyncProcessor,
    ) -> Result<Box<dyn Consumer>, ComponentError> {
        Ok(Box::new(DirectConsumer {
            uri: self.uri.clone(),
            name: self.name.clone(),
            processor,
            consumers: self.consumers.clone(),
        }))
    }
}

struct DirectProducer {
    id: ProcessorId,
    uri: String,
    name: String,
    consumers: Consumers,
}

impl AsyncProcessor for DirectProducer {
    fn process(&self, mut exchange: Exchange, callback: AsyncCallback) -> bool {
        // clone out of the map so the shard lock is not held during processing
        let consumer = self.consumers.get(&self.name).map(|c| c.value().clone());
        match consumer {
            Some(consumer) => consumer.process(exchange, callback),
            None => {
                log::warn!(
                    "No consumer on endpoint '{}' for exchange {}",
                    self.uri,
                    exchange.uuid()
                );
                exchange.set_exception(ProcessingError::no_consumer(&self.uri));
                callback.done(exchange, true);
                true
            }
        }
    }

    fn id(&self) -> &ProcessorId {
        &self.id
    }
}

struct DirectConsumer {
    uri: String,
    name: String,
    processor: SharedAsyncProcessor,
    consumers: Consumers,
}

impl Consumer for DirectConsumer {
    fn endpoint_uri(&self) -> &str {
        &self.uri
    }

    fn start(&self) -> Result<(), ServiceError> {
        match self.consumers.entry(self.name.clone()) {
            Entry::Occupied(_) => Err(ServiceError::start(
                &self.uri,
                "a consumer is already attached to this endpoint",
            )),
            Entry::Vacant(entry) => {
                entry.insert(self.processor.clone());
                log::debug!("Consumer attached to '{}'", self.uri);
                Ok(())
            }
        }
    }

    fn stop(&self) -> Result<(), ServiceError> {
        self.consumers
            .remove_if(&self.name, |_, processor| Arc::ptr_eq(processor, &self.processor));
        log::debug!("Consumer detached from '{}'", self.uri);
        Ok(())
    }
}
