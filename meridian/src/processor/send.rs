use crate::component::Endpoint;
use crate::exchange::{Exchange, ProcessingError};
use crate::processor::{AsyncCallback, AsyncProcessor, ProcessorId, ServiceError, SharedAsyncProcessor};
use parking_lot::RwLock;
use std::sync::Arc;

/// Sends the exchange to an endpoint through a producer created when the
/// processor starts.
pub struct SendProcessor {
    id: ProcessorId,
    endpoint: Arc<dyn Endpoint>,
    producer: RwLock<Option<SharedAsyncProcessor>>,
}

impl SendProcessor {
    pub fn new(id: impl Into<ProcessorId>, endpoint: Arc<dyn Endpoint>) -> Self {
        Self {
            id: id.into(),
            endpoint,
            producer: RwLock::new(None),
        }
    }

    pub fn endpoint_uri(&self) -> &str {
        self.endpoint.uri()
    }
}

impl AsyncProcessor for SendProcessor {
    fn process(&self, mut exchange: Exchange, callback: AsyncCallback) -> bool {
        let producer = self.producer.read().clone();
        match producer {
            Some(producer) => producer.process(exchange, callback),
            None => {
                log::warn!(
                    "Send processor '{}' to '{}' is not started; rejecting exchange {}",
                    self.id,
                    self.endpoint.uri(),
                    exchange.uuid()
                );
                exchange.set_exception(ProcessingError::rejected(self.id.as_str()));
                callback.done(exchange, true);
                true
            }
        }
    }

    fn id(&self) -> &ProcessorId {
        &self.id
    }

    fn start(&self) -> Result<(), ServiceError> {
        let mut producer = self.producer.write();
        if producer.is_some() {
            return Ok(());
        }
        let created = self
            .endpoint
            .create_producer()
            .map_err(|e| ServiceError::start(&self.id, e.to_string()))?;
        created.start()?;
        *producer = Some(created);
        Ok(())
    }

    fn stop(&self) -> Result<(), ServiceError> {
        match self.producer.write().take() {
            Some(producer) => producer.stop(),
            None => Ok(()),
        }
    }
}
