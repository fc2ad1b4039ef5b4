use crate::exchange::Exchange;
use crate::processor::{
    AsyncCallback, AsyncProcessor, ConfigError, ProcessorId, ServiceError, SharedAsyncProcessor,
};
use std::sync::Arc;

/// Forwards every exchange to a single optional child.
///
/// Without a child the exchange passes through untouched and the callback is
/// completed synchronously. Policy processors (filters, error handlers,
/// unit-of-work scopes) are built around one of these.
pub struct DelegateAsyncProcessor {
    id: ProcessorId,
    processor: Option<SharedAsyncProcessor>,
}

impl DelegateAsyncProcessor {
    /// Fails with [`ConfigError::SelfDelegation`] when `processor` carries the
    /// same id as the delegate being built.
    pub fn new(
        id: impl Into<ProcessorId>,
        processor: Option<SharedAsyncProcessor>,
    ) -> Result<Self, ConfigError> {
        let id = id.into();
        if let Some(child) = &processor {
            if child.id() == &id {
                return Err(ConfigError::self_delegation(id));
            }
        }
        Ok(Self { id, processor })
    }

    pub fn processor(&self) -> Option<&SharedAsyncProcessor> {
        self.processor.as_ref()
    }

    pub fn has_processor(&self) -> bool {
        self.processor.is_some()
    }
}

impl AsyncProcessor for DelegateAsyncProcessor {
    fn process(&self, exchange: Exchange, callback: AsyncCallback) -> bool {
        match &self.processor {
            Some(processor) => processor.process(exchange, callback),
            None => {
                callback.done(exchange, true);
                true
            }
        }
    }

    fn id(&self) -> &ProcessorId {
        &self.id
    }

    fn start(&self) -> Result<(), ServiceError> {
        match &self.processor {
            Some(processor) => processor.start(),
            None => Ok(()),
        }
    }

    fn stop(&self) -> Result<(), ServiceError> {
        match &self.processor {
            Some(processor) => processor.stop(),
            None => Ok(()),
        }
    }

    fn children(&self) -> Vec<SharedAsyncProcessor> {
        self.processor.iter().map(Arc::clone).collect()
    }
}
