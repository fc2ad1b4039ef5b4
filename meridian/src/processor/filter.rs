use crate::exchange::Exchange;
use crate::processor::{
    AsyncCallback, AsyncProcessor, ConfigError, DelegateAsyncProcessor, ProcessorId, ServiceError,
    SharedAsyncProcessor,
};
use std::sync::Arc;

/// Decides whether an exchange matches.
pub trait Predicate: Send + Sync {
    fn matches(&self, exchange: &Exchange) -> bool;
}

impl<F> Predicate for F
where
    F: Fn(&Exchange) -> bool + Send + Sync,
{
    fn matches(&self, exchange: &Exchange) -> bool {
        self(exchange)
    }
}

/// Sends the exchange to its child only when the predicate matches. A
/// non-matching exchange completes synchronously and unchanged.
pub struct FilterProcessor {
    delegate: DelegateAsyncProcessor,
    predicate: Arc<dyn Predicate>,
}

impl FilterProcessor {
    pub fn new(
        id: impl Into<ProcessorId>,
        predicate: Arc<dyn Predicate>,
        processor: SharedAsyncProcessor,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            delegate: DelegateAsyncProcessor::new(id, Some(processor))?,
            predicate,
        })
    }
}

impl AsyncProcessor for FilterProcessor {
    fn process(&self, exchange: Exchange, callback: AsyncCallback) -> bool {
        if self.predicate.matches(&exchange) {
            return self.delegate.process(exchange, callback);
        }
        log::trace!(
            "Filter '{}' did not match exchange {}",
            self.delegate.id(),
            exchange.uuid()
        );
        callback.done(exchange, true);
        true
    }

    fn id(&self) -> &ProcessorId {
        self.delegate.id()
    }

    fn start(&self) -> Result<(), ServiceError> {
        self.delegate.start()
    }

    fn stop(&self) -> Result<(), ServiceError> {
        self.delegate.stop()
    }

    fn children(&self) -> Vec<SharedAsyncProcessor> {
        self.delegate.children()
    }
}
