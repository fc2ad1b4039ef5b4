use crate::exchange::Exchange;
use crate::processor::traversal::{Advance, Traversal, drive};
use crate::processor::{
    AsyncCallback, AsyncProcessor, ProcessorId, ServiceError, SharedAsyncProcessor, start_all,
    stop_all,
};
use crate::status::ExchangeState;
use std::sync::Arc;

/// Runs its children one after the other on the same exchange.
///
/// Before every stage but the first, the pipeline stops early if the exchange
/// failed, was handled by an error handler or was marked to stop the route,
/// and otherwise promotes the outbound
/// message of the previous stage to the inbound message of the next.
pub struct Pipeline {
    id: ProcessorId,
    processors: Arc<[SharedAsyncProcessor]>,
}

impl Pipeline {
    pub fn new(id: impl Into<ProcessorId>, processors: Vec<SharedAsyncProcessor>) -> Self {
        Self {
            id: id.into(),
            processors: processors.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}

struct PipelineTraversal {
    processors: Arc<[SharedAsyncProcessor]>,
    next: usize,
    callback: AsyncCallback,
}

impl PipelineTraversal {
    fn should_continue(&self, exchange: &Exchange) -> bool {
        let handled = exchange
            .state()
            .any_flags(ExchangeState::ERROR_HANDLER_HANDLED);
        if exchange.is_failed() || exchange.is_route_stop() || handled {
            log::trace!(
                "Pipeline stops before stage {} for exchange {} (failed: {}, route stop: {}, handled: {})",
                self.next,
                exchange.uuid(),
                exchange.is_failed(),
                exchange.is_route_stop(),
                handled
            );
            return false;
        }
        true
    }
}

impl Traversal for PipelineTraversal {
    fn advance(&mut self, mut exchange: Exchange) -> Advance {
        let Some(processor) = self.processors.get(self.next).cloned() else {
            return Advance::Done(exchange);
        };
        if self.next > 0 {
            if !self.should_continue(&exchange) {
                return Advance::Done(exchange);
            }
            exchange.prepare_next();
        }
        self.next += 1;
        Advance::Next(processor, exchange)
    }

    fn finish(self, exchange: Exchange, done_sync: bool) {
        self.callback.done(exchange, done_sync);
    }
}

impl AsyncProcessor for Pipeline {
    fn process(&self, exchange: Exchange, callback: AsyncCallback) -> bool {
        let traversal = PipelineTraversal {
            processors: self.processors.clone(),
            next: 0,
            callback,
        };
        drive(traversal, exchange, true)
    }

    fn id(&self) -> &ProcessorId {
        &self.id
    }

    fn start(&self) -> Result<(), ServiceError> {
        log::debug!("Starting pipeline '{}' with {} stage(s)", self.id, self.processors.len());
        start_all(&self.processors)
    }

    fn stop(&self) -> Result<(), ServiceError> {
        log::debug!("Stopping pipeline '{}'", self.id);
        match stop_all(&self.processors) {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    fn children(&self) -> Vec<SharedAsyncProcessor> {
        self.processors.to_vec()
    }
}
