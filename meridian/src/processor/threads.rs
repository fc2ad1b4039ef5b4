use crate::exchange::{Exchange, ProcessingError};
use crate::processor::{AsyncCallback, AsyncProcessor, PendingExchange, ProcessorId, ServiceError};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::runtime::Handle;

/// Moves the rest of the traversal onto the runtime's blocking pool.
///
/// `process` always returns `false` while running; the callback is invoked
/// from a pool thread. Once stopped, exchanges are rejected synchronously with
/// [`ProcessingError::Rejected`].
pub struct ThreadsProcessor {
    id: ProcessorId,
    runtime: Handle,
    shutdown: AtomicBool,
}

impl ThreadsProcessor {
    pub fn new(id: impl Into<ProcessorId>, runtime: Handle) -> Self {
        Self {
            id: id.into(),
            runtime,
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

impl AsyncProcessor for ThreadsProcessor {
    fn process(&self, mut exchange: Exchange, callback: AsyncCallback) -> bool {
        if self.is_shutdown() {
            log::warn!(
                "Threads processor '{}' is stopped; rejecting exchange {}",
                self.id,
                exchange.uuid()
            );
            exchange.set_exception(ProcessingError::rejected(self.id.as_str()));
            callback.done(exchange, true);
            return true;
        }
        let pending = PendingExchange::new(self.id.as_str(), exchange, callback);
        self.runtime.spawn_blocking(move || pending.complete());
        false
    }

    fn id(&self) -> &ProcessorId {
        &self.id
    }

    fn start(&self) -> Result<(), ServiceError> {
        self.shutdown.store(false, Ordering::Release);
        Ok(())
    }

    fn stop(&self) -> Result<(), ServiceError> {
        self.shutdown.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::AsyncProcessorExt;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_hands_off_to_runtime() {
        let processor = ThreadsProcessor::new("threads", Handle::current());
        let completion = processor.process_async(Exchange::new()).await.unwrap();
        assert!(!completion.done_sync);
        assert!(!completion.exchange.is_failed());
    }

    #[tokio::test]
    async fn test_stopped_processor_rejects_synchronously() {
        let processor = ThreadsProcessor::new("threads", Handle::current());
        processor.stop().unwrap();
        let completion = processor.process_async(Exchange::new()).await.unwrap();
        assert!(completion.done_sync);
        assert!(matches!(
            completion.exchange.exception(),
            Some(ProcessingError::Rejected { .. })
        ));
    }

    #[test]
    fn test_shut_down_runtime_still_completes_exchange() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let handle = runtime.handle().clone();
        drop(runtime);

        let processor = ThreadsProcessor::new("threads", handle);
        let completion = processor.process_blocking(Exchange::new()).unwrap();
        assert!(completion.exchange.is_interrupted());
        assert!(matches!(
            completion.exchange.exception(),
            Some(ProcessingError::Interrupted { .. })
        ));
    }
}
