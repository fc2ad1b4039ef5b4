use crate::exchange::Exchange;
use crate::processor::{
    AsyncCallback, AsyncProcessor, ConfigError, DelegateAsyncProcessor, ProcessorId, ServiceError,
    SharedAsyncProcessor,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// Counts the exchanges currently traversing a route.
#[derive(Default)]
pub struct InflightRepository {
    count: AtomicUsize,
    drained: Notify,
}

impl InflightRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    fn add(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    fn remove(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }

    /// Waits until no exchange is inflight. Returns `false` if `timeout`
    /// elapsed first.
    pub async fn wait_drained(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                // registered before the check so a concurrent notify is not missed
                let notified = self.drained.notified();
                if self.count() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

/// The head of every route: tracks inflight exchanges and stamps the
/// exchange with the context it runs in.
pub struct InflightProcessor {
    delegate: DelegateAsyncProcessor,
    repository: Arc<InflightRepository>,
    context_name: Arc<str>,
}

impl InflightProcessor {
    pub fn new(
        id: impl Into<ProcessorId>,
        repository: Arc<InflightRepository>,
        context_name: Arc<str>,
        processor: SharedAsyncProcessor,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            delegate: DelegateAsyncProcessor::new(id, Some(processor))?,
            repository,
            context_name,
        })
    }
}

impl AsyncProcessor for InflightProcessor {
    fn process(&self, mut exchange: Exchange, callback: AsyncCallback) -> bool {
        if exchange.context_name().is_none() {
            exchange.set_context_name(self.context_name.clone());
        }
        self.repository.add();
        let repository = self.repository.clone();
        self.delegate.process(
            exchange,
            AsyncCallback::new(move |exchange, done_sync| {
                callback.done(exchange, done_sync);
                repository.remove();
            }),
        )
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
