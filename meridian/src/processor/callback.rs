use crate::exchange::Exchange;
use crate::processor::AsyncProcessor;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::oneshot;

type CallbackFn = Box<dyn FnOnce(Exchange, bool) + Send>;

/// The continuation handed to [`AsyncProcessor::process`].
///
/// A callback is bound to exactly one traversal step. [`done`](AsyncCallback::done)
/// consumes it, so invoking it twice is rejected by the compiler rather than
/// guarded at runtime. The exchange travels back through the callback together
/// with `done_sync`, which is `true` when the step completed before `process`
/// returned.
///
/// Dropping a callback without calling `done` breaks the contract of the
/// processor that received it; the drop is logged as an error.
pub struct AsyncCallback {
    inner: Option<CallbackFn>,
}

impl AsyncCallback {
    pub fn new(callback: impl FnOnce(Exchange, bool) + Send + 'static) -> Self {
        Self {
            inner: Some(Box::new(callback)),
        }
    }

    /// Signals completion of the step.
    pub fn done(mut self, exchange: Exchange, done_sync: bool) {
        if let Some(callback) = self.inner.take() {
            callback(exchange, done_sync);
        }
    }
}

impl Drop for AsyncCallback {
    fn drop(&mut self) {
        if self.inner.is_some() {
            log::error!("AsyncCallback dropped without being invoked; the exchange was lost.");
        }
    }
}

/// An exchange handed to a runtime together with its callback.
///
/// [`complete`](PendingExchange::complete) invokes the callback with
/// `done_sync == false`. If the runtime drops the pending exchange instead,
/// because it shut down before the task ran or while it was suspended, the
/// exchange is interrupted and the callback is invoked from the drop.
pub struct PendingExchange {
    processor: String,
    inner: Option<(Exchange, AsyncCallback)>,
}

impl PendingExchange {
    pub fn new(processor: impl Into<String>, exchange: Exchange, callback: AsyncCallback) -> Self {
        Self {
            processor: processor.into(),
            inner: Some((exchange, callback)),
        }
    }

    pub fn exchange_mut(&mut self) -> Option<&mut Exchange> {
        self.inner.as_mut().map(|(exchange, _)| exchange)
    }

    /// Hands the exchange and its callback on. The guard is disarmed.
    pub fn into_parts(mut self) -> Option<(Exchange, AsyncCallback)> {
        self.inner.take()
    }

    pub fn complete(mut self) {
        if let Some((exchange, callback)) = self.inner.take() {
            callback.done(exchange, false);
        }
    }
}

impl Drop for PendingExchange {
    fn drop(&mut self) {
        if let Some((mut exchange, callback)) = self.inner.take() {
            log::warn!(
                "Runtime of processor '{}' dropped exchange {} before it completed",
                self.processor,
                exchange.uuid()
            );
            exchange.interrupt(format!(
                "runtime of processor '{}' shut down",
                self.processor
            ));
            callback.done(exchange, false);
        }
    }
}

/// The outcome of a traversal as seen from a future.
#[derive(Debug)]
pub struct Completion {
    pub exchange: Exchange,
    pub done_sync: bool,
}

impl Completion {
    pub fn into_exchange(self) -> Exchange {
        self.exchange
    }
}

#[derive(Error, Debug)]
pub enum CompletionError {
    #[error("Processor '{processor}' dropped its callback without completing the exchange.")]
    Abandoned { processor: String },
}

/// A future resolving to the [`Completion`] of one traversal.
///
/// Backed by a oneshot channel that the callback completes exactly once.
pub struct CompletionFuture {
    receiver: oneshot::Receiver<Completion>,
    processor: String,
}

impl Future for CompletionFuture {
    type Output = Result<Completion, CompletionError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        match Pin::new(&mut this.receiver).poll(cx) {
            Poll::Ready(Ok(completion)) => Poll::Ready(Ok(completion)),
            Poll::Ready(Err(_)) => Poll::Ready(Err(CompletionError::Abandoned {
                processor: this.processor.clone(),
            })),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Bridges the callback contract to futures and to blocking callers.
pub trait AsyncProcessorExt: AsyncProcessor {
    /// Processes `exchange` and returns a future that resolves once the callback fires.
    fn process_async(&self, exchange: Exchange) -> CompletionFuture {
        let (sender, receiver) = oneshot::channel();
        self.process(exchange, completing(sender));
        CompletionFuture {
            receiver,
            processor: self.id().to_string(),
        }
    }

    /// Processes `exchange` and blocks the current thread until the callback fires.
    ///
    /// Must not be called from within an asynchronous execution context.
    fn process_blocking(&self, exchange: Exchange) -> Result<Completion, CompletionError> {
        let (sender, receiver) = oneshot::channel();
        self.process(exchange, completing(sender));
        receiver
            .blocking_recv()
            .map_err(|_| CompletionError::Abandoned {
                processor: self.id().to_string(),
            })
    }
}

fn completing(sender: oneshot::Sender<Completion>) -> AsyncCallback {
    AsyncCallback::new(move |exchange, done_sync| {
        // the receiver may have been dropped by a caller that gave up waiting
        let _ = sender.send(Completion {
            exchange,
            done_sync,
        });
    })
}

impl<P> AsyncProcessorExt for P where P: AsyncProcessor + ?Sized {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_done_invokes_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let callback = AsyncCallback::new(move |_, done_sync| {
            assert!(done_sync);
            counter.fetch_add(1, Ordering::SeqCst);
        });
        callback.done(Exchange::new(), true);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropped_pending_exchange_interrupts() {
        let (sender, receiver) = oneshot::channel();
        let pending = PendingExchange::new("worker", Exchange::new(), completing(sender));
        drop(pending);
        let completion = receiver.blocking_recv().unwrap();
        assert!(!completion.done_sync);
        assert!(completion.exchange.is_interrupted());
    }

    #[test]
    fn test_completed_pending_exchange_is_untouched() {
        let (sender, receiver) = oneshot::channel();
        let mut pending = PendingExchange::new("worker", Exchange::new(), completing(sender));
        pending
            .exchange_mut()
            .unwrap()
            .in_message_mut()
            .set_body(5u8);
        pending.complete();
        let completion = receiver.blocking_recv().unwrap();
        assert!(!completion.exchange.is_failed());
        assert_eq!(completion.exchange.in_message().body_as::<u8>(), Some(&5));
    }

    #[test]
    fn test_dropped_callback_does_not_invoke() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let callback = AsyncCallback::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        drop(callback);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
