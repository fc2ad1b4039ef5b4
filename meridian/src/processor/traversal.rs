use crate::exchange::Exchange;
use crate::processor::{AsyncCallback, SharedAsyncProcessor};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

enum Slot<S> {
    Waiting,
    Completed(Exchange),
    Suspended(S),
    Taken,
}

/// Execute-once rendezvous between the loop that called a child's `process`
/// and the callback that child was given.
///
/// Whichever side arrives second receives the suspended state together with
/// the exchange and carries on with the traversal. When the callback fires
/// before `process` returns, the loop resumes inline; otherwise the callback's
/// thread does. The decision follows the actual order of events and ignores
/// the `bool` the child returned.
pub(crate) struct Handoff<S> {
    slot: Mutex<Slot<S>>,
}

impl<S> Handoff<S> {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Waiting),
        }
    }

    /// Called from the child's callback.
    pub(crate) fn complete(&self, exchange: Exchange) -> Option<(S, Exchange)> {
        let mut slot = self.slot.lock();
        match std::mem::replace(&mut *slot, Slot::Taken) {
            Slot::Waiting => {
                *slot = Slot::Completed(exchange);
                None
            }
            Slot::Suspended(state) => Some((state, exchange)),
            previous => {
                *slot = previous;
                log::error!(
                    "Exchange {} completed a step that was already completed; ignoring.",
                    exchange.uuid()
                );
                None
            }
        }
    }

    /// Called by the loop once the child's `process` returned.
    pub(crate) fn try_resume(&self, state: S) -> Option<(S, Exchange)> {
        let mut slot = self.slot.lock();
        match std::mem::replace(&mut *slot, Slot::Taken) {
            Slot::Completed(exchange) => Some((state, exchange)),
            Slot::Waiting => {
                *slot = Slot::Suspended(state);
                None
            }
            previous => {
                *slot = previous;
                log::error!("Traversal was resumed twice; dropping the second resumption.");
                None
            }
        }
    }
}

/// What a multi-stage processor wants to do next.
pub(crate) enum Advance {
    /// Hand `exchange` to `processor` and come back when it completes.
    Next(SharedAsyncProcessor, Exchange),
    /// Come back with `exchange` after `delay`, driven from `runtime`.
    Sleep {
        exchange: Exchange,
        delay: Duration,
        runtime: Handle,
    },
    /// The traversal is over.
    Done(Exchange),
}

/// The per-exchange state of a multi-stage processor.
///
/// `advance` is handed the exchange returned by the previous step (or the
/// incoming exchange on the first call) and decides the next step. `finish`
/// runs exactly once and must invoke the outer callback with `done_sync`.
pub(crate) trait Traversal: Send + Sized + 'static {
    fn advance(&mut self, exchange: Exchange) -> Advance;

    fn finish(self, exchange: Exchange, done_sync: bool);
}

/// Runs `traversal` until it finishes or suspends.
///
/// Returns the `done_sync` value that was, or will be, passed to the outer
/// callback: `true` only when every step completed inline.
pub(crate) fn drive<T>(mut traversal: T, mut exchange: Exchange, done_sync: bool) -> bool
where
    T: Traversal,
{
    loop {
        match traversal.advance(exchange) {
            Advance::Done(exchange) => {
                traversal.finish(exchange, done_sync);
                return done_sync;
            }
            Advance::Next(processor, next) => {
                let handoff = Arc::new(Handoff::new());
                let resume = handoff.clone();
                processor.process(
                    next,
                    AsyncCallback::new(move |exchange, _| {
                        if let Some((traversal, exchange)) = resume.complete(exchange) {
                            drive(traversal, exchange, false);
                        }
                    }),
                );
                match handoff.try_resume(traversal) {
                    Some((resumed, completed)) => {
                        traversal = resumed;
                        exchange = completed;
                    }
                    None => return false,
                }
            }
            Advance::Sleep {
                exchange,
                delay,
                runtime,
            } => {
                let parked = Parked {
                    state: Some((traversal, exchange)),
                };
                runtime.spawn(async move {
                    tokio::time::sleep(delay).await;
                    parked.resume();
                });
                return false;
            }
        }
    }
}

/// A traversal waiting on a timer. If the runtime drops it before the timer
/// fires, the exchange is interrupted and the traversal finished.
struct Parked<T: Traversal> {
    state: Option<(T, Exchange)>,
}

impl<T: Traversal> Parked<T> {
    fn resume(mut self) {
        if let Some((traversal, exchange)) = self.state.take() {
            drive(traversal, exchange, false);
        }
    }
}

impl<T: Traversal> Drop for Parked<T> {
    fn drop(&mut self) {
        if let Some((traversal, mut exchange)) = self.state.take() {
            log::warn!(
                "Runtime shut down while exchange {} was waiting to resume",
                exchange.uuid()
            );
            exchange.interrupt("runtime shut down while the exchange was waiting");
            traversal.finish(exchange, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handoff_callback_first_resumes_inline() {
        let handoff = Handoff::<u8>::new();
        assert!(handoff.complete(Exchange::new()).is_none());
        let (state, _) = handoff.try_resume(7).unwrap();
        assert_eq!(state, 7);
    }

    #[test]
    fn test_handoff_loop_first_resumes_in_callback() {
        let handoff = Handoff::<u8>::new();
        assert!(handoff.try_resume(7).is_none());
        let (state, _) = handoff.complete(Exchange::new()).unwrap();
        assert_eq!(state, 7);
    }

    #[test]
    fn test_handoff_rejects_second_completion() {
        let handoff = Handoff::<u8>::new();
        assert!(handoff.try_resume(1).is_none());
        assert!(handoff.complete(Exchange::new()).is_some());
        assert!(handoff.complete(Exchange::new()).is_none());
    }
}
