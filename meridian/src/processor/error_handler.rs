use crate::exchange::Exchange;
use crate::processor::traversal::{Advance, Traversal, drive};
use crate::processor::{
    AsyncCallback, AsyncProcessor, ConfigError, DelegateAsyncProcessor, ProcessorId, ServiceError,
    SharedAsyncProcessor, start_all, stop_all,
};
use crate::status::ExchangeState;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

/// How often and how fast a failed exchange is redelivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedeliveryPolicy {
    pub maximum_redeliveries: u32,
    pub redelivery_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub maximum_redelivery_delay_ms: u64,
}

impl RedeliveryPolicy {
    /// The delay before redelivery number `attempt` (starting at 1).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if self.redelivery_delay_ms == 0 {
            return Duration::ZERO;
        }
        let multiplier = self.backoff_multiplier.max(1.0);
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay = self.redelivery_delay_ms as f64 * multiplier.powi(exponent);
        let capped = delay.min(self.maximum_redelivery_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            maximum_redeliveries: 0,
            redelivery_delay_ms: 1000,
            backoff_multiplier: 2.0,
            maximum_redelivery_delay_ms: 60_000,
        }
    }
}

/// Redelivers failed exchanges to its child according to a [`RedeliveryPolicy`].
///
/// An exchange that comes back already marked as redelivery exhausted or unit
/// of work exhausted is not redelivered again.
///
/// When redelivery is exhausted the exchange is marked
/// [`REDELIVERY_EXHAUSTED`](ExchangeState::REDELIVERY_EXHAUSTED). Inside a sub
/// unit of work the scope is told through `on_exhausted` and the failure stays
/// on the exchange. Otherwise, if a dead letter processor is configured, the
/// exception is moved to `caught_exception` and the exchange is handed to it.
pub struct ErrorHandlerProcessor {
    delegate: Arc<DelegateAsyncProcessor>,
    policy: RedeliveryPolicy,
    dead_letter: Option<SharedAsyncProcessor>,
    runtime: Option<Handle>,
}

impl ErrorHandlerProcessor {
    pub fn new(
        id: impl Into<ProcessorId>,
        processor: SharedAsyncProcessor,
        policy: RedeliveryPolicy,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            delegate: Arc::new(DelegateAsyncProcessor::new(id, Some(processor))?),
            policy,
            dead_letter: None,
            runtime: None,
        })
    }

    pub fn with_dead_letter(mut self, processor: SharedAsyncProcessor) -> Self {
        self.dead_letter = Some(processor);
        self
    }

    /// The runtime redelivery delays are scheduled on. Defaults to the runtime
    /// of the calling thread, if there is one.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn policy(&self) -> &RedeliveryPolicy {
        &self.policy
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    Deliver,
    Delivered,
    DeadLetter,
}

struct RedeliveryTraversal {
    delegate: SharedAsyncProcessor,
    dead_letter: Option<SharedAsyncProcessor>,
    policy: RedeliveryPolicy,
    runtime: Option<Handle>,
    phase: Phase,
    redeliveries: u32,
    callback: AsyncCallback,
}

impl RedeliveryTraversal {
    fn exhausted(&mut self, mut exchange: Exchange) -> Advance {
        exchange.state_mut().set(ExchangeState::REDELIVERY_EXHAUSTED);

        let sub_unit_callback = exchange
            .unit_of_work()
            .and_then(|unit_of_work| unit_of_work.sub_unit_of_work_callback());
        if let Some(callback) = sub_unit_callback {
            log::debug!(
                "Redelivery exhausted for exchange {} inside a sub unit of work",
                exchange.uuid()
            );
            callback.on_exhausted(&exchange);
            return Advance::Done(exchange);
        }

        match self.dead_letter.clone() {
            Some(dead_letter) => {
                log::warn!(
                    "Redelivery exhausted after {} attempt(s) for exchange {}; moving it to '{}'",
                    self.redeliveries,
                    exchange.uuid(),
                    dead_letter.id()
                );
                let caught = exchange.take_exception();
                exchange.properties_mut().set_caught_exception(caught);
                exchange
                    .state_mut()
                    .set(ExchangeState::FAILURE_HANDLED | ExchangeState::ERROR_HANDLER_HANDLED);
                self.phase = Phase::DeadLetter;
                Advance::Next(dead_letter, exchange)
            }
            None => {
                log::warn!(
                    "Redelivery exhausted after {} attempt(s) for exchange {}",
                    self.redeliveries,
                    exchange.uuid()
                );
                Advance::Done(exchange)
            }
        }
    }
}

impl Traversal for RedeliveryTraversal {
    fn advance(&mut self, mut exchange: Exchange) -> Advance {
        match self.phase {
            Phase::Deliver => {
                self.phase = Phase::Delivered;
                Advance::Next(self.delegate.clone(), exchange)
            }
            Phase::DeadLetter => Advance::Done(exchange),
            Phase::Delivered => {
                if !exchange.is_failed() || exchange.is_interrupted() {
                    return Advance::Done(exchange);
                }
                // an inner error handler or a failed sub unit of work already gave up
                let exhausted_inside = exchange.state().any_flags(
                    ExchangeState::REDELIVERY_EXHAUSTED | ExchangeState::UNIT_OF_WORK_EXHAUSTED,
                );
                if exhausted_inside || self.redeliveries >= self.policy.maximum_redeliveries {
                    return self.exhausted(exchange);
                }

                self.redeliveries += 1;
                let failure = exchange.take_exception();
                exchange.state_mut().set(ExchangeState::REDELIVERED);
                exchange
                    .properties_mut()
                    .set_redelivery_counter(self.redeliveries);
                log::debug!(
                    "Redelivery attempt {}/{} for exchange {} after: {}",
                    self.redeliveries,
                    self.policy.maximum_redeliveries,
                    exchange.uuid(),
                    failure.map(|e| e.to_string()).unwrap_or_default()
                );

                let delay = self.policy.delay_for(self.redeliveries);
                let runtime = self.runtime.clone().or_else(|| Handle::try_current().ok());
                match runtime {
                    Some(runtime) if !delay.is_zero() => {
                        self.phase = Phase::Deliver;
                        Advance::Sleep {
                            exchange,
                            delay,
                            runtime,
                        }
                    }
                    None if !delay.is_zero() => {
                        log::warn!(
                            "No runtime to wait {:?} on before redelivering exchange {}; redelivering now",
                            delay,
                            exchange.uuid()
                        );
                        Advance::Next(self.delegate.clone(), exchange)
                    }
                    _ => Advance::Next(self.delegate.clone(), exchange),
                }
            }
        }
    }

    fn finish(self, exchange: Exchange, done_sync: bool) {
        self.callback.done(exchange, done_sync);
    }
}

impl AsyncProcessor for ErrorHandlerProcessor {
    fn process(&self, exchange: Exchange, callback: AsyncCallback) -> bool {
        let traversal = RedeliveryTraversal {
            delegate: self.delegate.clone(),
            dead_letter: self.dead_letter.clone(),
            policy: self.policy.clone(),
            runtime: self.runtime.clone(),
            phase: Phase::Deliver,
            redeliveries: 0,
            callback,
        };
        drive(traversal, exchange, true)
    }

    fn id(&self) -> &ProcessorId {
        self.delegate.id()
    }

    fn start(&self) -> Result<(), ServiceError> {
        let mut processors = self.delegate.children();
        processors.extend(self.dead_letter.iter().cloned());
        start_all(&processors)
    }

    fn stop(&self) -> Result<(), ServiceError> {
        let mut processors = self.delegate.children();
        processors.extend(self.dead_letter.iter().cloned());
        match stop_all(&processors) {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    fn children(&self) -> Vec<SharedAsyncProcessor> {
        let mut children = self.delegate.children();
        children.extend(self.dead_letter.iter().cloned());
        children
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{BoxError, ProcessingError};
    use crate::processor::{AsyncProcessorExt, processor_fn, to_async};
    use crate::uow::{DefaultUnitOfWork, UnitOfWork};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn flaky(failures: u32, attempts: &Arc<AtomicU32>) -> SharedAsyncProcessor {
        let attempts = attempts.clone();
        to_async(
            "flaky",
            processor_fn(move |_: &mut Exchange| -> Result<(), BoxError> {
                if attempts.fetch_add(1, Ordering::SeqCst) < failures {
                    return Err("temporarily unavailable".into());
                }
                Ok(())
            }),
        )
    }

    fn immediate(maximum_redeliveries: u32) -> RedeliveryPolicy {
        RedeliveryPolicy {
            maximum_redeliveries,
            redelivery_delay_ms: 0,
            ..RedeliveryPolicy::default()
        }
    }

    #[test]
    fn test_delay_backs_off_and_caps() {
        let policy = RedeliveryPolicy {
            maximum_redeliveries: 5,
            redelivery_delay_ms: 100,
            backoff_multiplier: 2.0,
            maximum_redelivery_delay_ms: 300,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(300));
        assert_eq!(immediate(3).delay_for(2), Duration::ZERO);
    }

    #[test]
    fn test_redelivers_until_success() {
        let attempts = Arc::new(AtomicU32::new(0));
        let handler =
            ErrorHandlerProcessor::new("errors", flaky(2, &attempts), immediate(3)).unwrap();
        let completion = handler.process_blocking(Exchange::new()).unwrap();
        assert!(completion.done_sync);
        assert!(!completion.exchange.is_failed());
        assert_eq!(completion.exchange.properties().redelivery_counter(), 2);
        assert!(completion.exchange.state().any_flags(ExchangeState::REDELIVERED));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_exhausted_without_dead_letter_keeps_exception() {
        let attempts = Arc::new(AtomicU32::new(0));
        let handler =
            ErrorHandlerProcessor::new("errors", flaky(10, &attempts), immediate(2)).unwrap();
        let completion = handler.process_blocking(Exchange::new()).unwrap();
        assert!(completion.exchange.is_failed());
        assert!(completion
            .exchange
            .state()
            .any_flags(ExchangeState::REDELIVERY_EXHAUSTED));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_exhausted_goes_to_dead_letter() {
        let attempts = Arc::new(AtomicU32::new(0));
        let dead_letters = Arc::new(AtomicU32::new(0));
        let counter = dead_letters.clone();
        let dead_letter = to_async(
            "dead-letter",
            processor_fn(move |exchange: &mut Exchange| -> Result<(), BoxError> {
                assert!(exchange.properties().caught_exception().is_some());
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        let handler = ErrorHandlerProcessor::new("errors", flaky(10, &attempts), immediate(1))
            .unwrap()
            .with_dead_letter(dead_letter);
        let completion = handler.process_blocking(Exchange::new()).unwrap();
        let exchange = completion.exchange;
        assert!(!exchange.is_failed());
        assert!(matches!(
            exchange.properties().caught_exception(),
            Some(ProcessingError::Failed { .. })
        ));
        assert!(exchange.state().any_flags(ExchangeState::FAILURE_HANDLED));
        assert_eq!(dead_letters.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_exhausted_inside_sub_unit_of_work_marks_rollback() {
        let attempts = Arc::new(AtomicU32::new(0));
        let dead_letters = Arc::new(AtomicU32::new(0));
        let counter = dead_letters.clone();
        let dead_letter = to_async(
            "dead-letter",
            processor_fn(move |_: &mut Exchange| -> Result<(), BoxError> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        let handler = ErrorHandlerProcessor::new("errors", flaky(10, &attempts), immediate(0))
            .unwrap()
            .with_dead_letter(dead_letter);

        let mut exchange = Exchange::new();
        let mut unit_of_work = DefaultUnitOfWork::new(&exchange);
        unit_of_work.begin_sub_unit_of_work(&exchange);
        exchange.set_unit_of_work(Box::new(unit_of_work));

        let mut exchange = handler.process_blocking(exchange).unwrap().exchange;
        assert_eq!(dead_letters.load(Ordering::SeqCst), 0);
        assert!(exchange.is_failed());

        exchange.with_unit_of_work(|unit_of_work, exchange| {
            unit_of_work.end_sub_unit_of_work(exchange).unwrap()
        });
        assert!(exchange.state().all_flags(
            ExchangeState::ROLLBACK_ONLY | ExchangeState::UNIT_OF_WORK_EXHAUSTED
        ));
    }

    #[test]
    fn test_exhausted_by_inner_handler_is_not_redelivered_again() {
        let attempts = Arc::new(AtomicU32::new(0));
        let inner =
            ErrorHandlerProcessor::new("inner-errors", flaky(10, &attempts), immediate(2)).unwrap();
        let outer =
            ErrorHandlerProcessor::new("outer-errors", Arc::new(inner), immediate(3)).unwrap();
        let completion = outer.process_blocking(Exchange::new()).unwrap();
        assert!(completion.exchange.is_failed());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_delay_without_runtime_redelivers_inline() {
        let attempts = Arc::new(AtomicU32::new(0));
        let policy = RedeliveryPolicy {
            maximum_redeliveries: 1,
            redelivery_delay_ms: 60_000,
            ..RedeliveryPolicy::default()
        };
        let handler = ErrorHandlerProcessor::new("errors", flaky(1, &attempts), policy).unwrap();
        let completion = handler.process_blocking(Exchange::new()).unwrap();
        assert!(completion.done_sync);
        assert!(!completion.exchange.is_failed());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_delay_on_shut_down_runtime_still_completes() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let handle = runtime.handle().clone();
        drop(runtime);

        let attempts = Arc::new(AtomicU32::new(0));
        let policy = RedeliveryPolicy {
            maximum_redeliveries: 1,
            redelivery_delay_ms: 10,
            ..RedeliveryPolicy::default()
        };
        let handler = ErrorHandlerProcessor::new("errors", flaky(1, &attempts), policy)
            .unwrap()
            .with_runtime(handle);
        let completion = handler.process_blocking(Exchange::new()).unwrap();
        assert!(completion.exchange.is_interrupted());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_delayed_redelivery_completes_asynchronously() {
        let attempts = Arc::new(AtomicU32::new(0));
        let policy = RedeliveryPolicy {
            maximum_redeliveries: 2,
            redelivery_delay_ms: 5,
            backoff_multiplier: 1.0,
            maximum_redelivery_delay_ms: 5,
        };
        let handler = ErrorHandlerProcessor::new("errors", flaky(1, &attempts), policy)
            .unwrap()
            .with_runtime(Handle::current());
        let completion = handler.process_async(Exchange::new()).await.unwrap();
        assert!(!completion.done_sync);
        assert!(!completion.exchange.is_failed());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
