use crate::exchange::{Body, BoxError, Exchange, ProcessingError};
use crate::processor::traversal::{Advance, Traversal, drive};
use crate::processor::{
    AsyncCallback, AsyncProcessor, ConfigError, ProcessorId, ServiceError, SharedAsyncProcessor,
};
use crate::status::ExchangeState;
use crate::uow::{DefaultUnitOfWorkFactory, UnitOfWorkFactory};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

/// Produces the bodies an exchange is split into.
pub trait SplitExpression: Send + Sync {
    fn evaluate(&self, exchange: &Exchange) -> Result<Vec<Body>, BoxError>;
}

impl<F> SplitExpression for F
where
    F: Fn(&Exchange) -> Result<Vec<Body>, BoxError> + Send + Sync,
{
    fn evaluate(&self, exchange: &Exchange) -> Result<Vec<Body>, BoxError> {
        self(exchange)
    }
}

/// Folds each completed part back into the exchange that was split.
pub trait AggregationStrategy: Send + Sync {
    fn aggregate(&self, original: &mut Exchange, part: Exchange);
}

/// Copies the part's exception onto the original unless the original has
/// already failed, so the first failure wins. A part that exhausted its
/// redeliveries marks the original exhausted too.
pub fn propagate_failure(original: &mut Exchange, part: &Exchange) {
    if original.is_failed() {
        return;
    }
    if let Some(failure) = part.exception() {
        original.set_exception(failure.clone());
        if part.state().any_flags(ExchangeState::REDELIVERY_EXHAUSTED) {
            original.state_mut().set(ExchangeState::REDELIVERY_EXHAUSTED);
        }
    }
}

/// Keeps the original exchange as the result of the split. The first failed
/// part's exception is copied onto it.
#[derive(Debug, Default, Clone, Copy)]
pub struct UseOriginal;

impl AggregationStrategy for UseOriginal {
    fn aggregate(&self, original: &mut Exchange, part: Exchange) {
        propagate_failure(original, &part);
    }
}

/// Collects the resulting body of every part, in order, into a `Vec<Body>`
/// set as the outbound body of the original exchange. The first failed part's
/// exception is copied onto the original.
#[derive(Debug, Default, Clone, Copy)]
pub struct GroupedBodies;

impl AggregationStrategy for GroupedBodies {
    fn aggregate(&self, original: &mut Exchange, mut part: Exchange) {
        propagate_failure(original, &part);
        let body = part.message_mut().take_body();
        let out = original.out_message_mut();
        if out.body_as::<Vec<Body>>().is_none() {
            out.set_body(Vec::<Body>::new());
        }
        if let (Some(bodies), Some(body)) = (out.body_as_mut::<Vec<Body>>(), body) {
            bodies.push(body);
        }
    }
}

/// Splits an exchange into parts and sends each part, one at a time, through
/// its child processor.
///
/// Every part carries `split_index`, `split_size` and `split_complete` and gets
/// a unit of work of its own. With `share_unit_of_work` the part's unit of work
/// is a child of the original's, the whole split runs inside a sub unit of work
/// on the original, and failing parts surface on the original exchange when
/// that scope ends.
pub struct Splitter {
    id: ProcessorId,
    expression: Arc<dyn SplitExpression>,
    processor: SharedAsyncProcessor,
    strategy: Arc<dyn AggregationStrategy>,
    unit_of_work_factory: Arc<dyn UnitOfWorkFactory>,
    share_unit_of_work: bool,
    stop_on_exception: bool,
}

impl Splitter {
    pub fn new(
        id: impl Into<ProcessorId>,
        expression: Arc<dyn SplitExpression>,
        processor: SharedAsyncProcessor,
    ) -> Result<Self, ConfigError> {
        let id = id.into();
        if processor.id() == &id {
            return Err(ConfigError::self_delegation(id));
        }
        Ok(Self {
            id,
            expression,
            processor,
            strategy: Arc::new(UseOriginal),
            unit_of_work_factory: Arc::new(DefaultUnitOfWorkFactory),
            share_unit_of_work: false,
            stop_on_exception: false,
        })
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn AggregationStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_unit_of_work_factory(mut self, factory: Arc<dyn UnitOfWorkFactory>) -> Self {
        self.unit_of_work_factory = factory;
        self
    }

    pub fn share_unit_of_work(mut self, share: bool) -> Self {
        self.share_unit_of_work = share;
        self
    }

    pub fn stop_on_exception(mut self, stop: bool) -> Self {
        self.stop_on_exception = stop;
        self
    }
}

struct SplitTraversal {
    id: ProcessorId,
    processor: SharedAsyncProcessor,
    strategy: Arc<dyn AggregationStrategy>,
    unit_of_work_factory: Arc<dyn UnitOfWorkFactory>,
    share_unit_of_work: bool,
    stop_on_exception: bool,
    parts: std::vec::IntoIter<Body>,
    size: usize,
    index: usize,
    original: Option<Exchange>,
    callback: AsyncCallback,
}

impl SplitTraversal {
    fn create_part(&self, original: &Exchange, body: Body) -> Exchange {
        let mut part = original.create_child(Some(body));
        let properties = part.properties_mut();
        properties.set_split_index(Some(self.index));
        properties.set_split_size(Some(self.size));
        properties.set_split_complete(self.index + 1 == self.size);

        let shared = if self.share_unit_of_work {
            original
                .unit_of_work()
                .map(|unit_of_work| unit_of_work.create_child_unit_of_work(&part))
        } else {
            None
        };
        let unit_of_work =
            shared.unwrap_or_else(|| self.unit_of_work_factory.create_unit_of_work(&part));
        part.set_unit_of_work(unit_of_work);
        part
    }

    /// Tears down the part's unit of work and aggregates it. Returns the
    /// part's failure, if any.
    fn complete_part(&self, original: &mut Exchange, mut part: Exchange) -> Option<ProcessingError> {
        if let Some(mut unit_of_work) = part.take_unit_of_work() {
            if let Err(e) = unit_of_work.done(&part) {
                log::warn!(
                    "Split part {} of exchange {} completed with errors: {}",
                    self.index,
                    original.uuid(),
                    e
                );
            }
            if self.share_unit_of_work {
                if let Some(callback) = unit_of_work.sub_unit_of_work_callback() {
                    callback.on_done(&part);
                }
            }
        }

        let failure = part.exception().cloned();
        if let Some(failure) = &failure {
            log::debug!(
                "Split part {} of exchange {} failed: {}",
                self.index,
                original.uuid(),
                failure
            );
        }
        self.strategy.aggregate(original, part);
        failure
    }
}

impl Traversal for SplitTraversal {
    fn advance(&mut self, exchange: Exchange) -> Advance {
        let original = match self.original.take() {
            None => exchange,
            Some(mut original) => {
                let failure = self.complete_part(&mut original, exchange);
                if let Some(failure) = failure {
                    if self.stop_on_exception {
                        original.set_exception(ProcessingError::split(self.index, failure));
                        return Advance::Done(original);
                    }
                }
                self.index += 1;
                original
            }
        };

        if original.is_interrupted() {
            return Advance::Done(original);
        }
        match self.parts.next() {
            Some(body) => {
                let part = self.create_part(&original, body);
                self.original = Some(original);
                Advance::Next(self.processor.clone(), part)
            }
            None => Advance::Done(original),
        }
    }

    fn finish(self, mut original: Exchange, done_sync: bool) {
        if self.share_unit_of_work {
            if let Some(mut unit_of_work) = original.take_unit_of_work() {
                if let Err(e) = unit_of_work.end_sub_unit_of_work(&mut original) {
                    log::warn!(
                        "Splitter '{}' could not end the sub unit of work of exchange {}: {}",
                        self.id,
                        original.uuid(),
                        e
                    );
                }
                original.set_unit_of_work(unit_of_work);
            }
        }
        self.callback.done(original, done_sync);
    }
}

impl AsyncProcessor for Splitter {
    fn process(&self, mut exchange: Exchange, callback: AsyncCallback) -> bool {
        let evaluated = catch_unwind(AssertUnwindSafe(|| self.expression.evaluate(&exchange)));
        let parts = match evaluated {
            Ok(Ok(parts)) => parts,
            Ok(Err(e)) => {
                exchange.set_exception(ProcessingError::failed(self.id.as_str(), e));
                callback.done(exchange, true);
                return true;
            }
            Err(payload) => {
                exchange.set_exception(ProcessingError::from_panic(self.id.as_str(), payload));
                callback.done(exchange, true);
                return true;
            }
        };
        log::trace!(
            "Splitter '{}' splits exchange {} into {} part(s)",
            self.id,
            exchange.uuid(),
            parts.len()
        );

        if self.share_unit_of_work {
            exchange.with_unit_of_work(|unit_of_work, exchange| {
                unit_of_work.begin_sub_unit_of_work(exchange)
            });
        }
        let traversal = SplitTraversal {
            id: self.id.clone(),
            processor: self.processor.clone(),
            strategy: self.strategy.clone(),
            unit_of_work_factory: self.unit_of_work_factory.clone(),
            share_unit_of_work: self.share_unit_of_work,
            stop_on_exception: self.stop_on_exception,
            size: parts.len(),
            parts: parts.into_iter(),
            index: 0,
            original: None,
            callback,
        };
        drive(traversal, exchange, true)
    }

    fn id(&self) -> &ProcessorId {
        &self.id
    }

    fn start(&self) -> Result<(), ServiceError> {
        self.processor.start()
    }

    fn stop(&self) -> Result<(), ServiceError> {
        self.processor.stop()
    }

    fn children(&self) -> Vec<SharedAsyncProcessor> {
        vec![self.processor.clone()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::BoxError;
    use crate::processor::testing::OffThread;
    use crate::processor::{AsyncProcessorExt, Pipeline, processor_fn, to_async};
    use crate::uow::{
        DefaultUnitOfWork, SubUnitOfWorkCallback, SubUnitOfWorkProcessor, Synchronization,
        UnitOfWork, UnitOfWorkError,
    };
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    fn split_words() -> Arc<dyn SplitExpression> {
        Arc::new(|exchange: &Exchange| -> Result<Vec<Body>, BoxError> {
            let text = exchange
                .in_message()
                .body_as::<String>()
                .ok_or("body is not text")?;
            Ok(text
                .split(' ')
                .map(|word| Body::new(word.to_string()))
                .collect())
        })
    }

    fn fail_on_index(index: usize) -> SharedAsyncProcessor {
        to_async(
            "fail-on-index",
            processor_fn(move |exchange: &mut Exchange| -> Result<(), BoxError> {
                if exchange.properties().split_index() == Some(index) {
                    return Err("bad part".into());
                }
                Ok(())
            }),
        )
    }

    #[derive(Default)]
    struct Counters {
        begins: AtomicUsize,
        ends: AtomicUsize,
    }

    /// Counts scope calls on top of the default unit of work.
    struct CountingUnitOfWork {
        inner: DefaultUnitOfWork,
        counters: Arc<Counters>,
    }

    impl UnitOfWork for CountingUnitOfWork {
        fn id(&self) -> &Uuid {
            self.inner.id()
        }

        fn is_child(&self) -> bool {
            self.inner.is_child()
        }

        fn add_synchronization(&mut self, synchronization: Box<dyn Synchronization>) {
            self.inner.add_synchronization(synchronization)
        }

        fn begin_sub_unit_of_work(&mut self, exchange: &Exchange) {
            self.counters.begins.fetch_add(1, Ordering::SeqCst);
            self.inner.begin_sub_unit_of_work(exchange)
        }

        fn end_sub_unit_of_work(&mut self, exchange: &mut Exchange) -> Result<(), UnitOfWorkError> {
            self.counters.ends.fetch_add(1, Ordering::SeqCst);
            self.inner.end_sub_unit_of_work(exchange)
        }

        fn sub_unit_of_work_callback(&self) -> Option<Arc<dyn SubUnitOfWorkCallback>> {
            self.inner.sub_unit_of_work_callback()
        }

        fn create_child_unit_of_work(&self, child: &Exchange) -> Box<dyn UnitOfWork> {
            self.inner.create_child_unit_of_work(child)
        }

        fn push_route(&mut self, route_id: &str) {
            self.inner.push_route(route_id)
        }

        fn pop_route(&mut self) -> Option<String> {
            self.inner.pop_route()
        }

        fn route_id(&self) -> Option<&str> {
            self.inner.route_id()
        }

        fn done(&mut self, exchange: &Exchange) -> Result<(), UnitOfWorkError> {
            self.inner.done(exchange)
        }
    }

    struct CountingFactory(Arc<Counters>);

    impl UnitOfWorkFactory for CountingFactory {
        fn create_unit_of_work(&self, exchange: &Exchange) -> Box<dyn UnitOfWork> {
            Box::new(CountingUnitOfWork {
                inner: DefaultUnitOfWork::new(exchange),
                counters: self.0.clone(),
            })
        }
    }

    /// Remembers which parts came back failed.
    #[derive(Default)]
    struct FailedParts(Mutex<Vec<Uuid>>);

    impl AggregationStrategy for FailedParts {
        fn aggregate(&self, _original: &mut Exchange, part: Exchange) {
            if part.is_failed() {
                self.0.lock().push(*part.uuid());
            }
        }
    }

    #[test]
    fn test_each_part_runs_in_its_own_sub_unit_of_work() {
        let counters = Arc::new(Counters::default());
        let failed = Arc::new(FailedParts::default());
        let scope = SubUnitOfWorkProcessor::new(
            "scope",
            Some(Arc::new(Pipeline::new("chain", vec![fail_on_index(1)]))),
        )
        .unwrap();
        let splitter = Splitter::new("split", split_words(), Arc::new(scope))
            .unwrap()
            .with_unit_of_work_factory(Arc::new(CountingFactory(counters.clone())))
            .with_strategy(failed.clone());

        let calls = Arc::new(AtomicUsize::new(0));
        let (sender, receiver) = std::sync::mpsc::channel();
        let counter = calls.clone();
        let done_sync = splitter.process(
            Exchange::with_body(String::from("one two three")),
            AsyncCallback::new(move |exchange, done_sync| {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = sender.send((exchange, done_sync));
            }),
        );
        let (original, reported) = receiver.recv().unwrap();

        assert!(done_sync);
        assert_eq!(done_sync, reported);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(counters.begins.load(Ordering::SeqCst), 3);
        assert_eq!(counters.ends.load(Ordering::SeqCst), 3);
        assert_eq!(failed.0.lock().len(), 1);
        assert!(!original.is_failed());
    }

    #[test]
    fn test_default_strategy_keeps_first_part_failure() {
        let chain = to_async(
            "fail-from-index-1",
            processor_fn(|exchange: &mut Exchange| -> Result<(), BoxError> {
                match exchange.properties().split_index() {
                    Some(index) if index >= 1 => Err(format!("bad part {index}").into()),
                    _ => Ok(()),
                }
            }),
        );
        let splitter = Splitter::new("split", split_words(), chain).unwrap();
        let completion = splitter
            .process_blocking(Exchange::with_body(String::from("a b c")))
            .unwrap();
        match completion.exchange.exception() {
            Some(ProcessingError::Failed { source, .. }) => {
                assert_eq!(source.to_string(), "bad part 1")
            }
            other => panic!("unexpected exception {:?}", other),
        }
    }

    #[test]
    fn test_parts_carry_split_properties() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();
        let splitter = Splitter::new(
            "split",
            split_words(),
            to_async(
                "inspect",
                processor_fn(move |exchange: &mut Exchange| -> Result<(), BoxError> {
                    let properties = exchange.properties();
                    recorder.lock().push((
                        properties.split_index(),
                        properties.split_size(),
                        properties.split_complete(),
                        exchange.has_unit_of_work(),
                    ));
                    Ok(())
                }),
            ),
        )
        .unwrap();
        let original = Exchange::with_body(String::from("a b"));
        let original_id = *original.uuid();
        let completion = splitter.process_blocking(original).unwrap();
        assert_eq!(completion.exchange.uuid(), &original_id);
        assert_eq!(
            *seen.lock(),
            vec![
                (Some(0), Some(2), false, true),
                (Some(1), Some(2), true, true)
            ]
        );
    }

    #[test]
    fn test_grouped_bodies_keeps_part_order_across_async_parts() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let splitter = Splitter::new("split", split_words(), OffThread::shared("slow", &events))
            .unwrap()
            .with_strategy(Arc::new(GroupedBodies));
        let completion = splitter
            .process_blocking(Exchange::with_body(String::from("x y z")))
            .unwrap();
        assert!(!completion.done_sync);
        let bodies = completion
            .exchange
            .message()
            .body_as::<Vec<Body>>()
            .unwrap();
        let words: Vec<&String> = bodies
            .iter()
            .filter_map(|body| body.downcast_ref::<String>())
            .collect();
        assert_eq!(words, vec!["x", "y", "z"]);
        assert_eq!(events.lock().len(), 3);
    }

    #[test]
    fn test_stop_on_exception_records_index_on_original() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let chain = Pipeline::new(
            "chain",
            vec![
                fail_on_index(1),
                to_async(
                    "count",
                    processor_fn(move |_: &mut Exchange| -> Result<(), BoxError> {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }),
                ),
            ],
        );
        let splitter = Splitter::new("split", split_words(), Arc::new(chain))
            .unwrap()
            .stop_on_exception(true);
        let completion = splitter
            .process_blocking(Exchange::with_body(String::from("a b c")))
            .unwrap();
        match completion.exchange.exception() {
            Some(ProcessingError::Split { index, .. }) => assert_eq!(*index, 1),
            other => panic!("unexpected exception {:?}", other),
        }
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shared_unit_of_work_surfaces_part_failure_on_original() {
        let splitter = Splitter::new("split", split_words(), fail_on_index(0))
            .unwrap()
            .share_unit_of_work(true);
        let mut original = Exchange::with_body(String::from("a b"));
        let unit_of_work = DefaultUnitOfWork::new(&original);
        original.set_unit_of_work(Box::new(unit_of_work));

        let completion = splitter.process_blocking(original).unwrap();
        let original = completion.exchange;
        assert!(matches!(
            original.exception(),
            Some(ProcessingError::Failed { .. })
        ));
        assert!(original.state().all_flags(
            ExchangeState::ROLLBACK_ONLY | ExchangeState::UNIT_OF_WORK_EXHAUSTED
        ));
        assert!(original.has_unit_of_work());
    }

    #[test]
    fn test_expression_failure_completes_synchronously() {
        let splitter = Splitter::new("split", split_words(), fail_on_index(0)).unwrap();
        let completion = splitter.process_blocking(Exchange::new()).unwrap();
        assert!(completion.done_sync);
        assert!(completion.exchange.is_failed());
    }
}
