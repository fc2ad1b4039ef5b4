use crate::exchange::{Body, Exchange, ProcessingError};
use crate::processor::split::{AggregationStrategy, UseOriginal};
use crate::processor::traversal::{Advance, Traversal, drive};
use crate::processor::{
    AsyncCallback, AsyncProcessor, ConfigError, PendingExchange, ProcessorId, ServiceError,
    SharedAsyncProcessor, start_all, stop_all,
};
use crate::uow::{DefaultUnitOfWorkFactory, UnitOfWorkFactory};
use parking_lot::Mutex;
use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::runtime::Handle;

/// Produces the body a branch starts with. Bodies are not shared, so a branch
/// without a copier starts with the original's headers and properties only.
pub trait BranchBody: Send + Sync {
    fn copy(&self, exchange: &Exchange) -> Option<Body>;
}

impl<F> BranchBody for F
where
    F: Fn(&Exchange) -> Option<Body> + Send + Sync,
{
    fn copy(&self, exchange: &Exchange) -> Option<Body> {
        self(exchange)
    }
}

/// Gives every branch a clone of the current body when it is a `T`.
pub fn clone_body<T>() -> Arc<dyn BranchBody>
where
    T: Any + Clone + Send + Sync,
{
    Arc::new(|exchange: &Exchange| exchange.message().body_as::<T>().cloned().map(Body::new))
}

/// What every branch of one multicast shares.
#[derive(Clone)]
struct Branching {
    id: ProcessorId,
    processors: Arc<[SharedAsyncProcessor]>,
    strategy: Arc<dyn AggregationStrategy>,
    unit_of_work_factory: Arc<dyn UnitOfWorkFactory>,
    body: Option<Arc<dyn BranchBody>>,
    share_unit_of_work: bool,
    stop_on_exception: bool,
}

impl Branching {
    fn create_branch(&self, original: &Exchange) -> Exchange {
        let body = self.body.as_ref().and_then(|body| body.copy(original));
        let mut branch = original.create_child(body);
        let shared = if self.share_unit_of_work {
            original
                .unit_of_work()
                .map(|unit_of_work| unit_of_work.create_child_unit_of_work(&branch))
        } else {
            None
        };
        let unit_of_work =
            shared.unwrap_or_else(|| self.unit_of_work_factory.create_unit_of_work(&branch));
        branch.set_unit_of_work(unit_of_work);
        branch
    }

    /// Tears down the branch's unit of work once the branch completed.
    fn complete_branch(&self, index: usize, branch: &mut Exchange) {
        let Some(mut unit_of_work) = branch.take_unit_of_work() else {
            return;
        };
        if let Err(e) = unit_of_work.done(branch) {
            log::warn!(
                "Multicast '{}' branch {} of exchange {} completed with errors: {}",
                self.id,
                index,
                branch.uuid(),
                e
            );
        }
        if self.share_unit_of_work {
            if let Some(callback) = unit_of_work.sub_unit_of_work_callback() {
                callback.on_done(branch);
            }
        }
    }

    /// Folds a completed branch into the original. Returns false when the
    /// multicast must not aggregate any further branch.
    fn aggregate(&self, original: &mut Exchange, index: usize, branch: Exchange) -> bool {
        let failure = branch.exception().cloned();
        self.strategy.aggregate(original, branch);
        match failure {
            Some(failure) if self.stop_on_exception => {
                log::debug!(
                    "Multicast '{}' stops at branch {} of exchange {}: {}",
                    self.id,
                    index,
                    original.uuid(),
                    failure
                );
                original.set_exception(ProcessingError::multicast(index, failure));
                false
            }
            _ => true,
        }
    }

    fn begin(&self, original: &mut Exchange) {
        if self.share_unit_of_work {
            original.with_unit_of_work(|unit_of_work, exchange| {
                unit_of_work.begin_sub_unit_of_work(exchange)
            });
        }
    }

    fn finish(&self, mut original: Exchange, callback: AsyncCallback, done_sync: bool) {
        if self.share_unit_of_work {
            if let Some(mut unit_of_work) = original.take_unit_of_work() {
                if let Err(e) = unit_of_work.end_sub_unit_of_work(&mut original) {
                    log::warn!(
                        "Multicast '{}' could not end the sub unit of work of exchange {}: {}",
                        self.id,
                        original.uuid(),
                        e
                    );
                }
                original.set_unit_of_work(unit_of_work);
            }
        }
        callback.done(original, done_sync);
    }
}

/// Sends a copy of the exchange to each of several processors and folds the
/// results back into the original, in branch order.
///
/// Branches run one after another by default. With [`parallel`] every branch
/// is handed to the runtime's blocking pool at once, and the results are
/// aggregated in branch order after the last one completed. Each branch gets
/// a unit of work of its own; with `share_unit_of_work` it is a child of the
/// original's and the whole multicast runs inside a sub unit of work.
///
/// [`parallel`]: MulticastProcessor::parallel
pub struct MulticastProcessor {
    branching: Branching,
    runtime: Option<Handle>,
}

impl MulticastProcessor {
    pub fn new(
        id: impl Into<ProcessorId>,
        processors: Vec<SharedAsyncProcessor>,
    ) -> Result<Self, ConfigError> {
        let id = id.into();
        if let Some(processor) = processors.iter().find(|processor| processor.id() == &id) {
            return Err(ConfigError::self_delegation(processor.id().clone()));
        }
        Ok(Self {
            branching: Branching {
                id,
                processors: processors.into(),
                strategy: Arc::new(UseOriginal),
                unit_of_work_factory: Arc::new(DefaultUnitOfWorkFactory),
                body: None,
                share_unit_of_work: false,
                stop_on_exception: false,
            },
            runtime: None,
        })
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn AggregationStrategy>) -> Self {
        self.branching.strategy = strategy;
        self
    }

    pub fn with_unit_of_work_factory(mut self, factory: Arc<dyn UnitOfWorkFactory>) -> Self {
        self.branching.unit_of_work_factory = factory;
        self
    }

    pub fn with_branch_body(mut self, body: Arc<dyn BranchBody>) -> Self {
        self.branching.body = Some(body);
        self
    }

    pub fn share_unit_of_work(mut self, share: bool) -> Self {
        self.branching.share_unit_of_work = share;
        self
    }

    pub fn stop_on_exception(mut self, stop: bool) -> Self {
        self.branching.stop_on_exception = stop;
        self
    }

    /// Runs the branches concurrently on `runtime`.
    pub fn parallel(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    fn process_parallel(
        &self,
        runtime: &Handle,
        exchange: Exchange,
        callback: AsyncCallback,
    ) -> bool {
        let branching = Arc::new(self.branching.clone());
        let size = branching.processors.len();
        let branches: Vec<Exchange> = (0..size)
            .map(|_| branching.create_branch(&exchange))
            .collect();
        let run = Arc::new(ParallelRun {
            branching: branching.clone(),
            results: Mutex::new((0..size).map(|_| Slot::Running).collect()),
            remaining: AtomicUsize::new(size),
            stopped: AtomicBool::new(false),
            original: Mutex::new(Some((exchange, callback))),
        });

        for (index, (branch, processor)) in branches
            .into_iter()
            .zip(branching.processors.iter().cloned())
            .enumerate()
        {
            let collector = run.clone();
            let branch_callback =
                AsyncCallback::new(move |branch, _| collector.branch_done(index, branch));
            let pending = PendingExchange::new(branching.id.as_str(), branch, branch_callback);
            let run = run.clone();
            runtime.spawn_blocking(move || {
                let Some((branch, callback)) = pending.into_parts() else {
                    return;
                };
                if run.stopped.load(Ordering::Acquire) {
                    run.skip(index);
                    callback.done(branch, false);
                    return;
                }
                processor.process(branch, callback);
            });
        }
        false
    }
}

enum Slot {
    Running,
    Skipped,
    Done(Exchange),
}

/// Bookkeeping for one parallel multicast.
struct ParallelRun {
    branching: Arc<Branching>,
    results: Mutex<Vec<Slot>>,
    remaining: AtomicUsize,
    stopped: AtomicBool,
    original: Mutex<Option<(Exchange, AsyncCallback)>>,
}

impl ParallelRun {
    /// Marks a branch that is not started because another one failed.
    fn skip(&self, index: usize) {
        log::trace!(
            "Multicast '{}' skips branch {} after a failure",
            self.branching.id,
            index
        );
        self.results.lock()[index] = Slot::Skipped;
    }

    fn branch_done(&self, index: usize, mut branch: Exchange) {
        self.branching.complete_branch(index, &mut branch);
        {
            let mut results = self.results.lock();
            if !matches!(results[index], Slot::Skipped) {
                if branch.is_failed() && self.branching.stop_on_exception {
                    self.stopped.store(true, Ordering::Release);
                }
                results[index] = Slot::Done(branch);
            }
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.aggregate_all();
        }
    }

    fn aggregate_all(&self) {
        let Some((mut original, callback)) = self.original.lock().take() else {
            return;
        };
        let results = std::mem::take(&mut *self.results.lock());
        for (index, slot) in results.into_iter().enumerate() {
            let Slot::Done(branch) = slot else {
                continue;
            };
            if !self.branching.aggregate(&mut original, index, branch) {
                break;
            }
        }
        self.branching.finish(original, callback, false);
    }
}

struct SequentialTraversal {
    branching: Arc<Branching>,
    next: usize,
    original: Option<Exchange>,
    callback: AsyncCallback,
}

impl Traversal for SequentialTraversal {
    fn advance(&mut self, exchange: Exchange) -> Advance {
        let original = match self.original.take() {
            None => exchange,
            Some(mut original) => {
                let index = self.next - 1;
                let mut branch = exchange;
                self.branching.complete_branch(index, &mut branch);
                if !self.branching.aggregate(&mut original, index, branch) {
                    return Advance::Done(original);
                }
                original
            }
        };

        if original.is_interrupted() {
            return Advance::Done(original);
        }
        match self.branching.processors.get(self.next).cloned() {
            Some(processor) => {
                let branch = self.branching.create_branch(&original);
                self.next += 1;
                self.original = Some(original);
                Advance::Next(processor, branch)
            }
            None => Advance::Done(original),
        }
    }

    fn finish(self, original: Exchange, done_sync: bool) {
        self.branching.finish(original, self.callback, done_sync);
    }
}

impl AsyncProcessor for MulticastProcessor {
    fn process(&self, mut exchange: Exchange, callback: AsyncCallback) -> bool {
        log::trace!(
            "Multicast '{}' sends exchange {} to {} branch(es)",
            self.branching.id,
            exchange.uuid(),
            self.branching.processors.len()
        );
        self.branching.begin(&mut exchange);
        match &self.runtime {
            Some(runtime) if !self.branching.processors.is_empty() => {
                self.process_parallel(runtime, exchange, callback)
            }
            _ => {
                let traversal = SequentialTraversal {
                    branching: Arc::new(self.branching.clone()),
                    next: 0,
                    original: None,
                    callback,
                };
                drive(traversal, exchange, true)
            }
        }
    }

    fn id(&self) -> &ProcessorId {
        &self.branching.id
    }

    fn start(&self) -> Result<(), ServiceError> {
        start_all(&self.branching.processors)
    }

    fn stop(&self) -> Result<(), ServiceError> {
        match stop_all(&self.branching.processors) {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    fn children(&self) -> Vec<SharedAsyncProcessor> {
        self.branching.processors.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::BoxError;
    use crate::processor::{AsyncProcessorExt, GroupedBodies, processor_fn, to_async};
    use crate::status::ExchangeState;
    use crate::uow::DefaultUnitOfWork;
    use std::time::Duration;

    /// Appends its name to a text body, after an optional pause.
    fn tagging(
        name: &'static str,
        pause_ms: u64,
        finished: &Arc<Mutex<Vec<&'static str>>>,
    ) -> SharedAsyncProcessor {
        let finished = finished.clone();
        to_async(
            name,
            processor_fn(move |exchange: &mut Exchange| -> Result<(), BoxError> {
                std::thread::sleep(Duration::from_millis(pause_ms));
                let text = exchange.message().body_as::<String>().cloned().unwrap_or_default();
                exchange.message_mut().set_body(format!("{text}:{name}"));
                finished.lock().push(name);
                Ok(())
            }),
        )
    }

    fn failing(name: &'static str) -> SharedAsyncProcessor {
        to_async(
            name,
            processor_fn(|_: &mut Exchange| -> Result<(), BoxError> { Err("branch down".into()) }),
        )
    }

    fn grouped_text(exchange: &Exchange) -> Vec<String> {
        exchange
            .message()
            .body_as::<Vec<Body>>()
            .map(|bodies| {
                bodies
                    .iter()
                    .filter_map(|body| body.downcast_ref::<String>().cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    #[test]
    fn test_branches_get_copies_and_aggregate_in_order() {
        let finished = Arc::new(Mutex::new(Vec::new()));
        let multicast = MulticastProcessor::new(
            "fan-out",
            vec![tagging("a", 0, &finished), tagging("b", 0, &finished)],
        )
        .unwrap()
        .with_branch_body(clone_body::<String>())
        .with_strategy(Arc::new(GroupedBodies));

        let original = Exchange::with_body(String::from("order"));
        let original_id = *original.uuid();
        let completion = multicast.process_blocking(original).unwrap();

        assert!(completion.done_sync);
        assert_eq!(completion.exchange.uuid(), &original_id);
        assert_eq!(completion.exchange.in_message().body_as::<String>().unwrap(), "order");
        assert_eq!(grouped_text(&completion.exchange), vec!["order:a", "order:b"]);
        assert_eq!(*finished.lock(), vec!["a", "b"]);
    }

    #[test]
    fn test_parallel_branches_aggregate_in_branch_order() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let finished = Arc::new(Mutex::new(Vec::new()));
        let multicast = MulticastProcessor::new(
            "fan-out",
            vec![
                tagging("slow", 80, &finished),
                tagging("medium", 40, &finished),
                tagging("fast", 0, &finished),
            ],
        )
        .unwrap()
        .with_branch_body(clone_body::<String>())
        .with_strategy(Arc::new(GroupedBodies))
        .parallel(runtime.handle().clone());

        let completion = multicast
            .process_blocking(Exchange::with_body(String::from("x")))
            .unwrap();

        assert!(!completion.done_sync);
        assert_eq!(
            grouped_text(&completion.exchange),
            vec!["x:slow", "x:medium", "x:fast"]
        );
        let finished = finished.lock().clone();
        assert_eq!(finished.len(), 3);
        assert_eq!(finished.first(), Some(&"fast"));
    }

    #[test]
    fn test_stop_on_exception_reports_branch_number() {
        let finished = Arc::new(Mutex::new(Vec::new()));
        let multicast = MulticastProcessor::new(
            "fan-out",
            vec![
                tagging("first", 0, &finished),
                failing("second"),
                tagging("third", 0, &finished),
            ],
        )
        .unwrap()
        .stop_on_exception(true);

        let completion = multicast.process_blocking(Exchange::new()).unwrap();
        match completion.exchange.exception() {
            Some(ProcessingError::Multicast { index, .. }) => assert_eq!(*index, 1),
            other => panic!("unexpected exception {:?}", other),
        }
        assert_eq!(*finished.lock(), vec!["first"]);
    }

    #[test]
    fn test_parallel_branch_failure_reaches_original() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let finished = Arc::new(Mutex::new(Vec::new()));
        let multicast = MulticastProcessor::new(
            "fan-out",
            vec![tagging("ok", 10, &finished), failing("down")],
        )
        .unwrap()
        .parallel(runtime.handle().clone());

        let completion = multicast.process_blocking(Exchange::new()).unwrap();
        assert!(matches!(
            completion.exchange.exception(),
            Some(ProcessingError::Failed { processor, .. }) if processor == "down"
        ));
        assert_eq!(*finished.lock(), vec!["ok"]);
    }

    #[test]
    fn test_shared_unit_of_work_surfaces_branch_failure() {
        let finished = Arc::new(Mutex::new(Vec::new()));
        let multicast = MulticastProcessor::new(
            "fan-out",
            vec![failing("down"), tagging("after", 0, &finished)],
        )
        .unwrap()
        .share_unit_of_work(true);
        let mut original = Exchange::new();
        let unit_of_work = DefaultUnitOfWork::new(&original);
        original.set_unit_of_work(Box::new(unit_of_work));

        let original = multicast.process_blocking(original).unwrap().exchange;
        assert!(matches!(
            original.exception(),
            Some(ProcessingError::Failed { .. })
        ));
        assert!(original.state().all_flags(
            ExchangeState::ROLLBACK_ONLY | ExchangeState::UNIT_OF_WORK_EXHAUSTED
        ));
        assert!(original.has_unit_of_work());
        assert_eq!(*finished.lock(), vec!["after"]);
    }

    #[test]
    fn test_shut_down_runtime_still_completes_exchange() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let handle = runtime.handle().clone();
        drop(runtime);
        let finished = Arc::new(Mutex::new(Vec::new()));
        let multicast = MulticastProcessor::new("fan-out", vec![tagging("never", 0, &finished)])
            .unwrap()
            .parallel(handle);

        let completion = multicast.process_blocking(Exchange::new()).unwrap();
        assert!(matches!(
            completion.exchange.exception(),
            Some(ProcessingError::Interrupted { .. })
        ));
        assert!(finished.lock().is_empty());
    }

    #[test]
    fn test_rejects_branch_with_own_id() {
        let finished = Arc::new(Mutex::new(Vec::new()));
        assert!(matches!(
            MulticastProcessor::new("same", vec![tagging("same", 0, &finished)]),
            Err(ConfigError::SelfDelegation { .. })
        ));
    }
}
