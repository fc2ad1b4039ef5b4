pub mod callback;
pub mod delegate;
pub mod error_handler;
pub mod filter;
pub mod multicast;
pub mod pipeline;
pub mod send;
pub mod split;
pub mod threads;
pub(crate) mod traversal;

pub use callback::{
    AsyncCallback, AsyncProcessorExt, Completion, CompletionError, CompletionFuture, PendingExchange,
};
pub use delegate::DelegateAsyncProcessor;
pub use error_handler::{ErrorHandlerProcessor, RedeliveryPolicy};
pub use filter::{FilterProcessor, Predicate};
pub use multicast::{BranchBody, MulticastProcessor, clone_body};
pub use pipeline::Pipeline;
pub use send::SendProcessor;
pub use split::{
    AggregationStrategy, GroupedBodies, SplitExpression, Splitter, UseOriginal, propagate_failure,
};
pub use threads::ThreadsProcessor;

use crate::exchange::{BoxError, Exchange, ProcessingError};
use fnv::FnvHasher;
use std::fmt::{Debug, Display, Formatter};
use std::hash::{Hash, Hasher};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use thiserror::Error;

pub type SharedAsyncProcessor = Arc<dyn AsyncProcessor>;

/// Identifies a node of a processor tree.
#[derive(Debug, Clone)]
pub struct ProcessorId {
    id_hash: u64,
    name: Arc<str>,
}

impl ProcessorId {
    pub fn new(id: impl AsRef<str>) -> Self {
        let id = id.as_ref();
        let mut hasher = FnvHasher::default();
        id.hash(&mut hasher);
        Self {
            id_hash: hasher.finish(),
            name: Arc::from(id),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }
}

impl PartialEq for ProcessorId {
    fn eq(&self, other: &Self) -> bool {
        self.id_hash == other.id_hash && self.name == other.name
    }
}

impl Eq for ProcessorId {}

impl Hash for ProcessorId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id_hash.hash(state);
    }
}

impl Display for ProcessorId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl From<&str> for ProcessorId {
    fn from(value: &str) -> Self {
        ProcessorId::new(value)
    }
}

/// The non-blocking processing contract every stage of a route implements.
///
/// `process` returns `true` when the exchange was completed before the call
/// returned, in which case `callback` has already been invoked with
/// `done_sync = true`. It returns `false` when the work continues elsewhere
/// (another thread, a timer, an I/O completion); `callback` is then invoked
/// later, exactly once, with `done_sync = false`.
///
/// Faults are never returned from `process`. They are recorded on the
/// exchange, and the callback still fires.
pub trait AsyncProcessor: Send + Sync {
    fn process(&self, exchange: Exchange, callback: AsyncCallback) -> bool;

    fn id(&self) -> &ProcessorId;

    /// Starts this node and, for composite processors, its children first.
    fn start(&self) -> Result<(), ServiceError> {
        Ok(())
    }

    /// Stops this node and, for composite processors, its children in reverse order.
    fn stop(&self) -> Result<(), ServiceError> {
        Ok(())
    }

    /// The direct children of this node, for navigation only.
    fn children(&self) -> Vec<SharedAsyncProcessor> {
        Vec::new()
    }
}

/// A synchronous single-step processor.
///
/// Adapted into the asynchronous contract by [`ProcessorAdapter`].
pub trait Processor: Send + Sync {
    fn process(&self, exchange: &mut Exchange) -> Result<(), BoxError>;

    fn start(&self) -> Result<(), ServiceError> {
        Ok(())
    }

    fn stop(&self) -> Result<(), ServiceError> {
        Ok(())
    }
}

/// Runs a synchronous [`Processor`] as an [`AsyncProcessor`].
///
/// An `Err` or a panic from the wrapped processor is recorded on the exchange;
/// the callback is always invoked synchronously.
pub struct ProcessorAdapter<P> {
    id: ProcessorId,
    processor: P,
}

impl<P> ProcessorAdapter<P>
where
    P: Processor,
{
    pub fn new(id: impl Into<ProcessorId>, processor: P) -> Self {
        Self {
            id: id.into(),
            processor,
        }
    }

    pub fn inner(&self) -> &P {
        &self.processor
    }
}

impl<P> AsyncProcessor for ProcessorAdapter<P>
where
    P: Processor,
{
    fn process(&self, mut exchange: Exchange, callback: AsyncCallback) -> bool {
        let result = catch_unwind(AssertUnwindSafe(|| self.processor.process(&mut exchange)));
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                log::debug!(
                    "Processor '{}' failed on exchange {}: {}",
                    self.id,
                    exchange.uuid(),
                    e
                );
                exchange.set_exception(ProcessingError::failed(self.id.as_str(), e));
            }
            Err(payload) => {
                log::error!("Processor '{}' panicked on exchange {}", self.id, exchange.uuid());
                exchange.set_exception(ProcessingError::from_panic(self.id.as_str(), payload));
            }
        }
        callback.done(exchange, true);
        true
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
}

/// A [`Processor`] backed by a closure.
pub struct FnProcessor<F> {
    f: F,
}

impl<F> Processor for FnProcessor<F>
where
    F: Fn(&mut Exchange) -> Result<(), BoxError> + Send + Sync,
{
    fn process(&self, exchange: &mut Exchange) -> Result<(), BoxError> {
        (self.f)(exchange)
    }
}

pub fn processor_fn<F>(f: F) -> FnProcessor<F>
where
    F: Fn(&mut Exchange) -> Result<(), BoxError> + Send + Sync,
{
    FnProcessor { f }
}

/// Wraps a synchronous processor into a shareable asynchronous one.
pub fn to_async<P>(id: impl Into<ProcessorId>, processor: P) -> SharedAsyncProcessor
where
    P: Processor + 'static,
{
    Arc::new(ProcessorAdapter::new(id, processor))
}

/// Starts `processors` in order. On failure the ones already started are
/// stopped again in reverse order before the error is returned.
pub fn start_all(processors: &[SharedAsyncProcessor]) -> Result<(), ServiceError> {
    for (started, processor) in processors.iter().enumerate() {
        if let Err(e) = processor.start() {
            log::warn!("Processor '{}' failed to start: {}", processor.id(), e);
            stop_all(&processors[..started]);
            return Err(e);
        }
        log::trace!("Started processor '{}'", processor.id());
    }
    Ok(())
}

/// Stops `processors` in reverse order, logging failures and continuing.
pub fn stop_all(processors: &[SharedAsyncProcessor]) -> Option<ServiceError> {
    let mut first_error = None;
    for processor in processors.iter().rev() {
        match processor.stop() {
            Ok(()) => log::trace!("Stopped processor '{}'", processor.id()),
            Err(e) => {
                log::warn!("Processor '{}' failed to stop: {}", processor.id(), e);
                first_error.get_or_insert(e);
            }
        }
    }
    first_error
}

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Failed to start '{service}': {message}")]
    Start { service: String, message: String },

    #[error("Failed to stop '{service}': {message}")]
    Stop { service: String, message: String },
}

impl ServiceError {
    #[inline]
    pub fn start(service: impl Display, message: impl Into<String>) -> Self {
        Self::Start {
            service: service.to_string(),
            message: message.into(),
        }
    }

    #[inline]
    pub fn stop(service: impl Display, message: impl Into<String>) -> Self {
        Self::Stop {
            service: service.to_string(),
            message: message.into(),
        }
    }
}

/// Errors in how a processor tree or endpoint is wired. Raised while building
/// or starting a route, never during a traversal.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Processor '{processor}' cannot delegate to itself.")]
    SelfDelegation { processor: ProcessorId },

    #[error("Processor id '{processor}' is used more than once in route '{route}'.")]
    DuplicateProcessorId { route: String, processor: ProcessorId },

    #[error("Processor '{processor}' is already wired into another processor tree.")]
    SharedProcessor { processor: ProcessorId },

    #[error("Processor '{processor}' is reachable from itself.")]
    Cycle { processor: ProcessorId },

    #[error("Endpoint '{uri}' is missing the mandatory parameter '{parameter}'.")]
    MissingParameter { uri: String, parameter: String },

    #[error("No {kind} named '{name}' is registered.")]
    UnknownReference { kind: &'static str, name: String },
}

impl ConfigError {
    #[inline]
    pub const fn self_delegation(processor: ProcessorId) -> Self {
        Self::SelfDelegation { processor }
    }

    #[inline]
    pub fn duplicate_processor_id(route: impl Into<String>, processor: ProcessorId) -> Self {
        Self::DuplicateProcessorId {
            route: route.into(),
            processor,
        }
    }

    #[inline]
    pub const fn shared_processor(processor: ProcessorId) -> Self {
        Self::SharedProcessor { processor }
    }

    #[inline]
    pub const fn cycle(processor: ProcessorId) -> Self {
        Self::Cycle { processor }
    }

    #[inline]
    pub fn missing_parameter(uri: impl Into<String>, parameter: impl Into<String>) -> Self {
        Self::MissingParameter {
            uri: uri.into(),
            parameter: parameter.into(),
        }
    }

    #[inline]
    pub fn unknown_reference(kind: &'static str, name: impl Into<String>) -> Self {
        Self::UnknownReference {
            kind,
            name: name.into(),
        }
    }
}

impl Debug for dyn AsyncProcessor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "AsyncProcessor({})", self.id())
    }
}
