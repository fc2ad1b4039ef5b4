use crate::handler::SharedHandler;
use crate::processor::{
    AggregationStrategy, BranchBody, Predicate, RedeliveryPolicy, SharedAsyncProcessor,
    SplitExpression,
};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

/// A processor given either by registry name or as an instance.
#[derive(Clone)]
pub enum ProcessorRef {
    Named(String),
    Inline(SharedAsyncProcessor),
}

/// One step of a route, before it is turned into a processor.
#[derive(Clone)]
pub enum StepDefinition {
    Process {
        id: Option<String>,
        processor: ProcessorRef,
    },
    Handler {
        id: Option<String>,
        handler: SharedHandler,
    },
    Threads {
        id: Option<String>,
    },
    To {
        id: Option<String>,
        uri: String,
    },
    Filter {
        id: Option<String>,
        predicate: Arc<dyn Predicate>,
        steps: Steps,
    },
    Split(SplitDefinition),
    Multicast(MulticastDefinition),
    SubUnitOfWork {
        id: Option<String>,
        steps: Steps,
    },
}

impl StepDefinition {
    pub fn id(&self) -> Option<&str> {
        match self {
            StepDefinition::Process { id, .. }
            | StepDefinition::Handler { id, .. }
            | StepDefinition::Threads { id }
            | StepDefinition::To { id, .. }
            | StepDefinition::Filter { id, .. }
            | StepDefinition::SubUnitOfWork { id, .. } => id.as_deref(),
            StepDefinition::Split(split) => split.id.as_deref(),
            StepDefinition::Multicast(multicast) => multicast.id.as_deref(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StepDefinition::Process { .. } => "process",
            StepDefinition::Handler { .. } => "handler",
            StepDefinition::Threads { .. } => "threads",
            StepDefinition::To { .. } => "to",
            StepDefinition::Filter { .. } => "filter",
            StepDefinition::Split(_) => "split",
            StepDefinition::Multicast(_) => "multicast",
            StepDefinition::SubUnitOfWork { .. } => "sub-unit-of-work",
        }
    }
}

impl Debug for StepDefinition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.kind(), self.id().unwrap_or("-"))
    }
}

/// An ordered list of steps, built fluently.
///
/// ```
/// use meridian::route::Steps;
///
/// let steps = Steps::new().process("audit").threads().to("direct:archive");
/// assert_eq!(steps.len(), 3);
/// ```
#[derive(Clone, Default, Debug)]
pub struct Steps {
    steps: Vec<StepDefinition>,
}

impl Steps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    /// Uses a fresh instance of the processor registered under `name`.
    pub fn process(self, name: impl Into<String>) -> Self {
        self.step(StepDefinition::Process {
            id: None,
            processor: ProcessorRef::Named(name.into()),
        })
    }

    /// Uses `processor` itself. An instance can be wired into one place only.
    pub fn process_with(self, processor: SharedAsyncProcessor) -> Self {
        self.step(StepDefinition::Process {
            id: None,
            processor: ProcessorRef::Inline(processor),
        })
    }

    pub fn handler(self, handler: SharedHandler) -> Self {
        self.step(StepDefinition::Handler { id: None, handler })
    }

    pub fn threads(self) -> Self {
        self.step(StepDefinition::Threads { id: None })
    }

    pub fn to(self, uri: impl Into<String>) -> Self {
        self.step(StepDefinition::To {
            id: None,
            uri: uri.into(),
        })
    }

    pub fn filter(self, predicate: Arc<dyn Predicate>, steps: Steps) -> Self {
        self.step(StepDefinition::Filter {
            id: None,
            predicate,
            steps,
        })
    }

    pub fn split(self, split: SplitDefinition) -> Self {
        self.step(StepDefinition::Split(split))
    }

    pub fn multicast(self, multicast: MulticastDefinition) -> Self {
        self.step(StepDefinition::Multicast(multicast))
    }

    pub fn sub_unit_of_work(self, steps: Steps) -> Self {
        self.step(StepDefinition::SubUnitOfWork { id: None, steps })
    }

    /// Names the most recently added step.
    pub fn id(mut self, step_id: impl Into<String>) -> Self {
        if let Some(step) = self.steps.last_mut() {
            let step_id = Some(step_id.into());
            match step {
                StepDefinition::Process { id, .. }
                | StepDefinition::Handler { id, .. }
                | StepDefinition::Threads { id }
                | StepDefinition::To { id, .. }
                | StepDefinition::Filter { id, .. }
                | StepDefinition::SubUnitOfWork { id, .. } => *id = step_id,
                StepDefinition::Split(split) => split.id = step_id,
                StepDefinition::Multicast(multicast) => multicast.id = step_id,
            }
        }
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, StepDefinition> {
        self.steps.iter()
    }
}

#[derive(Clone)]
pub struct SplitDefinition {
    pub(crate) id: Option<String>,
    pub(crate) expression: Arc<dyn SplitExpression>,
    pub(crate) steps: Steps,
    pub(crate) strategy: Option<Arc<dyn AggregationStrategy>>,
    pub(crate) share_unit_of_work: Option<bool>,
    pub(crate) stop_on_exception: bool,
}

impl SplitDefinition {
    pub fn new(expression: Arc<dyn SplitExpression>, steps: Steps) -> Self {
        Self {
            id: None,
            expression,
            steps,
            strategy: None,
            share_unit_of_work: None,
            stop_on_exception: false,
        }
    }

    pub fn strategy(mut self, strategy: Arc<dyn AggregationStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Overrides the engine-wide default.
    pub fn share_unit_of_work(mut self, share: bool) -> Self {
        self.share_unit_of_work = Some(share);
        self
    }

    pub fn stop_on_exception(mut self, stop: bool) -> Self {
        self.stop_on_exception = stop;
        self
    }
}

/// Several branches, each receiving a copy of the exchange.
#[derive(Clone)]
pub struct MulticastDefinition {
    pub(crate) id: Option<String>,
    pub(crate) branches: Vec<Steps>,
    pub(crate) strategy: Option<Arc<dyn AggregationStrategy>>,
    pub(crate) body: Option<Arc<dyn BranchBody>>,
    pub(crate) parallel: bool,
    pub(crate) share_unit_of_work: bool,
    pub(crate) stop_on_exception: bool,
}

impl MulticastDefinition {
    pub fn new() -> Self {
        Self {
            id: None,
            branches: Vec::new(),
            strategy: None,
            body: None,
            parallel: false,
            share_unit_of_work: false,
            stop_on_exception: false,
        }
    }

    pub fn branch(mut self, steps: Steps) -> Self {
        self.branches.push(steps);
        self
    }

    pub fn strategy(mut self, strategy: Arc<dyn AggregationStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn branch_body(mut self, body: Arc<dyn BranchBody>) -> Self {
        self.body = Some(body);
        self
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
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

impl Default for MulticastDefinition {
    fn default() -> Self {
        Self::new()
    }
}

/// Redelivery for a whole route.
#[derive(Clone, Debug, Default)]
pub struct ErrorHandlerDefinition {
    pub(crate) policy: Option<RedeliveryPolicy>,
    pub(crate) dead_letter_uri: Option<String>,
}

impl ErrorHandlerDefinition {
    /// Uses the engine's default redelivery policy.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn policy(mut self, policy: RedeliveryPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn dead_letter(mut self, uri: impl Into<String>) -> Self {
        self.dead_letter_uri = Some(uri.into());
        self
    }
}

/// A route description: where exchanges come from and the steps they take.
#[derive(Clone, Debug)]
pub struct RouteDefinition {
    id: String,
    from: Option<String>,
    steps: Steps,
    error_handler: Option<ErrorHandlerDefinition>,
}

impl RouteDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            from: None,
            steps: Steps::new(),
            error_handler: None,
        }
    }

    pub fn from(mut self, uri: impl Into<String>) -> Self {
        self.from = Some(uri.into());
        self
    }

    pub fn steps(mut self, steps: Steps) -> Self {
        self.steps = steps;
        self
    }

    pub fn error_handler(mut self, error_handler: ErrorHandlerDefinition) -> Self {
        self.error_handler = Some(error_handler);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn from_uri(&self) -> Option<&str> {
        self.from.as_deref()
    }

    pub fn step_definitions(&self) -> &Steps {
        &self.steps
    }

    pub fn error_handler_definition(&self) -> Option<&ErrorHandlerDefinition> {
        self.error_handler.as_ref()
    }
}
