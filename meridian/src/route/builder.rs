use crate::component::ComponentRegistry;
use crate::config::EngineConfig;
use crate::handler::{HandlerProcessor, ProcessorRegistry};
use crate::processor::{
    ConfigError, ErrorHandlerProcessor, FilterProcessor, MulticastProcessor, Pipeline, ProcessorId,
    RedeliveryPolicy, SendProcessor, SharedAsyncProcessor, Splitter, ThreadsProcessor,
};
use crate::route::definition::{ProcessorRef, RouteDefinition, StepDefinition, Steps};
use crate::route::inflight::InflightProcessor;
use crate::route::{Route, RouteContext, RouteError};
use crate::uow::{SubUnitOfWorkProcessor, UnitOfWorkProcessor};
use fnv::FnvHashSet;
use std::sync::Arc;

/// Identity of a processor instance.
fn address(processor: &SharedAsyncProcessor) -> usize {
    Arc::as_ptr(processor) as *const () as usize
}

/// Turns a [`RouteDefinition`] into a started-ready [`Route`].
///
/// The processor tree is `inflight -> unit of work -> pipeline(steps)`. When
/// the route declares an error handler, every step, nested ones included, is
/// wrapped in its own [`ErrorHandlerProcessor`], so a redelivery repeats only
/// the step that failed. Ids are generated for unnamed steps as
/// `<route>-<kind>-<n>`, and every id must be unique within the route.
pub struct RouteBuilder<'a> {
    config: &'a EngineConfig,
    components: &'a ComponentRegistry,
    processors: &'a ProcessorRegistry,
    context: Arc<RouteContext>,
    error_handler: Option<StepErrorHandler>,
    ids: FnvHashSet<ProcessorId>,
    counter: usize,
}

#[derive(Clone)]
struct StepErrorHandler {
    policy: RedeliveryPolicy,
    dead_letter_uri: Option<String>,
}

impl<'a> RouteBuilder<'a> {
    pub fn new(
        config: &'a EngineConfig,
        components: &'a ComponentRegistry,
        processors: &'a ProcessorRegistry,
        context: Arc<RouteContext>,
    ) -> Self {
        Self {
            config,
            components,
            processors,
            context,
            error_handler: None,
            ids: FnvHashSet::default(),
            counter: 0,
        }
    }

    /// Builds the route. `owned` holds the processor instances already wired
    /// into other routes of the same context and receives this route's.
    pub fn build(
        mut self,
        definition: &RouteDefinition,
        owned: &mut FnvHashSet<usize>,
    ) -> Result<Route, RouteError> {
        let route_id = self.context.route_id().to_string();
        let from = definition
            .from_uri()
            .ok_or_else(|| ConfigError::missing_parameter(&route_id, "from"))?;
        let endpoint = self.components.resolve_endpoint(from)?;

        self.error_handler = definition
            .error_handler_definition()
            .map(|error_handler| StepErrorHandler {
                policy: error_handler
                    .policy
                    .clone()
                    .unwrap_or_else(|| self.config.redelivery.clone()),
                dead_letter_uri: error_handler.dead_letter_uri.clone(),
            });

        let pipeline_id = self.reserve(Some(&format!("{route_id}-pipeline")), "pipeline")?;
        let mut head: SharedAsyncProcessor = self.pipeline(pipeline_id, definition.step_definitions())?;

        let uow_id = self.reserve(Some(&format!("{route_id}-unit-of-work")), "unit-of-work")?;
        head = Arc::new(UnitOfWorkProcessor::new(
            uow_id,
            self.context.route_id_shared(),
            self.context.unit_of_work_factory(),
            head,
        )?);

        let inflight_id = self.reserve(Some(&format!("{route_id}-inflight")), "inflight")?;
        head = Arc::new(InflightProcessor::new(
            inflight_id,
            self.context.inflight(),
            self.context.context_name(),
            head,
        )?);

        validate_tree(&head, owned)?;
        log::debug!(
            "Built route '{}' from '{}' with {} processor(s)",
            route_id,
            endpoint.uri(),
            self.ids.len()
        );
        Ok(Route::new(self.context, endpoint, head))
    }

    fn reserve(&mut self, id: Option<&str>, kind: &str) -> Result<ProcessorId, ConfigError> {
        let id = match id {
            Some(id) => ProcessorId::new(id),
            None => {
                self.counter += 1;
                ProcessorId::new(format!("{}-{}-{}", self.context.route_id(), kind, self.counter))
            }
        };
        if !self.ids.insert(id.clone()) {
            return Err(ConfigError::duplicate_processor_id(self.context.route_id(), id));
        }
        Ok(id)
    }

    fn pipeline(&mut self, id: ProcessorId, steps: &Steps) -> Result<SharedAsyncProcessor, RouteError> {
        let processors = steps
            .iter()
            .map(|step| self.step(step))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Arc::new(Pipeline::new(id, processors)))
    }

    fn nested(&mut self, steps: &Steps) -> Result<SharedAsyncProcessor, RouteError> {
        let id = self.reserve(None, "pipeline")?;
        self.pipeline(id, steps)
    }

    fn step(&mut self, step: &StepDefinition) -> Result<SharedAsyncProcessor, RouteError> {
        let processor: SharedAsyncProcessor = match step {
            StepDefinition::Process {
                id,
                processor: ProcessorRef::Named(name),
            } => {
                let id = self.reserve(id.as_deref(), "process")?;
                if !self.processors.contains(name) {
                    return Err(ConfigError::unknown_reference("processor", name.as_str()).into());
                }
                self.processors.create(name, id)?
            }
            StepDefinition::Process {
                id,
                processor: ProcessorRef::Inline(processor),
            } => {
                let own = processor.id().as_str();
                if id.as_deref().is_some_and(|id| id != own) {
                    log::warn!(
                        "Inline processor '{}' keeps its own id; ignoring step id '{}'",
                        own,
                        id.as_deref().unwrap_or_default()
                    );
                }
                self.reserve(Some(own), "process")?;
                processor.clone()
            }
            StepDefinition::Handler { id, handler } => {
                let id = self.reserve(id.as_deref(), "handler")?;
                Arc::new(HandlerProcessor::new(
                    id,
                    handler.clone(),
                    self.context.runtime().clone(),
                ))
            }
            StepDefinition::Threads { id } => {
                let id = self.reserve(id.as_deref(), "threads")?;
                Arc::new(ThreadsProcessor::new(id, self.context.runtime().clone()))
            }
            StepDefinition::To { id, uri } => {
                let id = self.reserve(id.as_deref(), "to")?;
                let endpoint = self.components.resolve_endpoint(uri)?;
                Arc::new(SendProcessor::new(id, endpoint))
            }
            StepDefinition::Filter {
                id,
                predicate,
                steps,
            } => {
                let id = self.reserve(id.as_deref(), "filter")?;
                let child = self.nested(steps)?;
                Arc::new(FilterProcessor::new(id, predicate.clone(), child)?)
            }
            StepDefinition::Split(split) => {
                let id = self.reserve(split.id.as_deref(), "split")?;
                let child = self.nested(&split.steps)?;
                let share = split
                    .share_unit_of_work
                    .unwrap_or(self.config.split_share_unit_of_work);
                let mut splitter = Splitter::new(id, split.expression.clone(), child)?
                    .with_unit_of_work_factory(self.context.unit_of_work_factory())
                    .share_unit_of_work(share)
                    .stop_on_exception(split.stop_on_exception);
                if let Some(strategy) = &split.strategy {
                    splitter = splitter.with_strategy(strategy.clone());
                }
                Arc::new(splitter)
            }
            StepDefinition::Multicast(multicast) => {
                let id = self.reserve(multicast.id.as_deref(), "multicast")?;
                let branches = multicast
                    .branches
                    .iter()
                    .map(|steps| self.nested(steps))
                    .collect::<Result<Vec<_>, _>>()?;
                let mut processor = MulticastProcessor::new(id, branches)?
                    .with_unit_of_work_factory(self.context.unit_of_work_factory())
                    .share_unit_of_work(multicast.share_unit_of_work)
                    .stop_on_exception(multicast.stop_on_exception);
                if let Some(strategy) = &multicast.strategy {
                    processor = processor.with_strategy(strategy.clone());
                }
                if let Some(body) = &multicast.body {
                    processor = processor.with_branch_body(body.clone());
                }
                if multicast.parallel {
                    processor = processor.parallel(self.context.runtime().clone());
                }
                Arc::new(processor)
            }
            StepDefinition::SubUnitOfWork { id, steps } => {
                let id = self.reserve(id.as_deref(), "sub-unit-of-work")?;
                let child = self.nested(steps)?;
                Arc::new(SubUnitOfWorkProcessor::new(id, Some(child))?)
            }
        };
        self.guard(processor)
    }

    /// Wraps a step in the route's error handler, if it has one.
    fn guard(&mut self, processor: SharedAsyncProcessor) -> Result<SharedAsyncProcessor, RouteError> {
        let Some(error_handler) = self.error_handler.clone() else {
            return Ok(processor);
        };
        let step_id = processor.id().clone();
        let id = self.reserve(Some(&format!("{step_id}-error-handler")), "error-handler")?;
        let mut handler = ErrorHandlerProcessor::new(id, processor, error_handler.policy)?
            .with_runtime(self.context.runtime().clone());
        if let Some(uri) = &error_handler.dead_letter_uri {
            let dead_letter_id = self.reserve(Some(&format!("{step_id}-dead-letter")), "to")?;
            let endpoint = self.components.resolve_endpoint(uri)?;
            handler = handler.with_dead_letter(Arc::new(SendProcessor::new(dead_letter_id, endpoint)));
        }
        Ok(Arc::new(handler))
    }
}

/// Checks that the tree under `root` is a tree: no processor reachable from
/// itself, no instance wired twice, none already owned by another route.
/// On success the instances are added to `owned`.
pub(crate) fn validate_tree(
    root: &SharedAsyncProcessor,
    owned: &mut FnvHashSet<usize>,
) -> Result<(), ConfigError> {
    let mut seen = FnvHashSet::default();
    let mut path = Vec::new();
    visit(root, owned, &mut seen, &mut path)?;
    owned.extend(seen);
    Ok(())
}

fn visit(
    processor: &SharedAsyncProcessor,
    owned: &FnvHashSet<usize>,
    seen: &mut FnvHashSet<usize>,
    path: &mut Vec<usize>,
) -> Result<(), ConfigError> {
    let address = address(processor);
    if path.contains(&address) {
        return Err(ConfigError::cycle(processor.id().clone()));
    }
    if owned.contains(&address) || !seen.insert(address) {
        return Err(ConfigError::shared_processor(processor.id().clone()));
    }
    path.push(address);
    for child in processor.children() {
        visit(&child, owned, seen, path)?;
    }
    path.pop();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::testing::Recorder;
    use parking_lot::Mutex;

    #[test]
    fn test_validate_rejects_aliased_instance() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let shared = Recorder::shared("shared", &events);
        let root: SharedAsyncProcessor =
            Arc::new(Pipeline::new("root", vec![shared.clone(), shared]));
        let mut owned = FnvHashSet::default();
        assert!(matches!(
            validate_tree(&root, &mut owned),
            Err(ConfigError::SharedProcessor { .. })
        ));
        assert!(owned.is_empty());
    }

    #[test]
    fn test_validate_rejects_instance_owned_elsewhere() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let stage = Recorder::shared("stage", &events);
        let first: SharedAsyncProcessor = Arc::new(Pipeline::new("first", vec![stage.clone()]));
        let second: SharedAsyncProcessor = Arc::new(Pipeline::new("second", vec![stage]));
        let mut owned = FnvHashSet::default();
        validate_tree(&first, &mut owned).unwrap();
        assert_eq!(owned.len(), 2);
        assert!(matches!(
            validate_tree(&second, &mut owned),
            Err(ConfigError::SharedProcessor { .. })
        ));
    }
}
