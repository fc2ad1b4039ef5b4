use crate::component::ComponentRegistry;
use crate::config::EngineConfig;
use crate::handler::ProcessorRegistry;
use crate::route::{Route, RouteBuilder, RouteContext, RouteDefinition, RouteError};
use crate::status::ServiceStatus;
use crate::template::ProducerTemplate;
use crate::uow::{DefaultUnitOfWorkFactory, UnitOfWorkFactory};
use fnv::FnvHashSet;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use thiserror::Error;
use tokio::runtime::Handle;

/// Owns the registries, the routes and the runtime they run on.
///
/// ```no_run
/// use meridian::config::EngineConfig;
/// use meridian::context::EngineContext;
/// use meridian::route::{RouteDefinition, Steps};
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let context = EngineContext::new(EngineConfig::default())?;
/// context.add_route(
///     RouteDefinition::new("greetings")
///         .from("direct:greet")
///         .steps(Steps::new().to("direct:audit")),
/// )?;
/// context.start().await?;
/// # Ok(())
/// # }
/// ```
pub struct EngineContext {
    name: Arc<str>,
    config: EngineConfig,
    components: Arc<ComponentRegistry>,
    processors: Arc<ProcessorRegistry>,
    unit_of_work_factory: Arc<dyn UnitOfWorkFactory>,
    runtime: Handle,
    routes: RwLock<Vec<Arc<Route>>>,
    owned_processors: Mutex<FnvHashSet<usize>>,
    status: RwLock<ServiceStatus>,
}

impl EngineContext {
    /// Creates a context on the runtime of the calling thread.
    pub fn new(config: EngineConfig) -> Result<Self, ContextError> {
        let runtime = Handle::try_current().map_err(|_| ContextError::NoRuntime)?;
        Ok(Self::with_runtime(config, runtime))
    }

    pub fn with_runtime(config: EngineConfig, runtime: Handle) -> Self {
        Self {
            name: Arc::from(config.name.as_str()),
            config,
            components: Arc::new(ComponentRegistry::with_defaults()),
            processors: Arc::new(ProcessorRegistry::new()),
            unit_of_work_factory: Arc::new(DefaultUnitOfWorkFactory),
            runtime,
            routes: RwLock::new(Vec::new()),
            owned_processors: Mutex::new(FnvHashSet::default()),
            status: RwLock::new(ServiceStatus::Stopped),
        }
    }

    /// Replaces the unit of work factory used by routes added from now on.
    pub fn with_unit_of_work_factory(mut self, factory: Arc<dyn UnitOfWorkFactory>) -> Self {
        self.unit_of_work_factory = factory;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn components(&self) -> &Arc<ComponentRegistry> {
        &self.components
    }

    pub fn processors(&self) -> &Arc<ProcessorRegistry> {
        &self.processors
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub fn status(&self) -> ServiceStatus {
        *self.status.read()
    }

    /// Builds and registers a route. The route is not started.
    pub fn add_route(&self, definition: RouteDefinition) -> Result<Arc<Route>, ContextError> {
        // held across the build so a rejected route never claims processors
        let mut routes = self.routes.write();
        if routes.iter().any(|existing| existing.id() == definition.id()) {
            return Err(ContextError::duplicate_route(definition.id()));
        }
        let route_context = Arc::new(RouteContext::new(
            definition.id(),
            self.name.clone(),
            self.runtime.clone(),
            self.unit_of_work_factory.clone(),
            self.config.shutdown_timeout(),
        ));

        let mut owned = self.owned_processors.lock();
        let route = RouteBuilder::new(&self.config, &self.components, &self.processors, route_context)
            .build(&definition, &mut owned)?;
        let route = Arc::new(route);
        routes.push(route.clone());
        log::debug!("Added route '{}' to context '{}'", route.id(), self.name);
        Ok(route)
    }

    pub fn route(&self, route_id: &str) -> Option<Arc<Route>> {
        self.routes
            .read()
            .iter()
            .find(|route| route.id() == route_id)
            .cloned()
    }

    pub fn routes(&self) -> Vec<Arc<Route>> {
        self.routes.read().clone()
    }

    pub fn route_status(&self, route_id: &str) -> Option<ServiceStatus> {
        self.route(route_id).map(|route| route.status())
    }

    /// Starts every route in the order added. If one fails, the routes
    /// already started are stopped again in reverse order.
    pub async fn start(&self) -> Result<(), ContextError> {
        *self.status.write() = ServiceStatus::Starting;
        let routes = self.routes();
        for (started, route) in routes.iter().enumerate() {
            if let Err(e) = route.start().await {
                log::error!("Context '{}' failed to start route '{}': {}", self.name, route.id(), e);
                for route in routes[..started].iter().rev() {
                    if let Err(stop_error) = route.stop().await {
                        log::warn!("Rollback of route '{}' failed: {}", route.id(), stop_error);
                    }
                }
                *self.status.write() = ServiceStatus::Stopped;
                return Err(e.into());
            }
        }
        *self.status.write() = ServiceStatus::Started;
        log::info!("Context '{}' started {} route(s)", self.name, routes.len());
        Ok(())
    }

    /// Stops every route in reverse order, continuing past failures.
    pub async fn stop(&self) -> Result<(), ContextError> {
        *self.status.write() = ServiceStatus::Stopping;
        let mut first_error = None;
        for route in self.routes().iter().rev() {
            if let Err(e) = route.stop().await {
                log::warn!("Context '{}' failed to stop route '{}': {}", self.name, route.id(), e);
                first_error.get_or_insert(e);
            }
        }
        *self.status.write() = ServiceStatus::Stopped;
        log::info!("Context '{}' stopped", self.name);
        match first_error {
            None => Ok(()),
            Some(e) => Err(e.into()),
        }
    }

    pub async fn start_route(&self, route_id: &str) -> Result<(), ContextError> {
        let route = self
            .route(route_id)
            .ok_or_else(|| ContextError::unknown_route(route_id))?;
        route.start().await.map_err(ContextError::from)
    }

    pub async fn stop_route(&self, route_id: &str) -> Result<(), ContextError> {
        let route = self
            .route(route_id)
            .ok_or_else(|| ContextError::unknown_route(route_id))?;
        route.stop().await.map_err(ContextError::from)
    }

    pub fn producer_template(&self) -> ProducerTemplate {
        ProducerTemplate::new(self.components.clone(), self.name.clone())
    }
}

#[derive(Error, Debug)]
pub enum ContextError {
    #[error("No tokio runtime is available to run the engine on.")]
    NoRuntime,

    #[error("A route with id '{route}' already exists.")]
    DuplicateRoute { route: String },

    #[error("No route with id '{route}'.")]
    UnknownRoute { route: String },

    #[error(transparent)]
    Route(#[from] RouteError),
}

impl ContextError {
    #[inline]
    pub fn duplicate_route(route: impl Into<String>) -> Self {
        Self::DuplicateRoute {
            route: route.into(),
        }
    }

    #[inline]
    pub fn unknown_route(route: impl Into<String>) -> Self {
        Self::UnknownRoute {
            route: route.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{Body, BoxError, Exchange, ProcessingError};
    use crate::processor::testing::Recorder;
    use crate::processor::{ConfigError, processor_fn, to_async};
    use crate::route::{SplitDefinition, Steps};
    use crate::template::TemplateError;

    #[test]
    fn test_new_without_runtime_fails() {
        assert!(matches!(
            EngineContext::new(EngineConfig::default()),
            Err(ContextError::NoRuntime)
        ));
    }

    #[tokio::test]
    async fn test_routes_start_in_order_and_stop_in_reverse() {
        let context = EngineContext::new(EngineConfig::default()).unwrap();
        context
            .add_route(RouteDefinition::new("first").from("direct:first"))
            .unwrap();
        context
            .add_route(RouteDefinition::new("second").from("direct:second"))
            .unwrap();

        context.start().await.unwrap();
        assert_eq!(context.status(), ServiceStatus::Started);
        assert_eq!(context.route_status("first"), Some(ServiceStatus::Started));
        assert_eq!(context.route_status("second"), Some(ServiceStatus::Started));

        context.stop_route("second").await.unwrap();
        assert_eq!(context.route_status("second"), Some(ServiceStatus::Stopped));
        context.start_route("second").await.unwrap();

        context.stop().await.unwrap();
        assert_eq!(context.route_status("first"), Some(ServiceStatus::Stopped));
        assert!(context.route_status("missing").is_none());
    }

    #[tokio::test]
    async fn test_duplicate_and_unknown_routes() {
        let context = EngineContext::new(EngineConfig::default()).unwrap();
        context
            .add_route(RouteDefinition::new("only").from("direct:only"))
            .unwrap();
        assert!(matches!(
            context.add_route(RouteDefinition::new("only").from("direct:other")),
            Err(ContextError::DuplicateRoute { .. })
        ));
        assert!(matches!(
            context.start_route("ghost").await,
            Err(ContextError::UnknownRoute { .. })
        ));
    }

    #[tokio::test]
    async fn test_rejected_duplicate_claims_no_processors() {
        let context = EngineContext::new(EngineConfig::default()).unwrap();
        let events = Arc::new(parking_lot::Mutex::new(Vec::new()));
        context
            .add_route(
                RouteDefinition::new("only")
                    .from("direct:only")
                    .steps(Steps::new().process_with(Recorder::shared("first", &events))),
            )
            .unwrap();
        let claimed = context.owned_processors.lock().len();

        let second = Recorder::shared("second", &events);
        assert!(matches!(
            context.add_route(
                RouteDefinition::new("only")
                    .from("direct:other")
                    .steps(Steps::new().process_with(second.clone()))
            ),
            Err(ContextError::DuplicateRoute { .. })
        ));
        assert_eq!(context.owned_processors.lock().len(), claimed);
        context
            .add_route(
                RouteDefinition::new("other")
                    .from("direct:other")
                    .steps(Steps::new().process_with(second)),
            )
            .unwrap();
    }

    #[tokio::test]
    async fn test_start_failure_rolls_back_earlier_routes() {
        let context = EngineContext::new(EngineConfig::default()).unwrap();
        context
            .add_route(RouteDefinition::new("first").from("direct:shared"))
            .unwrap();
        // a second consumer on the same direct endpoint cannot start
        context
            .add_route(RouteDefinition::new("second").from("direct:shared"))
            .unwrap();

        assert!(context.start().await.is_err());
        assert_eq!(context.route_status("first"), Some(ServiceStatus::Stopped));
        assert_eq!(context.status(), ServiceStatus::Stopped);
    }

    #[tokio::test]
    async fn test_processor_instance_cannot_join_two_routes() {
        let context = EngineContext::new(EngineConfig::default()).unwrap();
        let events = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let shared = Recorder::shared("shared", &events);
        context
            .add_route(
                RouteDefinition::new("a")
                    .from("direct:a")
                    .steps(Steps::new().process_with(shared.clone())),
            )
            .unwrap();
        assert!(matches!(
            context.add_route(
                RouteDefinition::new("b")
                    .from("direct:b")
                    .steps(Steps::new().process_with(shared))
            ),
            Err(ContextError::Route(RouteError::Config(
                ConfigError::SharedProcessor { .. }
            )))
        ));
    }

    #[tokio::test]
    async fn test_routes_chain_through_template() {
        let context = EngineContext::new(EngineConfig::default()).unwrap();
        context
            .processors()
            .register("shout", |id| {
                to_async(
                    id,
                    processor_fn(|exchange: &mut Exchange| -> Result<(), BoxError> {
                        let text = exchange
                            .in_message()
                            .body_as::<String>()
                            .cloned()
                            .unwrap_or_default();
                        exchange.out_message_mut().set_body(text.to_uppercase());
                        Ok(())
                    }),
                )
            })
            .unwrap();
        context
            .add_route(
                RouteDefinition::new("entry")
                    .from("direct:entry")
                    .steps(Steps::new().threads().to("direct:shout")),
            )
            .unwrap();
        context
            .add_route(
                RouteDefinition::new("shouting")
                    .from("direct:shout")
                    .steps(Steps::new().process("shout")),
            )
            .unwrap();
        context.start().await.unwrap();

        let template = context.producer_template();
        let body = template
            .request_body("direct:entry", String::from("hello"))
            .await
            .unwrap();
        assert_eq!(body.downcast_ref::<String>().unwrap(), "HELLO");

        assert!(matches!(
            template.request_body("direct:nowhere", String::new()).await,
            Err(TemplateError::Processing(
                ProcessingError::NoConsumer { .. }
            ))
        ));
        context.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_split_part_reaches_caller() {
        let context = EngineContext::new(EngineConfig::default()).unwrap();
        let fail_second = to_async(
            "fail-second",
            processor_fn(|exchange: &mut Exchange| -> Result<(), BoxError> {
                if exchange.properties().split_index() == Some(1) {
                    return Err("second part rejected".into());
                }
                Ok(())
            }),
        );
        let numbers = Arc::new(|_: &Exchange| -> Result<Vec<Body>, BoxError> {
            Ok(vec![Body::new(1u32), Body::new(2u32), Body::new(3u32)])
        });
        context
            .add_route(
                RouteDefinition::new("splitting").from("direct:split").steps(
                    Steps::new().split(SplitDefinition::new(
                        numbers,
                        Steps::new().process_with(fail_second),
                    )),
                ),
            )
            .unwrap();
        context.start().await.unwrap();

        let result = context
            .producer_template()
            .request_body("direct:split", String::from("payload"))
            .await;
        match result {
            Err(TemplateError::Processing(ProcessingError::Failed { processor, .. })) => {
                assert_eq!(processor, "fail-second")
            }
            other => panic!("expected the part failure, got {:?}", other.map(|_| ())),
        }
        context.stop().await.unwrap();
    }
}
