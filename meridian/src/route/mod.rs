pub mod builder;
pub mod definition;
pub mod inflight;

pub use builder::RouteBuilder;
pub use definition::{
    ErrorHandlerDefinition, MulticastDefinition, ProcessorRef, RouteDefinition, SplitDefinition,
    StepDefinition, Steps,
};
pub use inflight::{InflightProcessor, InflightRepository};

use crate::component::{ComponentError, Consumer, Endpoint};
use crate::handler::RegistryError;
use crate::processor::{ConfigError, ServiceError, SharedAsyncProcessor};
use crate::status::ServiceStatus;
use crate::uow::UnitOfWorkFactory;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;

/// Runtime services a route's processors are bound to.
pub struct RouteContext {
    route_id: Arc<str>,
    context_name: Arc<str>,
    runtime: Handle,
    unit_of_work_factory: Arc<dyn UnitOfWorkFactory>,
    inflight: Arc<InflightRepository>,
    shutdown_timeout: Duration,
}

impl RouteContext {
    pub fn new(
        route_id: impl AsRef<str>,
        context_name: Arc<str>,
        runtime: Handle,
        unit_of_work_factory: Arc<dyn UnitOfWorkFactory>,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            route_id: Arc::from(route_id.as_ref()),
            context_name,
            runtime,
            unit_of_work_factory,
            inflight: Arc::new(InflightRepository::new()),
            shutdown_timeout,
        }
    }

    pub fn route_id(&self) -> &str {
        &self.route_id
    }

    pub(crate) fn route_id_shared(&self) -> Arc<str> {
        self.route_id.clone()
    }

    pub fn context_name(&self) -> Arc<str> {
        self.context_name.clone()
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub fn unit_of_work_factory(&self) -> Arc<dyn UnitOfWorkFactory> {
        self.unit_of_work_factory.clone()
    }

    pub fn inflight(&self) -> Arc<InflightRepository> {
        self.inflight.clone()
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }
}

/// A processor tree bound to the consumer of its `from` endpoint.
///
/// Start and stop are serialized: the tree is fully started before the
/// consumer is, and the consumer is stopped before the tree.
pub struct Route {
    context: Arc<RouteContext>,
    endpoint: Arc<dyn Endpoint>,
    processor: SharedAsyncProcessor,
    consumer: tokio::sync::Mutex<Option<Box<dyn Consumer>>>,
    status: RwLock<ServiceStatus>,
}

impl Route {
    pub(crate) fn new(
        context: Arc<RouteContext>,
        endpoint: Arc<dyn Endpoint>,
        processor: SharedAsyncProcessor,
    ) -> Self {
        Self {
            context,
            endpoint,
            processor,
            consumer: tokio::sync::Mutex::new(None),
            status: RwLock::new(ServiceStatus::Stopped),
        }
    }

    pub fn id(&self) -> &str {
        self.context.route_id()
    }

    pub fn endpoint(&self) -> &Arc<dyn Endpoint> {
        &self.endpoint
    }

    /// The head of the processor tree.
    pub fn processor(&self) -> &SharedAsyncProcessor {
        &self.processor
    }

    pub fn context(&self) -> &RouteContext {
        &self.context
    }

    pub fn status(&self) -> ServiceStatus {
        *self.status.read()
    }

    pub fn inflight_count(&self) -> usize {
        self.context.inflight.count()
    }

    fn set_status(&self, status: ServiceStatus) {
        *self.status.write() = status;
    }

    pub async fn start(&self) -> Result<(), RouteError> {
        let mut consumer = self.consumer.lock().await;
        if self.status().is_started() {
            return Ok(());
        }
        self.set_status(ServiceStatus::Starting);

        if let Err(e) = self.processor.start() {
            self.set_status(ServiceStatus::Stopped);
            return Err(RouteError::start(self.id(), e));
        }

        let started = self
            .endpoint
            .create_consumer(self.processor.clone())
            .map_err(|e| ServiceError::start(self.endpoint.uri(), e.to_string()))
            .and_then(|created| created.start().map(|_| created));
        match started {
            Ok(created) => {
                *consumer = Some(created);
                self.set_status(ServiceStatus::Started);
                log::info!("Route '{}' started, consuming from '{}'", self.id(), self.endpoint.uri());
                Ok(())
            }
            Err(e) => {
                if let Err(stop_error) = self.processor.stop() {
                    log::warn!(
                        "Route '{}' failed to roll back its processors: {}",
                        self.id(),
                        stop_error
                    );
                }
                self.set_status(ServiceStatus::Stopped);
                Err(RouteError::start(self.id(), e))
            }
        }
    }

    pub async fn stop(&self) -> Result<(), RouteError> {
        let mut consumer = self.consumer.lock().await;
        if self.status() == ServiceStatus::Stopped {
            return Ok(());
        }
        self.set_status(ServiceStatus::Stopping);

        let mut first_error = None;
        if let Some(consumer) = consumer.take() {
            if let Err(e) = consumer.stop() {
                log::warn!("Route '{}' failed to stop its consumer: {}", self.id(), e);
                first_error = Some(e);
            }
        }

        let timeout = self.context.shutdown_timeout();
        if !self.context.inflight.wait_drained(timeout).await {
            log::warn!(
                "Route '{}' stopping with {} exchange(s) still inflight after {:?}",
                self.id(),
                self.inflight_count(),
                timeout
            );
        }

        if let Err(e) = self.processor.stop() {
            first_error.get_or_insert(e);
        }
        self.set_status(ServiceStatus::Stopped);
        log::info!("Route '{}' stopped", self.id());

        match first_error {
            None => Ok(()),
            Some(e) => Err(RouteError::stop(self.id(), e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum RouteError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Component(#[from] ComponentError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Route '{route}' failed to start.")]
    Start {
        route: String,
        #[source]
        source: ServiceError,
    },

    #[error("Route '{route}' failed to stop cleanly.")]
    Stop {
        route: String,
        #[source]
        source: ServiceError,
    },
}

impl RouteError {
    #[inline]
    pub fn start(route: impl Into<String>, source: ServiceError) -> Self {
        Self::Start {
            route: route.into(),
            source,
        }
    }

    #[inline]
    pub fn stop(route: impl Into<String>, source: ServiceError) -> Self {
        Self::Stop {
            route: route.into(),
            source,
        }
    }
}
