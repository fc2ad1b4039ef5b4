pub mod processor;
pub mod sub;

pub use processor::{SubUnitOfWorkProcessor, UnitOfWorkProcessor};
pub use sub::{SubUnitOfWork, SubUnitOfWorkCallback};

use crate::exchange::{BoxError, Exchange, ProcessingError};
use crate::status::ExchangeState;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Hooks run when a unit of work completes.
pub trait Synchronization: Send + Sync {
    fn on_complete(&self, exchange: &Exchange) -> Result<(), BoxError>;

    fn on_failure(&self, exchange: &Exchange) -> Result<(), BoxError>;
}

/// The transactional and compensation boundary attached to an exchange while it
/// traverses a route.
///
/// A unit of work is either top-level (created when an exchange enters a route)
/// or a child sharing its parent's sub-unit-of-work callback (created for split
/// parts that share their parent's unit of work). Sub units of work nest
/// arbitrarily and must be ended in the reverse order they were begun.
pub trait UnitOfWork: Send + Sync {
    fn id(&self) -> &Uuid;

    /// Whether this unit of work was created as the child of another one.
    fn is_child(&self) -> bool;

    fn add_synchronization(&mut self, synchronization: Box<dyn Synchronization>);

    /// Opens a nested scope.
    fn begin_sub_unit_of_work(&mut self, exchange: &Exchange);

    /// Closes the innermost scope and applies its outcome to `exchange`.
    ///
    /// Ending when no scope is open is a no-op, so a doubled end call is safe.
    fn end_sub_unit_of_work(&mut self, exchange: &mut Exchange) -> Result<(), UnitOfWorkError>;

    /// The callback of the innermost open scope, if any.
    fn sub_unit_of_work_callback(&self) -> Option<Arc<dyn SubUnitOfWorkCallback>>;

    fn create_child_unit_of_work(&self, child: &Exchange) -> Box<dyn UnitOfWork>;

    fn push_route(&mut self, route_id: &str);

    fn pop_route(&mut self) -> Option<String>;

    /// The route currently processing the exchange.
    fn route_id(&self) -> Option<&str>;

    /// Completes the unit of work and runs its synchronizations.
    fn done(&mut self, exchange: &Exchange) -> Result<(), UnitOfWorkError>;
}

/// Creates the top-level unit of work for exchanges entering a route.
pub trait UnitOfWorkFactory: Send + Sync {
    fn create_unit_of_work(&self, exchange: &Exchange) -> Box<dyn UnitOfWork>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultUnitOfWorkFactory;

impl UnitOfWorkFactory for DefaultUnitOfWorkFactory {
    fn create_unit_of_work(&self, exchange: &Exchange) -> Box<dyn UnitOfWork> {
        Box::new(DefaultUnitOfWork::new(exchange))
    }
}

pub struct DefaultUnitOfWork {
    id: Uuid,
    exchange_id: Uuid,
    created: DateTime<Utc>,
    synchronizations: Vec<Box<dyn Synchronization>>,
    sub_units: Vec<Arc<SubUnitOfWork>>,
    parent_callback: Option<Arc<dyn SubUnitOfWorkCallback>>,
    child: bool,
    routes: Vec<String>,
    done: bool,
}

impl DefaultUnitOfWork {
    pub fn new(exchange: &Exchange) -> Self {
        Self {
            id: Uuid::new_v4(),
            exchange_id: *exchange.uuid(),
            created: Utc::now(),
            synchronizations: Vec::new(),
            sub_units: Vec::new(),
            parent_callback: None,
            child: false,
            routes: Vec::new(),
            done: false,
        }
    }

    /// A unit of work that reports to `parent_callback` while it has no scope of
    /// its own open.
    pub fn new_child(
        exchange: &Exchange,
        parent_callback: Option<Arc<dyn SubUnitOfWorkCallback>>,
    ) -> Self {
        Self {
            parent_callback,
            child: true,
            ..Self::new(exchange)
        }
    }

    pub fn exchange_id(&self) -> &Uuid {
        &self.exchange_id
    }

    pub fn created(&self) -> &DateTime<Utc> {
        &self.created
    }

    pub fn sub_unit_of_work_depth(&self) -> usize {
        self.sub_units.len()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }
}

impl UnitOfWork for DefaultUnitOfWork {
    fn id(&self) -> &Uuid {
        &self.id
    }

    fn is_child(&self) -> bool {
        self.child
    }

    fn add_synchronization(&mut self, synchronization: Box<dyn Synchronization>) {
        self.synchronizations.push(synchronization);
    }

    fn begin_sub_unit_of_work(&mut self, exchange: &Exchange) {
        log::trace!(
            "Exchange {} begins sub unit of work at depth {}",
            exchange.uuid(),
            self.sub_units.len() + 1
        );
        self.sub_units.push(Arc::new(SubUnitOfWork::new()));
    }

    fn end_sub_unit_of_work(&mut self, exchange: &mut Exchange) -> Result<(), UnitOfWorkError> {
        let Some(sub_unit) = self.sub_units.pop() else {
            log::debug!(
                "Exchange {} ended a sub unit of work that was not open; ignoring.",
                exchange.uuid()
            );
            return Ok(());
        };
        log::trace!(
            "Exchange {} ends sub unit of work at depth {}",
            exchange.uuid(),
            self.sub_units.len() + 1
        );

        if sub_unit.is_failed() {
            let mut failures = sub_unit.failures();
            match failures.len() {
                0 => {}
                1 => exchange.set_exception(failures.remove(0)),
                _ => exchange.set_exception(ProcessingError::SubUnitOfWork { failures }),
            }
            let state = exchange.state_mut();
            state.set(ExchangeState::ROLLBACK_ONLY | ExchangeState::UNIT_OF_WORK_EXHAUSTED);
            state.clear(ExchangeState::ERROR_HANDLER_HANDLED | ExchangeState::FAILURE_HANDLED);
        }
        Ok(())
    }

    fn sub_unit_of_work_callback(&self) -> Option<Arc<dyn SubUnitOfWorkCallback>> {
        match self.sub_units.last() {
            Some(sub_unit) => Some(sub_unit.clone() as Arc<dyn SubUnitOfWorkCallback>),
            None => self.parent_callback.clone(),
        }
    }

    fn create_child_unit_of_work(&self, child: &Exchange) -> Box<dyn UnitOfWork> {
        let mut unit_of_work = DefaultUnitOfWork::new_child(child, self.sub_unit_of_work_callback());
        unit_of_work.routes = self.routes.clone();
        Box::new(unit_of_work)
    }

    fn push_route(&mut self, route_id: &str) {
        self.routes.push(route_id.to_string());
    }

    fn pop_route(&mut self) -> Option<String> {
        self.routes.pop()
    }

    fn route_id(&self) -> Option<&str> {
        self.routes.last().map(String::as_str)
    }

    fn done(&mut self, exchange: &Exchange) -> Result<(), UnitOfWorkError> {
        if self.done {
            log::debug!("Unit of work {} is already done.", self.id);
            return Ok(());
        }
        self.done = true;

        let failed = exchange.is_failed();
        let mut failures = 0;
        for synchronization in &self.synchronizations {
            let result = if failed {
                synchronization.on_failure(exchange)
            } else {
                synchronization.on_complete(exchange)
            };
            if let Err(e) = result {
                failures += 1;
                log::warn!(
                    "Synchronization failed for exchange {} in unit of work {}: {}",
                    exchange.uuid(),
                    self.id,
                    e
                );
            }
        }
        if !self.sub_units.is_empty() {
            log::warn!(
                "Unit of work {} completed with {} sub unit(s) of work still open.",
                self.id,
                self.sub_units.len()
            );
        }

        if failures > 0 {
            return Err(UnitOfWorkError::synchronization(self.id, failures));
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum UnitOfWorkError {
    #[error("{count} synchronization(s) failed while completing unit of work {id}.")]
    Synchronization { id: Uuid, count: usize },

    #[error("Unit of work {id} could not end its sub unit of work: {message}")]
    SubUnitOfWork { id: Uuid, message: String },
}

impl UnitOfWorkError {
    #[inline]
    pub const fn synchronization(id: Uuid, count: usize) -> Self {
        Self::Synchronization { id, count }
    }

    #[inline]
    pub fn sub_unit_of_work(id: Uuid, message: impl Into<String>) -> Self {
        Self::SubUnitOfWork {
            id,
            message: message.into(),
        }
    }
}
