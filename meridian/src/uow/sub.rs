use crate::exchange::{Exchange, ProcessingError};
use parking_lot::Mutex;

/// Receives the outcome of exchanges processed inside a sub unit of work.
///
/// Error handlers call [`on_exhausted`](SubUnitOfWorkCallback::on_exhausted)
/// instead of delivering to a dead-letter target when a sub unit is active, and
/// splitters that share their unit of work report every child through
/// [`on_done`](SubUnitOfWorkCallback::on_done).
pub trait SubUnitOfWorkCallback: Send + Sync {
    /// Redelivery gave up on `exchange`; the scope must be rolled back.
    fn on_exhausted(&self, exchange: &Exchange);

    /// `exchange` finished inside the scope, successfully or not.
    fn on_done(&self, exchange: &Exchange);
}

#[derive(Default)]
struct SubState {
    failures: Vec<ProcessingError>,
    rollback_only: bool,
}

/// A nested compensation scope opened by `begin_sub_unit_of_work`.
#[derive(Default)]
pub struct SubUnitOfWork {
    state: Mutex<SubState>,
}

impl SubUnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_failed(&self) -> bool {
        let state = self.state.lock();
        state.rollback_only || !state.failures.is_empty()
    }

    pub fn is_rollback_only(&self) -> bool {
        self.state.lock().rollback_only
    }

    pub fn failures(&self) -> Vec<ProcessingError> {
        self.state.lock().failures.clone()
    }
}

impl SubUnitOfWorkCallback for SubUnitOfWork {
    fn on_exhausted(&self, exchange: &Exchange) {
        let mut state = self.state.lock();
        state.rollback_only = true;
        if let Some(exception) = exchange.exception() {
            state.failures.push(exception.clone());
        }
    }

    fn on_done(&self, exchange: &Exchange) {
        if let Some(exception) = exchange.exception() {
            self.state.lock().failures.push(exception.clone());
        }
    }
}
