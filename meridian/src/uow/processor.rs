use crate::exchange::Exchange;
use crate::processor::{
    AsyncCallback, AsyncProcessor, ConfigError, DelegateAsyncProcessor, ProcessorId, ServiceError,
    SharedAsyncProcessor,
};
use crate::uow::UnitOfWorkFactory;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

/// Runs its child inside a nested sub unit of work.
///
/// The scope is opened on the exchange's unit of work before the child is
/// called and closed when the child's callback fires, on whichever thread that
/// happens. The outer callback always follows with the `done_sync` value the
/// child reported, even when closing the scope fails or panics.
pub struct SubUnitOfWorkProcessor {
    delegate: DelegateAsyncProcessor,
}

impl SubUnitOfWorkProcessor {
    pub fn new(
        id: impl Into<ProcessorId>,
        processor: Option<SharedAsyncProcessor>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            delegate: DelegateAsyncProcessor::new(id, processor)?,
        })
    }
}

fn end_sub_unit_of_work(id: &ProcessorId, exchange: &mut Exchange) {
    let Some(mut unit_of_work) = exchange.take_unit_of_work() else {
        return;
    };
    let result = catch_unwind(AssertUnwindSafe(|| {
        unit_of_work.end_sub_unit_of_work(exchange)
    }));
    exchange.set_unit_of_work(unit_of_work);

    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::warn!(
            "Processor '{}' failed to end the sub unit of work of exchange {}: {}",
            id,
            exchange.uuid(),
            e
        ),
        Err(_) => log::error!(
            "Processor '{}' panicked while ending the sub unit of work of exchange {}",
            id,
            exchange.uuid()
        ),
    }
}

impl AsyncProcessor for SubUnitOfWorkProcessor {
    fn process(&self, mut exchange: Exchange, callback: AsyncCallback) -> bool {
        let opened = exchange
            .with_unit_of_work(|unit_of_work, exchange| {
                unit_of_work.begin_sub_unit_of_work(exchange)
            })
            .is_some();
        if !opened {
            log::debug!(
                "Exchange {} has no unit of work; '{}' runs without a sub unit of work",
                exchange.uuid(),
                self.delegate.id()
            );
        }

        let id = self.delegate.id().clone();
        self.delegate.process(
            exchange,
            AsyncCallback::new(move |mut exchange, done_sync| {
                if opened {
                    end_sub_unit_of_work(&id, &mut exchange);
                }
                callback.done(exchange, done_sync);
            }),
        )
    }

    fn id(&self) -> &ProcessorId {
        self.delegate.id()
    }

    fn start(&self) -> Result<(), ServiceError> {
        self.delegate.start()
    }

    fn stop(&self) -> Result<(), ServiceError> {
        self.delegate.stop()
    }

    fn children(&self) -> Vec<SharedAsyncProcessor> {
        self.delegate.children()
    }
}

/// The route-level unit of work boundary.
///
/// An exchange entering without a unit of work gets one from the factory; it
/// is completed and detached when this traversal finishes. An exchange that
/// already has one only records that it passed through this route.
pub struct UnitOfWorkProcessor {
    delegate: DelegateAsyncProcessor,
    route_id: Arc<str>,
    factory: Arc<dyn UnitOfWorkFactory>,
}

impl UnitOfWorkProcessor {
    pub fn new(
        id: impl Into<ProcessorId>,
        route_id: Arc<str>,
        factory: Arc<dyn UnitOfWorkFactory>,
        processor: SharedAsyncProcessor,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            delegate: DelegateAsyncProcessor::new(id, Some(processor))?,
            route_id,
            factory,
        })
    }

    pub fn route_id(&self) -> &str {
        &self.route_id
    }
}

impl AsyncProcessor for UnitOfWorkProcessor {
    fn process(&self, mut exchange: Exchange, callback: AsyncCallback) -> bool {
        let created = !exchange.has_unit_of_work();
        if created {
            let unit_of_work = self.factory.create_unit_of_work(&exchange);
            log::trace!(
                "Created unit of work {} for exchange {} on route '{}'",
                unit_of_work.id(),
                exchange.uuid(),
                self.route_id
            );
            exchange.set_unit_of_work(unit_of_work);
        }
        if exchange.from_route_id().is_none() {
            exchange.set_from_route_id(self.route_id.as_ref());
        }
        let route_id = self.route_id.clone();
        exchange.with_unit_of_work(|unit_of_work, _| unit_of_work.push_route(&route_id));

        self.delegate.process(
            exchange,
            AsyncCallback::new(move |mut exchange, done_sync| {
                if created {
                    if let Some(mut unit_of_work) = exchange.take_unit_of_work() {
                        unit_of_work.pop_route();
                        if let Err(e) = unit_of_work.done(&exchange) {
                            log::warn!(
                                "Unit of work of exchange {} on route '{}' completed with errors: {}",
                                exchange.uuid(),
                                route_id,
                                e
                            );
                        }
                    }
                } else {
                    exchange.with_unit_of_work(|unit_of_work, _| unit_of_work.pop_route());
                }
                callback.done(exchange, done_sync);
            }),
        )
    }

    fn id(&self) -> &ProcessorId {
        self.delegate.id()
    }

    fn start(&self) -> Result<(), ServiceError> {
        self.delegate.start()
    }

    fn stop(&self) -> Result<(), ServiceError> {
        self.delegate.stop()
    }

    fn children(&self) -> Vec<SharedAsyncProcessor> {
        self.delegate.children()
    }
}
