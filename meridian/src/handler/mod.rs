pub mod registry;

pub use registry::{ProcessorFactory, ProcessorRegistry, RegistryError};

use crate::exchange::{BoxError, Exchange, ProcessingError};
use crate::processor::{AsyncCallback, AsyncProcessor, PendingExchange, ProcessorId};
use async_trait::async_trait;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::runtime::Handle;

pub type SharedHandler = Arc<dyn Handler>;

/// An asynchronous processing step.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn exec(&self, exchange: &mut Exchange) -> Result<(), BoxError>;

    fn name(&self) -> &str;
}

/// Runs a [`Handler`] as a task on the runtime.
///
/// Always completes asynchronously. Errors and panics from the handler are
/// recorded on the exchange.
pub struct HandlerProcessor {
    id: ProcessorId,
    handler: SharedHandler,
    runtime: Handle,
}

impl HandlerProcessor {
    pub fn new(id: impl Into<ProcessorId>, handler: SharedHandler, runtime: Handle) -> Self {
        Self {
            id: id.into(),
            handler,
            runtime,
        }
    }

    pub fn handler_name(&self) -> &str {
        self.handler.name()
    }
}

impl AsyncProcessor for HandlerProcessor {
    fn process(&self, exchange: Exchange, callback: AsyncCallback) -> bool {
        let handler = self.handler.clone();
        let id = self.id.clone();
        let mut pending = PendingExchange::new(id.as_str(), exchange, callback);
        self.runtime.spawn(async move {
            if let Some(exchange) = pending.exchange_mut() {
                let result = AssertUnwindSafe(handler.exec(exchange)).catch_unwind().await;
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        log::debug!(
                            "Handler '{}' failed on exchange {}: {}",
                            handler.name(),
                            exchange.uuid(),
                            e
                        );
                        exchange.set_exception(ProcessingError::failed(id.as_str(), e));
                    }
                    Err(payload) => {
                        log::error!(
                            "Handler '{}' panicked on exchange {}",
                            handler.name(),
                            exchange.uuid()
                        );
                        exchange.set_exception(ProcessingError::from_panic(id.as_str(), payload));
                    }
                }
            }
            pending.complete();
        });
        false
    }

    fn id(&self) -> &ProcessorId {
        &self.id
    }
}
