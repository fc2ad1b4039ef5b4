use crate::component::{ComponentError, ComponentRegistry};
use crate::exchange::{Body, Exchange, ExchangePattern, ProcessingError};
use crate::processor::{AsyncProcessorExt, CompletionError, ServiceError, SharedAsyncProcessor};
use dashmap::{DashMap, Entry};
use fnv::FnvBuildHasher;
use std::any::Any;
use std::sync::Arc;
use thiserror::Error;

/// Sends exchanges into endpoints from outside any route.
///
/// Producers are created and started on first use of a URI and kept until
/// [`stop`](ProducerTemplate::stop).
pub struct ProducerTemplate {
    components: Arc<ComponentRegistry>,
    context_name: Arc<str>,
    producers: DashMap<String, SharedAsyncProcessor, FnvBuildHasher>,
}

impl ProducerTemplate {
    pub fn new(components: Arc<ComponentRegistry>, context_name: Arc<str>) -> Self {
        Self {
            components,
            context_name,
            producers: DashMap::with_hasher(FnvBuildHasher::default()),
        }
    }

    fn producer(&self, uri: &str) -> Result<SharedAsyncProcessor, TemplateError> {
        if let Some(producer) = self.producers.get(uri) {
            return Ok(producer.value().clone());
        }
        let endpoint = self.components.resolve_endpoint(uri)?;
        match self.producers.entry(uri.to_string()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let producer = endpoint.create_producer()?;
                producer.start()?;
                entry.insert(producer.clone());
                Ok(producer)
            }
        }
    }

    /// Sends `exchange` to `uri` and returns it once processing completed.
    /// Failures are left in the exchange's exception slot.
    pub async fn send(&self, uri: &str, mut exchange: Exchange) -> Result<Exchange, TemplateError> {
        let producer = self.producer(uri)?;
        if exchange.context_name().is_none() {
            exchange.set_context_name(self.context_name.clone());
        }
        let completion = producer.process_async(exchange).await?;
        Ok(completion.into_exchange())
    }

    /// Sends `body` as a request and returns the reply body.
    pub async fn request_body<T>(&self, uri: &str, body: T) -> Result<Body, TemplateError>
    where
        T: Any + Send + Sync,
    {
        let mut exchange = Exchange::with_body(body);
        exchange.set_pattern(ExchangePattern::InOut);
        let mut exchange = self.send(uri, exchange).await?;
        if let Some(exception) = exchange.take_exception() {
            return Err(TemplateError::Processing(exception));
        }
        let reply = match exchange.take_out_message() {
            Some(mut out) => out.take_body(),
            None => exchange.in_message_mut().take_body(),
        };
        reply.ok_or_else(|| TemplateError::NoBody {
            uri: uri.to_string(),
        })
    }

    /// Stops every cached producer. Continues past failures and reports the first.
    pub fn stop(&self) -> Result<(), TemplateError> {
        let producers: Vec<SharedAsyncProcessor> = self
            .producers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.producers.clear();
        let mut first_error = None;
        for producer in producers {
            if let Err(e) = producer.stop() {
                log::warn!("Failed to stop producer '{}': {}", producer.id(), e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            None => Ok(()),
            Some(e) => Err(e.into()),
        }
    }

    pub fn producer_count(&self) -> usize {
        self.producers.len()
    }
}

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error(transparent)]
    Component(#[from] ComponentError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Processing(ProcessingError),

    #[error(transparent)]
    Abandoned(#[from] CompletionError),

    #[error("Request to '{uri}' completed without a reply body.")]
    NoBody { uri: String },
}
