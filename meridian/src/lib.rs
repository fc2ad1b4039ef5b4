//! An asynchronous routing and mediation engine.
//!
//! Exchanges enter a [`route::Route`] through an endpoint consumer and travel
//! down a tree of [`processor::AsyncProcessor`]s. Each processor completes its
//! step through an [`processor::AsyncCallback`], either before `process`
//! returns or later from another thread.
pub mod component;
pub mod config;
pub mod context;
pub mod exchange;
pub mod handler;
pub mod logger;
pub mod processor;
pub mod route;
pub mod status;
pub mod template;
pub mod uow;

pub use context::{ContextError, EngineContext};
pub use exchange::Exchange;
pub use template::{ProducerTemplate, TemplateError};
