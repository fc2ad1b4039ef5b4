pub mod fault;
pub mod message;
pub mod properties;

pub use fault::{BoxError, ProcessingError, SharedError};
pub use message::{Body, Message};
pub use properties::ExchangeProperties;

use crate::status::ExchangeState;
use crate::uow::UnitOfWork;
use chrono::{DateTime, Utc};
use fnv::FnvHasher;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt::{Debug, Display, Formatter};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use uuid::Uuid;

/// Whether the caller of a route expects a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExchangePattern {
    /// Fire-and-forget.
    #[default]
    InOnly,
    /// Request-response; the caller reads the resulting message.
    InOut,
}

impl Display for ExchangePattern {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ExchangePattern::InOnly => write!(f, "InOnly"),
            ExchangePattern::InOut => write!(f, "InOut"),
        }
    }
}

/// The unit of work flowing through a route.
///
/// An exchange carries an inbound message, an optional outbound message, typed
/// properties, an exception slot and the unit of work that tracks its traversal.
/// Processors mutate it in place; ownership moves from stage to stage together
/// with the [`AsyncCallback`](crate::processor::AsyncCallback) that completes
/// the stage, so an exchange is never shared between concurrent traversals.
///
/// # Failure state
/// Once [`set_exception`](Exchange::set_exception) has been called the exchange
/// is *failed*. Multi-stage processors check [`is_failed`](Exchange::is_failed)
/// before driving the next stage, and error-handling processors may clear or
/// replace the exception.
///
/// # Examples
/// ```rust
/// use meridian::exchange::{Exchange, ExchangePattern};
///
/// let mut exchange = Exchange::new();
/// exchange.set_pattern(ExchangePattern::InOut);
/// exchange.in_message_mut().set_body(String::from("hello"));
/// assert_eq!(exchange.in_message().body_as::<String>().unwrap(), "hello");
/// ```
pub struct Exchange {
    uuid: Uuid,
    pattern: ExchangePattern,
    created: DateTime<Utc>,
    in_message: Message,
    out_message: Option<Message>,
    properties: ExchangeProperties,
    extensions: Attachments,
    exception: Option<ProcessingError>,
    unit_of_work: Option<Box<dyn UnitOfWork>>,
    from_endpoint: Option<String>,
    from_route_id: Option<String>,
    context_name: Option<Arc<str>>,
}

impl Exchange {
    /// Creates a new exchange with a random V4 UUID and an empty inbound message.
    pub fn new() -> Self {
        Self::new_with_uuid(Uuid::new_v4())
    }

    /// Creates a new exchange with a specific UUID.
    ///
    /// # Parameters
    /// - `uuid`: The identifier to assign to this exchange
    pub fn new_with_uuid(uuid: Uuid) -> Self {
        Self {
            uuid,
            pattern: ExchangePattern::default(),
            created: Utc::now(),
            in_message: Message::new(),
            out_message: None,
            properties: ExchangeProperties::default(),
            extensions: Attachments::new(),
            exception: None,
            unit_of_work: None,
            from_endpoint: None,
            from_route_id: None,
            context_name: None,
        }
    }

    /// Creates a new exchange whose inbound message carries `body`.
    pub fn with_body<T>(body: T) -> Self
    where
        T: Any + Send + Sync,
    {
        let mut exchange = Self::new();
        exchange.in_message.set_body(body);
        exchange
    }

    pub fn uuid(&self) -> &Uuid {
        &self.uuid
    }

    pub fn pattern(&self) -> ExchangePattern {
        self.pattern
    }

    pub fn set_pattern(&mut self, pattern: ExchangePattern) {
        self.pattern = pattern;
    }

    pub fn created(&self) -> &DateTime<Utc> {
        &self.created
    }

    pub fn in_message(&self) -> &Message {
        &self.in_message
    }

    pub fn in_message_mut(&mut self) -> &mut Message {
        &mut self.in_message
    }

    pub fn has_out(&self) -> bool {
        self.out_message.is_some()
    }

    pub fn out_message(&self) -> Option<&Message> {
        self.out_message.as_ref()
    }

    /// Returns the outbound message, creating an empty one first if needed.
    pub fn out_message_mut(&mut self) -> &mut Message {
        self.out_message.get_or_insert_with(Message::new)
    }

    pub fn set_out_message(&mut self, message: Message) {
        self.out_message = Some(message);
    }

    pub fn take_out_message(&mut self) -> Option<Message> {
        self.out_message.take()
    }

    /// Returns the message currently meaningful for the exchange: the outbound
    /// message when one has been set, otherwise the inbound message.
    pub fn message(&self) -> &Message {
        match &self.out_message {
            Some(out) => out,
            None => &self.in_message,
        }
    }

    /// Mutable counterpart of [`message`](Exchange::message).
    pub fn message_mut(&mut self) -> &mut Message {
        match self.out_message {
            Some(ref mut out) => out,
            None => &mut self.in_message,
        }
    }

    /// Promotes a pending outbound message to be the inbound message of the next
    /// stage so only one message state stays meaningful.
    pub fn prepare_next(&mut self) {
        if let Some(out) = self.out_message.take() {
            self.in_message = out;
        }
    }

    pub fn properties(&self) -> &ExchangeProperties {
        &self.properties
    }

    pub fn properties_mut(&mut self) -> &mut ExchangeProperties {
        &mut self.properties
    }

    pub fn state(&self) -> ExchangeState {
        self.properties.state()
    }

    pub fn state_mut(&mut self) -> &mut ExchangeState {
        self.properties.state_mut()
    }

    /// Extension properties not covered by [`ExchangeProperties`].
    ///
    /// Extensions are scoped to this exchange and are not copied into child
    /// exchanges.
    pub fn extensions(&self) -> &Attachments {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Attachments {
        &mut self.extensions
    }

    pub fn exception(&self) -> Option<&ProcessingError> {
        self.exception.as_ref()
    }

    pub fn set_exception(&mut self, exception: ProcessingError) {
        self.exception = Some(exception);
    }

    pub fn take_exception(&mut self) -> Option<ProcessingError> {
        self.exception.take()
    }

    pub fn is_failed(&self) -> bool {
        self.exception.is_some()
    }

    pub fn is_route_stop(&self) -> bool {
        self.state().any_flags(ExchangeState::ROUTE_STOP)
    }

    /// Marks the exchange so no further stages of the current route are run.
    pub fn set_route_stop(&mut self, stop: bool) {
        if stop {
            self.state_mut().set(ExchangeState::ROUTE_STOP);
        } else {
            self.state_mut().clear(ExchangeState::ROUTE_STOP);
        }
    }

    /// Cancels the traversal cooperatively.
    ///
    /// Sets the interruption marker together with an
    /// [`Interrupted`](ProcessingError::Interrupted) exception; processors that
    /// honour the failure state short-circuit from here on.
    pub fn interrupt(&mut self, reason: impl Into<String>) {
        self.state_mut().set(ExchangeState::INTERRUPTED);
        self.exception = Some(ProcessingError::interrupted(reason));
    }

    pub fn is_interrupted(&self) -> bool {
        self.state().any_flags(ExchangeState::INTERRUPTED)
    }

    pub fn unit_of_work(&self) -> Option<&dyn UnitOfWork> {
        self.unit_of_work.as_deref()
    }

    pub fn has_unit_of_work(&self) -> bool {
        self.unit_of_work.is_some()
    }

    pub fn set_unit_of_work(&mut self, unit_of_work: Box<dyn UnitOfWork>) {
        self.unit_of_work = Some(unit_of_work);
    }

    pub fn take_unit_of_work(&mut self) -> Option<Box<dyn UnitOfWork>> {
        self.unit_of_work.take()
    }

    /// Runs `f` with the unit of work detached from the exchange so both can be
    /// borrowed mutably at the same time.
    ///
    /// # Returns
    /// `None` when the exchange has no unit of work, otherwise the result of `f`.
    pub fn with_unit_of_work<R>(
        &mut self,
        f: impl FnOnce(&mut dyn UnitOfWork, &mut Exchange) -> R,
    ) -> Option<R> {
        let mut unit_of_work = self.unit_of_work.take()?;
        let result = f(unit_of_work.as_mut(), self);
        self.unit_of_work = Some(unit_of_work);
        Some(result)
    }

    pub fn from_endpoint(&self) -> Option<&str> {
        self.from_endpoint.as_deref()
    }

    pub fn set_from_endpoint(&mut self, uri: impl Into<String>) {
        self.from_endpoint = Some(uri.into());
    }

    pub fn from_route_id(&self) -> Option<&str> {
        self.from_route_id.as_deref()
    }

    pub fn set_from_route_id(&mut self, route_id: impl Into<String>) {
        self.from_route_id = Some(route_id.into());
    }

    pub fn context_name(&self) -> Option<&str> {
        self.context_name.as_deref()
    }

    pub fn set_context_name(&mut self, name: Arc<str>) {
        self.context_name = Some(name);
    }

    /// Creates a child exchange for a sub-chain (a split part or a branch).
    ///
    /// The child gets a new id, a copy of the inbound headers, a copy of the
    /// known properties and `body` as its inbound body. The correlation id
    /// points back at this exchange. It has no outbound message, no exception
    /// and no unit of work; extensions and attachments stay with the parent.
    pub fn create_child(&self, body: Option<Body>) -> Exchange {
        let mut child = Exchange::new();
        child.pattern = self.pattern;
        child.in_message = self.in_message.copy_headers();
        if let Some(body) = body {
            child.in_message.set_body_value(body);
        }
        child.properties = self.properties.clone();
        child.properties.set_correlation_id(self.uuid);
        child.from_endpoint = self.from_endpoint.clone();
        child.from_route_id = self.from_route_id.clone();
        child.context_name = self.context_name.clone();
        child
    }
}

impl Default for Exchange {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for Exchange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("uuid", &self.uuid)
            .field("pattern", &self.pattern)
            .field("in_message", &self.in_message)
            .field("out_message", &self.out_message)
            .field("properties", &self.properties)
            .field("exception", &self.exception)
            .field("has_unit_of_work", &self.unit_of_work.is_some())
            .field("from_route_id", &self.from_route_id)
            .finish()
    }
}

/// Typed key/value storage keyed by a string and the value's `TypeId`.
pub struct Attachments {
    attachments: HashMap<AttachmentKey, Box<dyn Any + Send + Sync>, fnv::FnvBuildHasher>,
}

impl Attachments {
    /// Creates a new empty attachments collection.
    pub fn new() -> Self {
        Self {
            attachments: HashMap::with_hasher(fnv::FnvBuildHasher::default()),
        }
    }

    /// Adds a typed value to the attachments collection.
    ///
    /// # Parameters
    /// - `key`: A string-like key that can be converted via `AsRef<str>`
    /// - `value`: A value of type `K` that implements `Send + Sync + 'static`
    ///
    /// # Examples
    /// ```rust
    /// use meridian::exchange::Attachments;
    ///
    /// let mut attachments = Attachments::new();
    /// attachments.add("user_id", 123u32);
    /// attachments.add("username", "alice".to_string());
    /// ```
    ///
    /// # Behavior
    /// The value is stored with a composite key that includes both the string key and
    /// the type ID. This allows storing multiple values with the same string key but
    /// different types. Previous values with the same key and type will be replaced.
    pub fn add<K>(&mut self, key: impl AsRef<str>, value: K)
    where
        K: Send + Sync + 'static,
    {
        let type_id = TypeId::of::<K>();
        self.attachments
            .insert(AttachmentKey::new(key, type_id), Box::new(value));
    }

    /// Retrieves a reference to a typed value.
    ///
    /// # Returns
    /// `Some(&K)` only when a value exists for both the key and the type `K`.
    pub fn get<K>(&self, key: impl AsRef<str>) -> Option<&K>
    where
        K: Send + 'static,
    {
        let type_id = TypeId::of::<K>();
        self.attachments
            .get(&AttachmentKey::new(key, type_id))
            .and_then(|value| value.downcast_ref::<K>())
    }

    /// Retrieves a mutable reference to a typed value.
    pub fn get_mut<K>(&mut self, key: impl AsRef<str>) -> Option<&mut K>
    where
        K: Send + 'static,
    {
        let type_id = TypeId::of::<K>();
        self.attachments
            .get_mut(&AttachmentKey::new(key, type_id))
            .and_then(|value| value.downcast_mut::<K>())
    }

    /// Removes a typed value and returns it.
    pub fn remove<K>(&mut self, key: impl AsRef<str>) -> Option<K>
    where
        K: Send + 'static,
    {
        let type_id = TypeId::of::<K>();
        let value = self.attachments.remove(&AttachmentKey::new(key, type_id))?;
        value.downcast::<K>().ok().map(|boxed| *boxed)
    }

    pub fn len(&self) -> usize {
        self.attachments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attachments.is_empty()
    }
}

impl Default for Attachments {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for Attachments {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Attachments({})", self.attachments.len())
    }
}

#[derive(PartialOrd, PartialEq, Hash, Eq)]
pub struct AttachmentKey {
    key_hash: u64,
    type_hash: u64,
}

impl AttachmentKey {
    pub fn new(key: impl AsRef<str>, type_id: TypeId) -> Self {
        let key = key.as_ref();
        let mut key_hasher = FnvHasher::default();
        key.hash(&mut key_hasher);
        let key_hash = key_hasher.finish();

        let mut type_hasher = FnvHasher::default();
        type_id.hash(&mut type_hasher);
        let type_hash = type_hasher.finish();

        Self {
            key_hash,
            type_hash,
        }
    }
}
