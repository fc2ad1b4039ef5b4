use crate::exchange::Attachments;
use fnv::FnvBuildHasher;
use serde_json::Value;
use std::any::{Any, type_name};
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};

/// A type-erased message body.
///
/// The body remembers the name of the type it was created from so diagnostics
/// can report it without knowing the concrete type.
pub struct Body {
    value: Box<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl Body {
    pub fn new<T>(value: T) -> Self
    where
        T: Any + Send + Sync,
    {
        Self {
            value: Box::new(value),
            type_name: type_name::<T>(),
        }
    }

    pub fn is<T: Any>(&self) -> bool {
        self.value.is::<T>()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    pub fn downcast_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.value.downcast_mut::<T>()
    }

    /// Unwraps the body into `T`, handing the body back unchanged on a type mismatch.
    pub fn downcast<T: Any>(self) -> Result<T, Body> {
        let type_name = self.type_name;
        match self.value.downcast::<T>() {
            Ok(value) => Ok(*value),
            Err(value) => Err(Body { value, type_name }),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl Debug for Body {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Body({})", self.type_name)
    }
}

/// A message: headers, an optional typed body and attachments.
#[derive(Default)]
pub struct Message {
    headers: HashMap<String, Value, FnvBuildHasher>,
    body: Option<Body>,
    attachments: Attachments,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(&self, name: &str) -> Option<&Value> {
        self.headers.get(name)
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.headers.insert(name.into(), value.into());
    }

    pub fn remove_header(&mut self, name: &str) -> Option<Value> {
        self.headers.remove(name)
    }

    pub fn headers(&self) -> &HashMap<String, Value, FnvBuildHasher> {
        &self.headers
    }

    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }

    pub fn body(&self) -> Option<&Body> {
        self.body.as_ref()
    }

    pub fn body_as<T: Any>(&self) -> Option<&T> {
        self.body.as_ref().and_then(|body| body.downcast_ref::<T>())
    }

    pub fn body_as_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.body.as_mut().and_then(|body| body.downcast_mut::<T>())
    }

    pub fn set_body<T>(&mut self, body: T)
    where
        T: Any + Send + Sync,
    {
        self.body = Some(Body::new(body));
    }

    pub fn set_body_value(&mut self, body: Body) {
        self.body = Some(body);
    }

    pub fn take_body(&mut self) -> Option<Body> {
        self.body.take()
    }

    pub fn attachments(&self) -> &Attachments {
        &self.attachments
    }

    pub fn attachments_mut(&mut self) -> &mut Attachments {
        &mut self.attachments
    }

    /// A new message with the same headers and no body or attachments.
    pub fn copy_headers(&self) -> Message {
        Message {
            headers: self.headers.clone(),
            body: None,
            attachments: Attachments::new(),
        }
    }
}

impl Debug for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("headers", &self.headers)
            .field("body", &self.body)
            .field("attachments", &self.attachments)
            .finish()
    }
}
