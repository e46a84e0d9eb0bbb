use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use common::MessageId;

/// Delivery headers attached to a message.
pub type Headers = HashMap<String, String>;

/// Header naming the message whose consumer published this one.
pub const INITIATOR_ID_HEADER: &str = "initiator-id";

/// A typed, already-deserialized message that can travel through the pipe.
pub trait Message: std::fmt::Debug + Send + Sync + 'static {
    /// The message type name used in logs, metrics and errors.
    fn message_type() -> &'static str
    where
        Self: Sized,
    {
        std::any::type_name::<Self>()
    }
}

/// A message handed to a [`Publisher`](crate::Publisher), with its static type erased.
#[derive(Clone)]
pub struct Published {
    pub message_id: MessageId,
    pub message_type: &'static str,
    pub headers: Headers,
    type_id: TypeId,
    body: Arc<dyn Any + Send + Sync>,
}

impl Published {
    /// Wraps a message for publishing.
    pub fn new<M: Message>(message: M) -> Self {
        Self::from_arc(Arc::new(message))
    }

    pub(crate) fn from_arc<M: Message>(message: Arc<M>) -> Self {
        Self {
            message_id: MessageId::new(),
            message_type: M::message_type(),
            headers: Headers::new(),
            type_id: TypeId::of::<M>(),
            body: message,
        }
    }

    /// Records the message that caused this one to be published.
    pub fn initiated_by(mut self, initiator: MessageId) -> Self {
        self.headers
            .insert(INITIATOR_ID_HEADER.to_string(), initiator.to_string());
        self
    }

    /// Adds a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Returns the `TypeId` of the wrapped message.
    pub fn message_type_id(&self) -> TypeId {
        self.type_id
    }

    /// Returns the message if it is an `M`.
    pub fn downcast<M: Message>(&self) -> Option<Arc<M>> {
        Arc::clone(&self.body).downcast::<M>().ok()
    }

    pub(crate) fn body(&self) -> Arc<dyn Any + Send + Sync> {
        Arc::clone(&self.body)
    }
}

impl std::fmt::Debug for Published {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Published")
            .field("message_id", &self.message_id)
            .field("message_type", &self.message_type)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}
