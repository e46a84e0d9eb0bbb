use std::any::{Any, TypeId};
use std::sync::Arc;

use common::MessageId;
use tokio_util::sync::CancellationToken;

use crate::error::{PipeError, Result};
use crate::message::{Headers, Message, Published};
use crate::publisher::{DiscardPublisher, Publisher};

/// One inbound message plus its delivery metadata, as seen by a consumer.
///
/// Contexts are cheap to clone; every consumer receives its own view of
/// the same delivery.
pub struct ConsumeContext<M> {
    message: Arc<M>,
    message_id: MessageId,
    headers: Arc<Headers>,
    cancellation: CancellationToken,
    publisher: Arc<dyn Publisher>,
}

impl<M> Clone for ConsumeContext<M> {
    fn clone(&self) -> Self {
        Self {
            message: Arc::clone(&self.message),
            message_id: self.message_id,
            headers: Arc::clone(&self.headers),
            cancellation: self.cancellation.clone(),
            publisher: Arc::clone(&self.publisher),
        }
    }
}

impl<M: Message> ConsumeContext<M> {
    /// Creates a context for a freshly received message.
    ///
    /// Messages published from this context are discarded until a publisher
    /// is attached with [`with_publisher`](Self::with_publisher).
    pub fn new(message: M) -> Self {
        Self {
            message: Arc::new(message),
            message_id: MessageId::new(),
            headers: Arc::new(Headers::new()),
            cancellation: CancellationToken::new(),
            publisher: Arc::new(DiscardPublisher),
        }
    }

    /// Sets the publisher used by [`publish`](Self::publish).
    pub fn with_publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = publisher;
        self
    }

    /// Sets the cancellation signal observed during dispatch.
    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// Replaces the delivery headers.
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = Arc::new(headers);
        self
    }

    /// Sets the delivery's message id.
    pub fn with_message_id(mut self, message_id: MessageId) -> Self {
        self.message_id = message_id;
        self
    }

    /// Returns the message.
    pub fn message(&self) -> &M {
        &self.message
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns a header value.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Publishes a further message caused by this one.
    pub async fn publish<P: Message>(&self, message: P) -> Result<()> {
        if self.is_cancelled() {
            return Err(PipeError::Cancelled);
        }
        let published = Published::new(message).initiated_by(self.message_id);
        tracing::debug!(
            message_type = published.message_type,
            initiator = %self.message_id,
            "publishing message"
        );
        self.publisher.publish(published).await
    }

    /// Converts into the type-erased form carried through pipe filters.
    pub fn into_receive_context(self) -> ReceiveContext {
        ReceiveContext {
            message_id: self.message_id,
            message_type: M::message_type(),
            type_id: TypeId::of::<M>(),
            body: self.message,
            headers: self.headers,
            cancellation: self.cancellation,
            publisher: self.publisher,
        }
    }
}

/// A delivery with the message type erased, as seen by pipe filters.
#[derive(Clone)]
pub struct ReceiveContext {
    message_id: MessageId,
    message_type: &'static str,
    type_id: TypeId,
    body: Arc<dyn Any + Send + Sync>,
    headers: Arc<Headers>,
    cancellation: CancellationToken,
    publisher: Arc<dyn Publisher>,
}

impl ReceiveContext {
    /// Builds a receive context for a message published by another consumer.
    pub fn from_published(
        published: Published,
        publisher: Arc<dyn Publisher>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            message_id: published.message_id,
            message_type: published.message_type,
            type_id: published.message_type_id(),
            body: published.body(),
            headers: Arc::new(published.headers),
            cancellation,
            publisher,
        }
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn message_type(&self) -> &'static str {
        self.message_type
    }

    pub fn message_type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn publisher(&self) -> &Arc<dyn Publisher> {
        &self.publisher
    }

    /// Returns a copy of this context that publishes through `publisher`.
    pub fn with_publisher(&self, publisher: Arc<dyn Publisher>) -> Self {
        Self {
            publisher,
            ..self.clone()
        }
    }

    /// Recovers the typed context. Returns `None` if the message is not an `M`.
    pub fn typed<M: Message>(&self) -> Option<ConsumeContext<M>> {
        let message = Arc::clone(&self.body).downcast::<M>().ok()?;
        Some(ConsumeContext {
            message,
            message_id: self.message_id,
            headers: Arc::clone(&self.headers),
            cancellation: self.cancellation.clone(),
            publisher: Arc::clone(&self.publisher),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::INITIATOR_ID_HEADER;
    use crate::publisher::RecordingPublisher;

    #[derive(Debug)]
    struct Ping;
    impl Message for Ping {}

    #[derive(Debug)]
    struct Pong(u8);
    impl Message for Pong {}

    #[tokio::test]
    async fn publish_records_initiator() {
        let recorder = Arc::new(RecordingPublisher::new());
        let ctx = ConsumeContext::new(Ping).with_publisher(recorder.clone());

        ctx.publish(Pong(1)).await.unwrap();

        let published = recorder.messages();
        assert_eq!(published.len(), 1);
        assert_eq!(
            published[0].headers.get(INITIATOR_ID_HEADER),
            Some(&ctx.message_id().to_string())
        );
    }

    #[tokio::test]
    async fn publish_after_cancellation_fails() {
        let ctx = ConsumeContext::new(Ping);
        ctx.cancellation().cancel();
        assert!(matches!(ctx.publish(Pong(1)).await, Err(PipeError::Cancelled)));
    }

    #[test]
    fn receive_context_roundtrips_typed_view() {
        let mut headers = Headers::new();
        headers.insert("tenant".into(), "acme".into());
        let ctx = ConsumeContext::new(Pong(9)).with_headers(headers);
        let id = ctx.message_id();

        let erased = ctx.into_receive_context();
        assert!(erased.typed::<Ping>().is_none());

        let typed = erased.typed::<Pong>().unwrap();
        assert_eq!(typed.message().0, 9);
        assert_eq!(typed.message_id(), id);
        assert_eq!(typed.header("tenant"), Some("acme"));
    }
}
