use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::{ConsumeContext, ReceiveContext};
use crate::error::PipeError;
use crate::message::Message;

/// Error type returned by consumers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Handles messages of type `M`.
#[async_trait]
pub trait Consumer<M: Message>: Send + Sync {
    /// Name used in logs and faults.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn consume(&self, context: &ConsumeContext<M>) -> Result<(), BoxError>;
}

#[async_trait]
impl<M: Message, C: Consumer<M> + ?Sized> Consumer<M> for Arc<C> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn consume(&self, context: &ConsumeContext<M>) -> Result<(), BoxError> {
        (**self).consume(context).await
    }
}

/// Adapts an async closure into a [`Consumer`].
pub struct HandlerConsumer<M, F> {
    name: String,
    handler: F,
    _message: PhantomData<fn(M)>,
}

impl<M, F, Fut> HandlerConsumer<M, F>
where
    M: Message,
    F: Fn(ConsumeContext<M>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BoxError>> + Send,
{
    pub fn new(name: impl Into<String>, handler: F) -> Self {
        Self {
            name: name.into(),
            handler,
            _message: PhantomData,
        }
    }
}

#[async_trait]
impl<M, F, Fut> Consumer<M> for HandlerConsumer<M, F>
where
    M: Message,
    F: Fn(ConsumeContext<M>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BoxError>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn consume(&self, context: &ConsumeContext<M>) -> Result<(), BoxError> {
        (self.handler)(context.clone()).await
    }
}

/// A consumer with its message type erased, stored in the pipe's registry.
#[async_trait]
pub(crate) trait ErasedConsumer: Send + Sync {
    fn name(&self) -> &str;

    async fn consume(&self, context: &ReceiveContext) -> Result<(), PipeError>;
}

pub(crate) struct TypedConsumer<M, C> {
    consumer: C,
    _message: PhantomData<fn(M)>,
}

impl<M, C> TypedConsumer<M, C> {
    pub(crate) fn new(consumer: C) -> Self {
        Self {
            consumer,
            _message: PhantomData,
        }
    }
}

#[async_trait]
impl<M: Message, C: Consumer<M>> ErasedConsumer for TypedConsumer<M, C> {
    fn name(&self) -> &str {
        self.consumer.name()
    }

    async fn consume(&self, context: &ReceiveContext) -> Result<(), PipeError> {
        // the registry is keyed by TypeId, so a mismatch means a routing bug
        let typed = context
            .typed::<M>()
            .ok_or_else(|| PipeError::Consumer {
                consumer: self.consumer.name().to_string(),
                message_type: context.message_type(),
                source: format!("expected {}", M::message_type()).into(),
            })?;

        self.consumer
            .consume(&typed)
            .await
            .map_err(|source| PipeError::Consumer {
                consumer: self.consumer.name().to_string(),
                message_type: M::message_type(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Ping(u32);
    impl Message for Ping {}

    #[tokio::test]
    async fn handler_consumer_invokes_closure() {
        let consumer = HandlerConsumer::new("doubler", |ctx: ConsumeContext<Ping>| async move {
            if ctx.message().0 % 2 == 1 {
                return Err::<(), BoxError>("odd".into());
            }
            Ok(())
        });

        assert_eq!(consumer.name(), "doubler");
        assert!(consumer.consume(&ConsumeContext::new(Ping(2))).await.is_ok());
        assert!(consumer.consume(&ConsumeContext::new(Ping(3))).await.is_err());
    }

    #[tokio::test]
    async fn typed_consumer_wraps_failures() {
        let erased = TypedConsumer::<Ping, _>::new(HandlerConsumer::new(
            "failing",
            |_ctx: ConsumeContext<Ping>| async move { Err::<(), BoxError>("nope".into()) },
        ));
        let ctx = ConsumeContext::new(Ping(1)).into_receive_context();

        let err = erased.consume(&ctx).await.unwrap_err();
        assert!(matches!(err, PipeError::Consumer { ref consumer, .. } if consumer == "failing"));
    }
}
