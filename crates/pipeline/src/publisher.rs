use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::context::ReceiveContext;
use crate::error::Result;
use crate::message::{Message, Published};
use crate::pipe::PipeInner;

/// Hands messages published by consumers to a transport.
///
/// Publishing is fire-and-forget from the consumer's point of view: a
/// successful return means the transport accepted the message, not that
/// anybody consumed it.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, message: Published) -> Result<()>;
}

/// Drops every message. Used by contexts that were given no transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardPublisher;

#[async_trait]
impl Publisher for DiscardPublisher {
    async fn publish(&self, message: Published) -> Result<()> {
        tracing::trace!(message_type = message.message_type, "discarding published message");
        Ok(())
    }
}

/// Captures published messages for later inspection.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    messages: Mutex<Vec<Published>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every message published so far, in publish order.
    pub fn messages(&self) -> Vec<Published> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the published messages of type `M`.
    pub fn published<M: Message>(&self) -> Vec<Arc<M>> {
        self.messages()
            .iter()
            .filter_map(|published| published.downcast::<M>())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Removes and returns everything recorded so far.
    pub fn take(&self) -> Vec<Published> {
        std::mem::take(&mut *self.messages.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, message: Published) -> Result<()> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message);
        Ok(())
    }
}

/// Feeds published messages back into a consume pipe on a background task.
///
/// This is the in-process stand-in for a broker: the publishing consumer
/// does not wait for the re-entered dispatch, and faults raised by it are
/// logged rather than returned.
pub struct LoopbackPublisher {
    pipe: Weak<PipeInner>,
    cancellation: CancellationToken,
}

impl LoopbackPublisher {
    pub(crate) fn new(pipe: Weak<PipeInner>, cancellation: CancellationToken) -> Self {
        Self { pipe, cancellation }
    }
}

#[async_trait]
impl Publisher for LoopbackPublisher {
    async fn publish(&self, message: Published) -> Result<()> {
        let Some(pipe) = self.pipe.upgrade() else {
            tracing::warn!(
                message_type = message.message_type,
                "consume pipe dropped, discarding published message"
            );
            return Ok(());
        };

        let publisher: Arc<dyn Publisher> = Arc::new(LoopbackPublisher::new(
            Arc::downgrade(&pipe),
            self.cancellation.clone(),
        ));
        let context = ReceiveContext::from_published(message, publisher, self.cancellation.clone());

        tokio::spawn(async move {
            let message_type = context.message_type();
            if let Err(error) = pipe.dispatch(context).await {
                tracing::error!(message_type, %error, "re-entered dispatch failed");
            }
        });
        Ok(())
    }
}
