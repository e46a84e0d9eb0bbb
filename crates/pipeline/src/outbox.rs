use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use crate::context::ReceiveContext;
use crate::error::Result;
use crate::filter::{Filter, Next};
use crate::message::Published;
use crate::publisher::Publisher;

/// Holds back messages published during a dispatch until every consumer
/// has succeeded.
///
/// On success the buffered messages are handed to the original publisher in
/// publish order; on any fault they are discarded. The buffer spans the
/// whole dispatch, so a consumer that retries internally releases what
/// every one of its attempts published.
#[derive(Debug, Clone, Copy, Default)]
pub struct InMemoryOutbox;

impl InMemoryOutbox {
    pub fn new() -> Self {
        Self
    }
}

#[derive(Default)]
struct OutboxPublisher {
    pending: Mutex<Vec<Published>>,
}

impl OutboxPublisher {
    fn drain(&self) -> Vec<Published> {
        std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[async_trait]
impl Publisher for OutboxPublisher {
    async fn publish(&self, message: Published) -> Result<()> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message);
        Ok(())
    }
}

#[async_trait]
impl Filter for InMemoryOutbox {
    fn name(&self) -> &'static str {
        "in-memory-outbox"
    }

    async fn send(&self, context: ReceiveContext, next: Next<'_>) -> Result<()> {
        let transport = Arc::clone(context.publisher());
        let outbox = Arc::new(OutboxPublisher::default());

        let result = next
            .send(context.with_publisher(Arc::clone(&outbox) as Arc<dyn Publisher>))
            .await;
        let pending = outbox.drain();

        match result {
            Ok(()) => {
                tracing::debug!(released = pending.len(), "releasing outbox");
                for message in pending {
                    transport.publish(message).await?;
                }
                Ok(())
            }
            Err(error) => {
                if !pending.is_empty() {
                    tracing::debug!(discarded = pending.len(), "discarding outbox after fault");
                }
                Err(error)
            }
        }
    }
}
