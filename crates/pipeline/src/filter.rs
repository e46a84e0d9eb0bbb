use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::context::ReceiveContext;
use crate::error::{PipeError, Result};
use crate::pipe::Dispatcher;

/// A pipe-wide step that wraps the dispatch of every message.
///
/// A filter may act before and after calling [`Next::send`], replace the
/// context it passes on, or refuse to call it at all.
#[async_trait]
pub trait Filter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, context: ReceiveContext, next: Next<'_>) -> Result<()>;
}

/// The remainder of the filter chain, ending in consumer fan-out.
pub struct Next<'a> {
    filters: &'a [Arc<dyn Filter>],
    dispatcher: &'a Dispatcher,
}

impl<'a> Next<'a> {
    pub(crate) fn new(filters: &'a [Arc<dyn Filter>], dispatcher: &'a Dispatcher) -> Self {
        Self {
            filters,
            dispatcher,
        }
    }

    /// Passes the context to the next filter, or to the consumers if this was the last one.
    pub async fn send(self, context: ReceiveContext) -> Result<()> {
        match self.filters.split_first() {
            Some((filter, rest)) => {
                filter
                    .send(context, Next::new(rest, self.dispatcher))
                    .await
            }
            None => self.dispatcher.dispatch(context).await,
        }
    }
}

/// Limits how many messages are dispatched at the same time.
///
/// Waiting for a slot observes the delivery's cancellation signal.
pub struct ConcurrencyLimitFilter {
    permits: Arc<Semaphore>,
}

impl ConcurrencyLimitFilter {
    pub fn new(limit: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(limit)),
        }
    }

    /// Returns the number of free dispatch slots.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

#[async_trait]
impl Filter for ConcurrencyLimitFilter {
    fn name(&self) -> &'static str {
        "concurrency-limit"
    }

    async fn send(&self, context: ReceiveContext, next: Next<'_>) -> Result<()> {
        let cancellation = context.cancellation().clone();
        let _permit = tokio::select! {
            permit = Arc::clone(&self.permits).acquire_owned() => {
                permit.map_err(|_| PipeError::Filter {
                    filter: self.name(),
                    reason: "semaphore closed".to_string(),
                })?
            }
            () = cancellation.cancelled() => return Err(PipeError::Cancelled),
        };

        next.send(context).await
    }
}
