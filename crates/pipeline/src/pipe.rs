use std::any::TypeId;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use tokio_util::sync::CancellationToken;

use crate::consumer::{BoxError, Consumer, ErasedConsumer, HandlerConsumer, TypedConsumer};
use crate::context::{ConsumeContext, ReceiveContext};
use crate::error::{PipeError, Result};
use crate::filter::{Filter, Next};
use crate::message::Message;
use crate::publisher::{LoopbackPublisher, Publisher};

struct Registration {
    id: u64,
    consumer: Arc<dyn ErasedConsumer>,
}

#[derive(Default)]
pub(crate) struct PipeInner {
    consumers: RwLock<HashMap<TypeId, Vec<Registration>>>,
    filters: RwLock<Vec<Arc<dyn Filter>>>,
    next_id: AtomicU64,
}

/// Routes typed messages to every consumer connected for their type.
///
/// The pipe supports:
/// - Fan-out: each message goes to all consumers for its type, in registration order
/// - Fault isolation: a failing consumer does not stop the others; faults are aggregated
/// - Filters: pipe-wide steps wrapped around every dispatch
#[derive(Clone, Default)]
pub struct ConsumePipe {
    inner: Arc<PipeInner>,
}

impl ConsumePipe {
    /// Creates a pipe with no consumers or filters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a filter. Filters run in the order they were added.
    pub fn use_filter(&self, filter: impl Filter + 'static) {
        self.inner
            .filters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(filter));
    }

    /// Connects a consumer for messages of type `M`.
    pub fn connect<M, C>(&self, consumer: C) -> ConnectHandle
    where
        M: Message,
        C: Consumer<M> + 'static,
    {
        let consumer: Arc<dyn ErasedConsumer> = Arc::new(TypedConsumer::<M, C>::new(consumer));
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let type_id = TypeId::of::<M>();

        tracing::debug!(
            message_type = M::message_type(),
            consumer = consumer.name(),
            "consumer connected"
        );
        self.inner
            .consumers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(type_id)
            .or_default()
            .push(Registration { id, consumer });

        ConnectHandle {
            pipe: Arc::downgrade(&self.inner),
            type_id,
            id,
        }
    }

    /// Connects a shared consumer instance.
    pub fn connect_instance<M, C>(&self, consumer: Arc<C>) -> ConnectHandle
    where
        M: Message,
        C: Consumer<M> + ?Sized + 'static,
    {
        self.connect::<M, Arc<C>>(consumer)
    }

    /// Connects an async closure as a consumer.
    pub fn connect_handler<M, F, Fut>(&self, name: impl Into<String>, handler: F) -> ConnectHandle
    where
        M: Message,
        F: Fn(ConsumeContext<M>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        self.connect::<M, _>(HandlerConsumer::new(name, handler))
    }

    /// Returns the number of consumers connected for `M`.
    pub fn consumer_count<M: Message>(&self) -> usize {
        self.inner
            .consumers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&TypeId::of::<M>())
            .map_or(0, Vec::len)
    }

    /// Dispatches a message to every consumer connected for its type.
    pub async fn send<M: Message>(&self, context: ConsumeContext<M>) -> Result<()> {
        self.inner.dispatch(context.into_receive_context()).await
    }

    /// Dispatches a type-erased delivery.
    pub async fn send_receive_context(&self, context: ReceiveContext) -> Result<()> {
        self.inner.dispatch(context).await
    }

    /// Returns a publisher that feeds published messages back into this pipe.
    pub fn loopback(&self, cancellation: CancellationToken) -> Arc<dyn Publisher> {
        Arc::new(LoopbackPublisher::new(
            Arc::downgrade(&self.inner),
            cancellation,
        ))
    }
}

impl PipeInner {
    #[tracing::instrument(
        skip(self, context),
        fields(message_type = context.message_type(), message_id = %context.message_id())
    )]
    pub(crate) async fn dispatch(&self, context: ReceiveContext) -> Result<()> {
        if context.cancellation().is_cancelled() {
            return Err(PipeError::Cancelled);
        }

        // snapshot so connect/disconnect never wait on an in-flight dispatch
        let filters: Vec<Arc<dyn Filter>> = self
            .filters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let dispatcher = Dispatcher {
            consumers: self
                .consumers
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&context.message_type_id())
                .map(|registrations| {
                    registrations
                        .iter()
                        .map(|r| Arc::clone(&r.consumer))
                        .collect()
                })
                .unwrap_or_default(),
        };

        Next::new(&filters, &dispatcher).send(context).await
    }

    fn disconnect(&self, type_id: TypeId, id: u64) -> bool {
        let mut consumers = self
            .consumers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(registrations) = consumers.get_mut(&type_id) else {
            return false;
        };
        let before = registrations.len();
        registrations.retain(|r| r.id != id);
        before != registrations.len()
    }
}

/// Terminal step of the filter chain: sequential fan-out to the consumers.
pub(crate) struct Dispatcher {
    consumers: Vec<Arc<dyn ErasedConsumer>>,
}

impl Dispatcher {
    pub(crate) async fn dispatch(&self, context: ReceiveContext) -> Result<()> {
        let message_type = context.message_type();

        if self.consumers.is_empty() {
            tracing::debug!(message_type, "no consumers connected");
            return Ok(());
        }

        let mut faults = Vec::new();
        for consumer in &self.consumers {
            if context.cancellation().is_cancelled() {
                faults.push(PipeError::Cancelled);
                break;
            }

            match consumer.consume(&context).await {
                Ok(()) => {
                    tracing::trace!(consumer = consumer.name(), "consumer completed");
                }
                Err(error) => {
                    metrics::counter!("pipe_consumer_faults_total").increment(1);
                    tracing::warn!(consumer = consumer.name(), %error, "consumer faulted");
                    faults.push(error);
                }
            }
        }

        metrics::counter!("pipe_messages_dispatched_total").increment(1);

        if faults.is_empty() {
            Ok(())
        } else {
            Err(PipeError::Aggregate {
                message_type,
                faults,
            })
        }
    }
}

/// Returned by the `connect` methods; disconnects the consumer on request.
#[derive(Debug)]
pub struct ConnectHandle {
    pipe: Weak<PipeInner>,
    type_id: TypeId,
    id: u64,
}

impl ConnectHandle {
    /// Disconnects the consumer. Returns false if it was already gone.
    pub fn disconnect(self) -> bool {
        self.pipe
            .upgrade()
            .is_some_and(|pipe| pipe.disconnect(self.type_id, self.id))
    }
}
