//! Saga activities: the steps a transition runs.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use pipeline::{ConsumeContext, Message};
use saga_store::CorrelationId;

use crate::error::ActivityError;
use crate::instance::{SagaInstance, State};

/// What an activity's fault hook decided.
#[derive(Debug)]
pub enum FaultOutcome {
    /// Keep unwinding with this (possibly replaced) error.
    Propagate(ActivityError),

    /// Swallow the fault. The chain ends successfully and the instance is
    /// persisted as it stands; later activities do not run.
    Suppress,
}

/// The view an activity gets of one dispatch: the locked instance and the
/// inbound message.
pub struct BehaviorContext<'a, S, M> {
    instance: &'a mut S,
    consume: &'a ConsumeContext<M>,
    event: &'a str,
}

impl<'a, S: SagaInstance, M: Message> BehaviorContext<'a, S, M> {
    pub fn new(instance: &'a mut S, consume: &'a ConsumeContext<M>, event: &'a str) -> Self {
        Self {
            instance,
            consume,
            event,
        }
    }

    pub fn instance(&self) -> &S {
        self.instance
    }

    pub fn instance_mut(&mut self) -> &mut S {
        self.instance
    }

    pub fn message(&self) -> &M {
        self.consume.message()
    }

    pub fn consume_context(&self) -> &ConsumeContext<M> {
        self.consume
    }

    /// Name of the event being handled.
    pub fn event(&self) -> &str {
        self.event
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.instance.correlation_id()
    }

    /// Publishes a message caused by this event.
    pub async fn publish<P: Message>(&self, message: P) -> Result<(), ActivityError> {
        self.consume.publish(message).await?;
        Ok(())
    }

    /// Moves the instance to `state`.
    pub fn transition_to(&mut self, state: &State) {
        tracing::debug!(
            correlation_id = %self.instance.correlation_id(),
            from = self.instance.current_state(),
            to = %state,
            "state transition"
        );
        self.instance.set_current_state(state);
    }
}

/// A step of a saga transition.
///
/// Activities must tolerate being run more than once for the same message:
/// an optimistic repository re-runs the whole chain after a conflict.
#[async_trait]
pub trait Activity<S: SagaInstance, M: Message>: Send + Sync {
    /// Name used in logs and faults.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn execute(&self, context: &mut BehaviorContext<'_, S, M>) -> Result<(), ActivityError>;

    /// Called while a fault unwinds past this activity, including when this
    /// activity raised it.
    async fn faulted(
        &self,
        _context: &mut BehaviorContext<'_, S, M>,
        error: ActivityError,
    ) -> FaultOutcome {
        FaultOutcome::Propagate(error)
    }
}

type ActivityFactory<S, M> = Arc<dyn Fn(&ConsumeContext<M>) -> Arc<dyn Activity<S, M>> + Send + Sync>;

/// An entry of the state/event table, materialized into an activity for
/// each dispatch.
pub(crate) enum ActivityDescriptor<S, M> {
    Shared(Arc<dyn Activity<S, M>>),
    Factory(ActivityFactory<S, M>),
}

impl<S: SagaInstance, M: Message> ActivityDescriptor<S, M> {
    pub(crate) fn materialize(&self, context: &ConsumeContext<M>) -> Arc<dyn Activity<S, M>> {
        match self {
            ActivityDescriptor::Shared(activity) => Arc::clone(activity),
            ActivityDescriptor::Factory(factory) => factory(context),
        }
    }

    pub(crate) fn factory<F>(factory: F) -> Self
    where
        F: Fn(&ConsumeContext<M>) -> Arc<dyn Activity<S, M>> + Send + Sync + 'static,
    {
        ActivityDescriptor::Factory(Arc::new(factory))
    }
}

pub(crate) struct Then<F> {
    mutate: F,
}

impl<F> Then<F> {
    pub(crate) fn new(mutate: F) -> Self {
        Self { mutate }
    }
}

#[async_trait]
impl<S, M, F> Activity<S, M> for Then<F>
where
    S: SagaInstance,
    M: Message,
    F: Fn(&mut S, &M) + Send + Sync,
{
    fn name(&self) -> &str {
        "then"
    }

    async fn execute(&self, context: &mut BehaviorContext<'_, S, M>) -> Result<(), ActivityError> {
        let consume = context.consume;
        (self.mutate)(context.instance, consume.message());
        Ok(())
    }
}

pub(crate) struct Publish<F, P> {
    build: F,
    _message: PhantomData<fn() -> P>,
}

impl<F, P> Publish<F, P> {
    pub(crate) fn new(build: F) -> Self {
        Self {
            build,
            _message: PhantomData,
        }
    }
}

#[async_trait]
impl<S, M, P, F> Activity<S, M> for Publish<F, P>
where
    S: SagaInstance,
    M: Message,
    P: Message,
    F: Fn(&S, &M) -> P + Send + Sync,
{
    fn name(&self) -> &str {
        P::message_type()
    }

    async fn execute(&self, context: &mut BehaviorContext<'_, S, M>) -> Result<(), ActivityError> {
        let message = (self.build)(context.instance(), context.message());
        context.publish(message).await
    }
}

pub(crate) struct TransitionTo(pub(crate) State);

#[async_trait]
impl<S: SagaInstance, M: Message> Activity<S, M> for TransitionTo {
    fn name(&self) -> &str {
        "transition"
    }

    async fn execute(&self, context: &mut BehaviorContext<'_, S, M>) -> Result<(), ActivityError> {
        context.transition_to(&self.0);
        Ok(())
    }
}

pub(crate) struct Finalize;

#[async_trait]
impl<S: SagaInstance, M: Message> Activity<S, M> for Finalize {
    fn name(&self) -> &str {
        "finalize"
    }

    async fn execute(&self, context: &mut BehaviorContext<'_, S, M>) -> Result<(), ActivityError> {
        context.transition_to(&State::FINAL);
        Ok(())
    }
}
