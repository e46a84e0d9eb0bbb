//! Saga state machines: declared states, events and the transition table.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use pipeline::{ConsumeContext, Message};

use crate::activity::{Activity, ActivityDescriptor, Finalize, Publish, Then, TransitionTo};
use crate::behavior::BehaviorChain;
use crate::correlation::{Correlation, CorrelationKey};
use crate::error::{CorrelationError, Result, SagaError};
use crate::instance::{SagaInstance, State};

/// What to do when a non-initiating event finds no instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingInstance {
    /// Fail the message with `SagaError::MissingInstance`.
    #[default]
    Fault,
    /// Drop the message silently.
    Discard,
}

/// What to do when an event arrives in a state with no transition for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnhandledEvent {
    /// Leave the instance unchanged and succeed.
    #[default]
    Ignore,
    /// Fail the message with `SagaError::UnhandledEvent`.
    Fault,
}

pub(crate) struct EventBinding<S, M> {
    pub(crate) name: String,
    correlation: Correlation<M>,
    pub(crate) missing_instance: MissingInstance,
    pub(crate) unhandled: UnhandledEvent,
    transitions: HashMap<String, Vec<ActivityDescriptor<S, M>>>,
}

impl<S: SagaInstance, M: Message> EventBinding<S, M> {
    pub(crate) fn is_initiating(&self) -> bool {
        self.transitions.contains_key(State::INITIAL.as_str())
    }

    /// Builds the chain for `state`, resolving factory activities against
    /// this dispatch. `None` means the event has no transition in `state`.
    pub(crate) fn chain(
        &self,
        state: &str,
        context: &ConsumeContext<M>,
    ) -> Option<BehaviorChain<S, M>> {
        let descriptors = self.transitions.get(state)?;
        Some(BehaviorChain::build(
            descriptors.iter().map(|d| d.materialize(context)),
        ))
    }
}

/// A saga state machine.
///
/// The state/event table is fixed when [`StateMachineBuilder::build`]
/// returns and is shared read-only by every dispatch.
pub struct StateMachine<S> {
    name: String,
    states: Vec<State>,
    events: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
    completed_when_finalized: bool,
    _instance: PhantomData<fn() -> S>,
}

impl<S: SagaInstance> StateMachine<S> {
    /// Starts building a state machine.
    pub fn builder(name: impl Into<String>) -> StateMachineBuilder<S> {
        StateMachineBuilder {
            name: name.into(),
            states: vec![State::INITIAL, State::FINAL],
            events: HashMap::new(),
            transitions: Vec::new(),
            targets: Vec::new(),
            completed_when_finalized: false,
            errors: Vec::new(),
            _instance: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns every declared state, including `Initial` and `Final`.
    pub fn states(&self) -> &[State] {
        &self.states
    }

    pub fn is_declared(&self, state: &str) -> bool {
        self.states.iter().any(|s| s.as_str() == state)
    }

    /// Returns true if reaching `Final` removes the instance from storage.
    pub fn completed_when_finalized(&self) -> bool {
        self.completed_when_finalized
    }

    /// Returns true if the machine declares an event for `M`.
    pub fn accepts<M: Message>(&self) -> bool {
        self.events.contains_key(&TypeId::of::<M>())
    }

    /// Returns true if `M` can create a new instance.
    pub fn is_initiating<M: Message>(&self) -> bool {
        self.binding::<M>().is_ok_and(EventBinding::is_initiating)
    }

    pub fn event_name<M: Message>(&self) -> Option<&str> {
        self.binding::<M>().ok().map(|b| b.name.as_str())
    }

    /// Computes the correlation key of an event message.
    pub fn correlate<M: Message>(
        &self,
        message: &M,
    ) -> std::result::Result<CorrelationKey, CorrelationError> {
        self.binding::<M>()?.correlation.resolve(message)
    }

    pub(crate) fn binding<M: Message>(
        &self,
    ) -> std::result::Result<&EventBinding<S, M>, CorrelationError> {
        self.events
            .get(&TypeId::of::<M>())
            .and_then(|binding| binding.downcast_ref::<EventBinding<S, M>>())
            .ok_or(CorrelationError::UnknownEvent {
                message_type: M::message_type(),
            })
    }
}

impl<S> std::fmt::Debug for StateMachine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachine")
            .field("name", &self.name)
            .field("states", &self.states)
            .field("events", &self.events.len())
            .field("completed_when_finalized", &self.completed_when_finalized)
            .finish()
    }
}

/// Fluent builder for [`StateMachine`].
///
/// Declaration mistakes are collected and reported by [`build`](Self::build),
/// so the chain of calls never has to be interrupted.
pub struct StateMachineBuilder<S> {
    name: String,
    states: Vec<State>,
    events: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
    transitions: Vec<(String, String)>,
    targets: Vec<State>,
    completed_when_finalized: bool,
    errors: Vec<SagaError>,
    _instance: PhantomData<fn() -> S>,
}

impl<S: SagaInstance> StateMachineBuilder<S> {
    /// Declares a state.
    pub fn state(mut self, state: impl Into<State>) -> Self {
        let state = state.into();
        if !self.states.contains(&state) {
            self.states.push(state);
        }
        self
    }

    /// Declares the event carried by messages of type `M`.
    pub fn event<M: Message>(mut self, name: impl Into<String>, correlation: Correlation<M>) -> Self {
        let binding = EventBinding::<S, M> {
            name: name.into(),
            correlation,
            missing_instance: MissingInstance::default(),
            unhandled: UnhandledEvent::default(),
            transitions: HashMap::new(),
        };
        self.events.insert(TypeId::of::<M>(), Box::new(binding));
        self
    }

    /// Sets what happens when `M` finds no instance and cannot create one.
    pub fn on_missing_instance<M: Message>(mut self, policy: MissingInstance) -> Self {
        if let Some(binding) = self.binding_mut::<M>() {
            binding.missing_instance = policy;
        }
        self
    }

    /// Sets what happens when `M` arrives in a state without a transition for it.
    pub fn on_unhandled<M: Message>(mut self, policy: UnhandledEvent) -> Self {
        if let Some(binding) = self.binding_mut::<M>() {
            binding.unhandled = policy;
        }
        self
    }

    /// Adds a transition from `Initial`, which makes `M` an initiating event.
    pub fn initially<M: Message>(self, when: When<S, M>) -> Self {
        self.during(State::INITIAL, when)
    }

    /// Adds the transition taken when `M` arrives in `state`.
    pub fn during<M: Message>(mut self, state: impl Into<State>, when: When<S, M>) -> Self {
        let state = state.into();
        let When {
            activities,
            targets,
        } = when;

        let Some(binding) = self.binding_mut::<M>() else {
            return self;
        };
        let event = binding.name.clone();
        if binding.transitions.contains_key(state.as_str()) {
            self.errors.push(SagaError::DuplicateTransition {
                state: state.to_string(),
                event,
            });
            return self;
        }
        binding
            .transitions
            .insert(state.to_string(), activities);

        self.transitions.push((state.to_string(), event));
        self.targets.extend(targets);
        self
    }

    /// Deletes instances from storage once they reach `Final`.
    pub fn set_completed_when_finalized(mut self) -> Self {
        self.completed_when_finalized = true;
        self
    }

    /// Validates the declarations and freezes the table.
    pub fn build(mut self) -> Result<StateMachine<S>> {
        if !self.errors.is_empty() {
            return Err(self.errors.remove(0));
        }

        let declared = |name: &str| self.states.iter().any(|s| s.as_str() == name);
        if let Some((state, _)) = self.transitions.iter().find(|(state, _)| !declared(state)) {
            return Err(SagaError::UnknownState(state.clone()));
        }
        if let Some(target) = self.targets.iter().find(|t| !declared(t.as_str())) {
            return Err(SagaError::UnknownState(target.to_string()));
        }

        tracing::debug!(
            saga = %self.name,
            states = self.states.len(),
            events = self.events.len(),
            transitions = self.transitions.len(),
            "state machine built"
        );

        Ok(StateMachine {
            name: self.name,
            states: self.states,
            events: self.events,
            completed_when_finalized: self.completed_when_finalized,
            _instance: PhantomData,
        })
    }

    fn binding_mut<M: Message>(&mut self) -> Option<&mut EventBinding<S, M>> {
        let binding = self
            .events
            .get_mut(&TypeId::of::<M>())
            .and_then(|binding| binding.downcast_mut::<EventBinding<S, M>>());
        if binding.is_none() {
            self.errors
                .push(SagaError::UndeclaredEvent(M::message_type()));
        }
        binding
    }
}

/// The activities of one transition, in execution order.
pub struct When<S, M> {
    activities: Vec<ActivityDescriptor<S, M>>,
    targets: Vec<State>,
}

impl<S: SagaInstance, M: Message> Default for When<S, M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: SagaInstance, M: Message> When<S, M> {
    pub fn new() -> Self {
        Self {
            activities: Vec::new(),
            targets: Vec::new(),
        }
    }

    /// Mutates the instance from the message.
    pub fn then<F>(self, mutate: F) -> Self
    where
        F: Fn(&mut S, &M) + Send + Sync + 'static,
    {
        self.shared(Then::new(mutate))
    }

    /// Publishes a message built from the instance and the event.
    pub fn publish<P, F>(self, build: F) -> Self
    where
        P: Message,
        F: Fn(&S, &M) -> P + Send + Sync + 'static,
    {
        self.shared(Publish::new(build))
    }

    /// Runs a shared activity.
    pub fn activity(mut self, activity: Arc<dyn Activity<S, M>>) -> Self {
        self.activities.push(ActivityDescriptor::Shared(activity));
        self
    }

    /// Runs an activity resolved for each dispatch from its consume context.
    pub fn activity_from<F>(mut self, factory: F) -> Self
    where
        F: Fn(&ConsumeContext<M>) -> Arc<dyn Activity<S, M>> + Send + Sync + 'static,
    {
        self.activities.push(ActivityDescriptor::factory(factory));
        self
    }

    /// Moves the instance to `state`.
    pub fn transition_to(mut self, state: impl Into<State>) -> Self {
        let state = state.into();
        self.targets.push(state.clone());
        self.shared(TransitionTo(state))
    }

    /// Moves the instance to `Final`.
    pub fn finalize(self) -> Self {
        self.shared(Finalize)
    }

    fn shared(mut self, activity: impl Activity<S, M> + 'static) -> Self {
        self.activities
            .push(ActivityDescriptor::Shared(Arc::new(activity)));
        self
    }
}
