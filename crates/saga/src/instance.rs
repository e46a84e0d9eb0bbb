//! Saga instances and state names.

use std::borrow::Cow;

use saga_store::CorrelationId;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// A named state of a saga state machine.
///
/// Every machine implicitly declares [`State::INITIAL`], the state a newly
/// created instance starts in, and [`State::FINAL`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct State(Cow<'static, str>);

impl State {
    /// State of an instance that has just been created.
    pub const INITIAL: State = State::named("Initial");

    /// Terminal state reached by `finalize`.
    pub const FINAL: State = State::named("Final");

    /// Creates a state with a static name, usable in constants.
    pub const fn named(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    /// Creates a state from a runtime name.
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true for the implicit initial state.
    pub fn is_initial(&self) -> bool {
        self.as_str() == State::INITIAL.as_str()
    }

    /// Returns true for the implicit final state.
    pub fn is_final(&self) -> bool {
        self.as_str() == State::FINAL.as_str()
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&'static str> for State {
    fn from(name: &'static str) -> Self {
        Self::named(name)
    }
}

/// The persisted data of one saga.
///
/// The whole instance is serialized into the store, including its current
/// state name. Implementations keep the state in a plain `String` field.
pub trait SagaInstance: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Creates a fresh instance for a correlation id. The repository moves it
    /// into [`State::INITIAL`] before running the first transition.
    fn with_correlation_id(correlation_id: CorrelationId) -> Self;

    fn correlation_id(&self) -> CorrelationId;

    fn current_state(&self) -> &str;

    fn set_current_state(&mut self, state: &State);

    /// Returns true if the instance is in `state`.
    fn is_in(&self, state: &State) -> bool {
        self.current_state() == state.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Probe {
        correlation_id: CorrelationId,
        current_state: String,
    }

    impl SagaInstance for Probe {
        fn with_correlation_id(correlation_id: CorrelationId) -> Self {
            Self {
                correlation_id,
                current_state: String::new(),
            }
        }

        fn correlation_id(&self) -> CorrelationId {
            self.correlation_id
        }

        fn current_state(&self) -> &str {
            &self.current_state
        }

        fn set_current_state(&mut self, state: &State) {
            self.current_state = state.to_string();
        }
    }

    #[test]
    fn well_known_states() {
        assert!(State::INITIAL.is_initial());
        assert!(State::FINAL.is_final());
        assert!(!State::named("Active").is_final());
        assert_eq!(State::new(String::from("Active")), State::named("Active"));
    }

    #[test]
    fn instance_tracks_state_by_name() {
        let mut probe = Probe::with_correlation_id(CorrelationId::new());
        probe.set_current_state(&State::named("Active"));

        assert!(probe.is_in(&State::named("Active")));
        assert!(!probe.is_in(&State::FINAL));
    }
}
