//! Saga error types.

use std::time::Duration;

use pipeline::{BoxError, PipeError};
use saga_store::{CorrelationId, StoreError};
use thiserror::Error;

/// Errors that can occur while routing a message to a saga instance.
#[derive(Debug, Error)]
pub enum SagaError {
    /// The message could not be mapped to a correlation key.
    #[error("Correlation failed: {0}")]
    Correlation(#[from] CorrelationError),

    /// Another writer changed the instance between load and persist.
    #[error("Concurrency conflict: {reason}")]
    ConcurrencyConflict {
        correlation_id: Option<CorrelationId>,
        reason: String,
    },

    /// Optimistic retries were exhausted.
    #[error("Gave up on {message_type} after {attempts} conflicting attempts")]
    ConcurrencyExceeded {
        message_type: &'static str,
        attempts: u32,
    },

    /// The row lock of a pessimistic repository was not granted in time.
    #[error("Timed out after {waited:?} waiting for the lock on saga {correlation_id}")]
    LockTimeout {
        correlation_id: CorrelationId,
        waited: Duration,
    },

    /// An activity fault escaped every fault hook. Nothing was persisted.
    #[error("Saga {saga} faulted in state {state} on {event} (activity '{activity}'): {source}")]
    Execution {
        saga: String,
        state: String,
        event: String,
        activity: String,
        #[source]
        source: ActivityError,
    },

    /// A non-initiating event arrived for an instance that does not exist.
    #[error("No {saga} instance {correlation_id} for event {event}")]
    MissingInstance {
        saga: String,
        event: String,
        correlation_id: CorrelationId,
    },

    /// An event arrived in a state that has no transition for it, and the
    /// event is configured to fault in that case.
    #[error("Event {event} is not accepted in state {state}")]
    UnhandledEvent { state: String, event: String },

    /// A state name is not declared by the state machine.
    #[error("State '{0}' is not declared")]
    UnknownState(String),

    /// An event type was used before it was declared.
    #[error("Event {0} is not declared")]
    UndeclaredEvent(&'static str),

    /// Two transitions were declared for the same state and event.
    #[error("Duplicate transition for event {event} in state {state}")]
    DuplicateTransition { state: String, event: String },

    /// The dispatch was cancelled.
    #[error("Saga dispatch cancelled")]
    Cancelled,

    /// Storage error.
    #[error("Store error: {0}")]
    Store(StoreError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SagaError {
    /// Returns true for conflicts that a fresh attempt against reloaded state may resolve.
    pub fn is_transient(&self) -> bool {
        matches!(self, SagaError::ConcurrencyConflict { .. })
    }

    /// Returns true if redelivering the message later may succeed.
    pub fn is_redelivery_candidate(&self) -> bool {
        matches!(
            self,
            SagaError::ConcurrencyExceeded { .. }
                | SagaError::LockTimeout { .. }
                | SagaError::ConcurrencyConflict { .. }
        )
    }
}

impl From<StoreError> for SagaError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::ConcurrencyConflict { correlation_id, .. } => {
                SagaError::ConcurrencyConflict {
                    reason: error.to_string(),
                    correlation_id: Some(correlation_id),
                }
            }
            StoreError::DuplicateKey(correlation_id) => SagaError::ConcurrencyConflict {
                reason: error.to_string(),
                correlation_id: Some(correlation_id),
            },
            StoreError::TransactionConflict(reason) => SagaError::ConcurrencyConflict {
                correlation_id: None,
                reason,
            },
            StoreError::LockTimeout {
                correlation_id,
                waited,
            } => SagaError::LockTimeout {
                correlation_id,
                waited,
            },
            other => SagaError::Store(other),
        }
    }
}

/// Errors raised while computing a message's correlation key.
#[derive(Debug, Error)]
pub enum CorrelationError {
    /// The message does not carry the data needed to build a key.
    #[error("{message_type} carries no correlation key")]
    MissingKey { message_type: &'static str },

    /// A correlation query matched more than one instance.
    #[error("Correlation query for {message_type} matched {count} instances")]
    Ambiguous {
        message_type: &'static str,
        count: usize,
    },

    /// The state machine declares no event for the message type.
    #[error("No event declared for {message_type}")]
    UnknownEvent { message_type: &'static str },
}

/// A fault raised by a saga activity.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ActivityError {
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl ActivityError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Wraps an underlying error.
    pub fn with_source(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the wrapped error if it is an `E`.
    pub fn downcast_source<E: std::error::Error + 'static>(&self) -> Option<&E> {
        self.source.as_ref()?.downcast_ref::<E>()
    }
}

impl From<PipeError> for ActivityError {
    fn from(error: PipeError) -> Self {
        Self::with_source("publish failed", error)
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
