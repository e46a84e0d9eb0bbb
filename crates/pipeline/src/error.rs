use thiserror::Error;

use crate::consumer::BoxError;

/// Errors surfaced by the consume pipe.
#[derive(Debug, Error)]
pub enum PipeError {
    /// A single consumer failed.
    #[error("Consumer '{consumer}' failed on {message_type}: {source}")]
    Consumer {
        consumer: String,
        message_type: &'static str,
        #[source]
        source: BoxError,
    },

    /// One or more consumers connected for a message type failed. The other
    /// consumers still ran.
    #[error("{count} consumer(s) faulted on {message_type}", count = .faults.len())]
    Aggregate {
        message_type: &'static str,
        faults: Vec<PipeError>,
    },

    /// A pipe filter refused to pass the message on.
    #[error("Filter '{filter}' rejected the message: {reason}")]
    Filter {
        filter: &'static str,
        reason: String,
    },

    /// A message could not be handed to the transport.
    #[error("Publishing {message_type} failed: {reason}")]
    Publish {
        message_type: &'static str,
        reason: String,
    },

    /// The dispatch was cancelled before it completed.
    #[error("Dispatch cancelled")]
    Cancelled,
}

impl PipeError {
    /// Returns every consumer-level fault, flattening aggregates.
    pub fn faults(&self) -> Vec<&PipeError> {
        match self {
            PipeError::Aggregate { faults, .. } => faults.iter().flat_map(|f| f.faults()).collect(),
            other => vec![other],
        }
    }

    /// Finds the first consumer fault whose source is an `E`.
    pub fn find_source<E: std::error::Error + 'static>(&self) -> Option<&E> {
        self.faults().into_iter().find_map(|fault| match fault {
            PipeError::Consumer { source, .. } => source.downcast_ref::<E>(),
            _ => None,
        })
    }

    /// Returns true if the dispatch, or any consumer, was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.faults()
            .into_iter()
            .any(|fault| matches!(fault, PipeError::Cancelled))
    }
}

/// Result type for pipe operations.
pub type Result<T> = std::result::Result<T, PipeError>;
