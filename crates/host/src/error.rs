use std::time::Duration;

use pipeline::PipeError;
use saga::SagaError;
use saga_store::StoreError;
use thiserror::Error;

/// Errors that can stop the host.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("Database connection failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Saga error: {0}")]
    Saga(#[from] SagaError),

    #[error("Dispatch failed: {0}")]
    Pipe(#[from] PipeError),

    #[error("Telemetry setup failed: {0}")]
    Telemetry(String),

    #[error("Timed out after {waited:?} with {confirmed} of {expected} orders confirmed")]
    ConfirmationTimeout {
        confirmed: usize,
        expected: usize,
        waited: Duration,
    },

    #[error("Run cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, HostError>;
