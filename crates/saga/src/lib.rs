//! Saga orchestration on top of the consume pipe.
//!
//! A [`StateMachine`] declares states, events and the activities each
//! transition runs. A [`SagaRepository`] applies one message at a time to
//! the instance the message correlates to:
//! 1. Resolve the correlation key and load (or create) the instance under
//!    the configured [`LockStrategy`]
//! 2. Build the behavior chain for the instance's state and run it
//! 3. Persist the new state, or roll back if a fault escaped the chain
//!
//! Optimistic repositories retry conflicting messages by re-running the
//! whole chain; pessimistic repositories hold a row lock instead.

pub mod activity;
mod behavior;
pub mod consumer;
pub mod correlation;
pub mod error;
pub mod instance;
pub mod repository;
pub mod settings;
pub mod state_machine;

pub use activity::{Activity, BehaviorContext, FaultOutcome};
pub use consumer::{SagaConsumer, SagaPipeExt};
pub use correlation::{Correlation, CorrelationKey};
pub use error::{ActivityError, CorrelationError, Result, SagaError};
pub use instance::{SagaInstance, State};
pub use repository::{
    LockStrategy, OptimisticLock, PessimisticLock, SagaRepository, SendOutcome,
};
pub use settings::{ConcurrencyMode, RepositorySettings};
pub use state_machine::{MissingInstance, StateMachine, StateMachineBuilder, UnhandledEvent, When};
