//! Identifier types shared by the saga store, the consume pipe and the saga engine.

pub mod types;

pub use types::{CorrelationId, MessageId};
