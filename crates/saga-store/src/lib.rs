//! Storage layer for saga instances.
//!
//! A saga repository needs three things from storage: a way to load an
//! instance by correlation id (optionally locking its row), a conditional
//! write keyed on the version read at load time, and transactions at a
//! chosen isolation level. [`SagaStore`] and [`StoreTransaction`] describe
//! that contract; [`InMemorySagaStore`] and [`PostgresSagaStore`] implement it.

pub mod error;
pub mod lock_statement;
pub mod memory;
pub mod postgres;
pub mod query;
pub mod record;
pub mod store;

pub use common::CorrelationId;
pub use error::{Result, StoreError};
pub use lock_statement::{
    LockStatementProvider, PostgresLockStatementProvider, SqlServerLockStatementProvider,
};
pub use memory::InMemorySagaStore;
pub use postgres::PostgresSagaStore;
pub use query::SagaQuery;
pub use record::{SagaRecord, Version};
pub use store::{IsolationLevel, SagaStore, StoreTransaction};
