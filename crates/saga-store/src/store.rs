use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::{CorrelationId, Result, SagaQuery, SagaRecord, Version};

/// Transaction isolation levels a repository can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IsolationLevel {
    /// Sufficient for optimistic concurrency: the version check stands in for
    /// stronger isolation.
    ReadCommitted,
    RepeatableRead,
    /// Used by pessimistic concurrency together with explicit row locks.
    Serializable,
}

impl IsolationLevel {
    /// Returns the SQL spelling of the isolation level.
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_sql())
    }
}

/// Storage provider for saga instances.
///
/// Every dispatch opens its own transaction; transactions are never shared
/// across concurrent dispatches.
#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Begins a transaction at the given isolation level.
    async fn begin(&self, isolation: IsolationLevel) -> Result<Box<dyn StoreTransaction>>;
}

#[async_trait]
impl<T: SagaStore + ?Sized> SagaStore for Arc<T> {
    async fn begin(&self, isolation: IsolationLevel) -> Result<Box<dyn StoreTransaction>> {
        (**self).begin(isolation).await
    }
}

/// A unit of work against the saga store.
///
/// Writes become visible to other transactions only after [`commit`]. Dropping
/// a transaction without committing rolls it back.
///
/// [`commit`]: StoreTransaction::commit
#[async_trait]
pub trait StoreTransaction: Send {
    /// Loads an instance without locking it.
    async fn load(&mut self, correlation_id: CorrelationId) -> Result<Option<SagaRecord>>;

    /// Loads an instance and holds an exclusive lock on its key until the
    /// transaction ends. Blocks while another transaction holds the lock and
    /// fails with `LockTimeout` once `lock_timeout` has elapsed.
    ///
    /// The lock is taken even when no row exists yet, so a following insert
    /// for the same key is serialized as well.
    async fn load_for_update(
        &mut self,
        correlation_id: CorrelationId,
        lock_timeout: Duration,
    ) -> Result<Option<SagaRecord>>;

    /// Returns every instance matching the query.
    async fn find(&mut self, query: &SagaQuery) -> Result<Vec<SagaRecord>>;

    /// Inserts a new instance. Fails with `DuplicateKey` if the correlation id
    /// is already taken.
    async fn insert(&mut self, record: &SagaRecord) -> Result<()>;

    /// Writes `record` only if the stored version still equals `expected`.
    ///
    /// Returns the number of affected rows; zero means another writer got there first.
    async fn update_if_version(&mut self, record: &SagaRecord, expected: Version) -> Result<u64>;

    /// Writes `record` unconditionally. Meant for rows already locked by
    /// [`load_for_update`](StoreTransaction::load_for_update).
    async fn update(&mut self, record: &SagaRecord) -> Result<u64>;

    /// Deletes an instance if its stored version equals `expected`.
    async fn delete_if_version(
        &mut self,
        correlation_id: CorrelationId,
        expected: Version,
    ) -> Result<u64>;

    /// Commits the transaction, releasing any locks it holds.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Rolls the transaction back, releasing any locks it holds.
    async fn rollback(self: Box<Self>) -> Result<()>;
}
