use std::collections::HashMap;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::{
    CorrelationId, IsolationLevel, Result, SagaQuery, SagaRecord, StoreError, Version,
    store::{SagaStore, StoreTransaction},
};

const DEFAULT_WRITE_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// In-memory saga store for tests and single-process hosts.
///
/// Mirrors what a relational store does under read-committed isolation:
/// plain loads see committed rows, while `load_for_update` and every write
/// take an exclusive per-key lock that is held until the transaction commits
/// or rolls back. Writes are staged and applied atomically on commit.
///
/// A key's lock entry lives only while some transaction holds or waits on it.
#[derive(Clone)]
pub struct InMemorySagaStore {
    rows: Arc<RwLock<HashMap<CorrelationId, SagaRecord>>>,
    row_locks: Arc<std::sync::Mutex<HashMap<CorrelationId, Arc<Mutex<()>>>>>,
    write_lock_timeout: Duration,
}

impl Default for InMemorySagaStore {
    fn default() -> Self {
        Self {
            rows: Arc::default(),
            row_locks: Arc::default(),
            write_lock_timeout: DEFAULT_WRITE_LOCK_TIMEOUT,
        }
    }
}

impl InMemorySagaStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets how long conditional writes wait for a row held by another transaction.
    pub fn with_write_lock_timeout(mut self, timeout: Duration) -> Self {
        self.write_lock_timeout = timeout;
        self
    }

    /// Returns the number of committed instances.
    pub async fn instance_count(&self) -> usize {
        self.rows.read().await.len()
    }

    /// Returns the committed record for an instance.
    pub async fn get(&self, correlation_id: CorrelationId) -> Option<SagaRecord> {
        self.rows.read().await.get(&correlation_id).cloned()
    }

    /// Stores a record directly, bypassing transactions.
    pub async fn seed(&self, record: SagaRecord) {
        self.rows.write().await.insert(record.correlation_id, record);
    }

    /// Removes all instances.
    pub async fn clear(&self) {
        self.rows.write().await.clear();
        self.lock_table()
            .retain(|_, row_lock| Arc::strong_count(row_lock) > 1);
    }

    fn lock_table(&self) -> std::sync::MutexGuard<'_, HashMap<CorrelationId, Arc<Mutex<()>>>> {
        self.row_locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn row_lock(&self, correlation_id: CorrelationId) -> Arc<Mutex<()>> {
        Arc::clone(self.lock_table().entry(correlation_id).or_default())
    }

    /// Drops the lock entries of `keys` nobody holds or waits on anymore.
    ///
    /// Waiters clone the entry under the table lock, so a count of one means
    /// only the table still refers to it.
    fn release_row_locks(&self, keys: impl IntoIterator<Item = CorrelationId>) {
        let mut table = self.lock_table();
        for key in keys {
            if table
                .get(&key)
                .is_some_and(|row_lock| Arc::strong_count(row_lock) == 1)
            {
                table.remove(&key);
            }
        }
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn begin(&self, isolation: IsolationLevel) -> Result<Box<dyn StoreTransaction>> {
        tracing::trace!(%isolation, "in-memory transaction started");
        Ok(Box::new(InMemoryTransaction {
            store: self.clone(),
            held: HashMap::new(),
            staged: HashMap::new(),
        }))
    }
}

/// Transaction over an [`InMemorySagaStore`].
///
/// `staged` maps a key to its pending row, `None` meaning a pending delete.
pub struct InMemoryTransaction {
    store: InMemorySagaStore,
    held: HashMap<CorrelationId, OwnedMutexGuard<()>>,
    staged: HashMap<CorrelationId, Option<SagaRecord>>,
}

impl InMemoryTransaction {
    async fn lock(&mut self, correlation_id: CorrelationId, timeout: Duration) -> Result<()> {
        if self.held.contains_key(&correlation_id) {
            return Ok(());
        }

        let row_lock = self.store.row_lock(correlation_id);
        let acquired = tokio::time::timeout(timeout, row_lock.lock_owned()).await;
        match acquired {
            Ok(guard) => {
                self.held.insert(correlation_id, guard);
                Ok(())
            }
            Err(_) => {
                self.store.release_row_locks([correlation_id]);
                Err(StoreError::LockTimeout {
                    correlation_id,
                    waited: timeout,
                })
            }
        }
    }

    /// Committed row overlaid with this transaction's own staged writes.
    async fn visible(&self, correlation_id: CorrelationId) -> Option<SagaRecord> {
        match self.staged.get(&correlation_id) {
            Some(pending) => pending.clone(),
            None => self.store.rows.read().await.get(&correlation_id).cloned(),
        }
    }
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
    async fn load(&mut self, correlation_id: CorrelationId) -> Result<Option<SagaRecord>> {
        Ok(self.visible(correlation_id).await)
    }

    async fn load_for_update(
        &mut self,
        correlation_id: CorrelationId,
        lock_timeout: Duration,
    ) -> Result<Option<SagaRecord>> {
        self.lock(correlation_id, lock_timeout).await?;
        Ok(self.visible(correlation_id).await)
    }

    async fn find(&mut self, query: &SagaQuery) -> Result<Vec<SagaRecord>> {
        let mut found: Vec<SagaRecord> = {
            let rows = self.store.rows.read().await;
            rows.values()
                .filter(|record| {
                    !self.staged.contains_key(&record.correlation_id) && query.matches(record)
                })
                .cloned()
                .collect()
        };
        found.extend(
            self.staged
                .values()
                .flatten()
                .filter(|record| query.matches(record))
                .cloned(),
        );
        found.sort_by_key(|r| r.correlation_id);
        if let Some(limit) = query.limit {
            found.truncate(limit);
        }
        Ok(found)
    }

    async fn insert(&mut self, record: &SagaRecord) -> Result<()> {
        let id = record.correlation_id;
        self.lock(id, self.store.write_lock_timeout).await?;

        if self.visible(id).await.is_some() {
            return Err(StoreError::DuplicateKey(id));
        }
        self.staged.insert(id, Some(record.clone()));
        Ok(())
    }

    async fn update_if_version(&mut self, record: &SagaRecord, expected: Version) -> Result<u64> {
        let id = record.correlation_id;
        self.lock(id, self.store.write_lock_timeout).await?;

        match self.visible(id).await {
            Some(current) if current.version == expected => {
                self.staged.insert(id, Some(record.clone()));
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn update(&mut self, record: &SagaRecord) -> Result<u64> {
        let id = record.correlation_id;
        self.lock(id, self.store.write_lock_timeout).await?;

        if self.visible(id).await.is_none() {
            return Ok(0);
        }
        self.staged.insert(id, Some(record.clone()));
        Ok(1)
    }

    async fn delete_if_version(
        &mut self,
        correlation_id: CorrelationId,
        expected: Version,
    ) -> Result<u64> {
        self.lock(correlation_id, self.store.write_lock_timeout)
            .await?;

        match self.visible(correlation_id).await {
            Some(current) if current.version == expected => {
                self.staged.insert(correlation_id, None);
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut this = self;
        let staged = std::mem::take(&mut this.staged);
        let mut rows = this.store.rows.write().await;
        for (id, pending) in staged {
            match pending {
                Some(record) => rows.insert(id, record),
                None => rows.remove(&id),
            };
        }
        // row locks are released when the transaction drops
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        let keys: Vec<CorrelationId> = self.held.keys().copied().collect();
        self.held.clear();
        self.store.release_row_locks(keys);
    }
}
