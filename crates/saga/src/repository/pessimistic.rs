use std::time::Duration;

use async_trait::async_trait;
use saga_store::{CorrelationId, IsolationLevel, SagaRecord, StoreTransaction, Version};

use super::lock::LockStrategy;
use crate::error::{Result, SagaError};
use crate::settings::ConcurrencyMode;

/// Row locks held from load until commit, under serializable isolation.
///
/// A second message for the same instance waits in [`load`] until the first
/// transaction ends, so the chain never runs twice for one message. New
/// instances are inserted as a placeholder before the chain runs; when two
/// initiating messages race, the loser's insert fails before any activity ran
/// and the repository retries it as a locked update.
///
/// [`load`]: LockStrategy::load
#[derive(Debug, Clone, Copy)]
pub struct PessimisticLock {
    lock_timeout: Duration,
}

impl PessimisticLock {
    pub fn new(lock_timeout: Duration) -> Self {
        Self { lock_timeout }
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }
}

fn lost_row(correlation_id: CorrelationId) -> SagaError {
    SagaError::ConcurrencyConflict {
        correlation_id: Some(correlation_id),
        reason: format!("locked row of saga {correlation_id} disappeared"),
    }
}

#[async_trait]
impl LockStrategy for PessimisticLock {
    fn mode(&self) -> ConcurrencyMode {
        ConcurrencyMode::Pessimistic
    }

    fn isolation(&self) -> IsolationLevel {
        IsolationLevel::Serializable
    }

    fn reruns_chain(&self) -> bool {
        false
    }

    async fn load(
        &self,
        transaction: &mut dyn StoreTransaction,
        correlation_id: CorrelationId,
    ) -> Result<Option<SagaRecord>> {
        Ok(transaction
            .load_for_update(correlation_id, self.lock_timeout)
            .await?)
    }

    async fn create(
        &self,
        transaction: &mut dyn StoreTransaction,
        placeholder: &SagaRecord,
    ) -> Result<()> {
        transaction.insert(placeholder).await?;
        tracing::trace!(correlation_id = %placeholder.correlation_id, "placeholder row inserted");
        Ok(())
    }

    async fn save(
        &self,
        transaction: &mut dyn StoreTransaction,
        record: &SagaRecord,
        _loaded: Version,
    ) -> Result<()> {
        match transaction.update(record).await? {
            0 => Err(lost_row(record.correlation_id)),
            _ => Ok(()),
        }
    }

    async fn remove(
        &self,
        transaction: &mut dyn StoreTransaction,
        correlation_id: CorrelationId,
        loaded: Version,
    ) -> Result<()> {
        match transaction.delete_if_version(correlation_id, loaded).await? {
            0 => Err(lost_row(correlation_id)),
            _ => Ok(()),
        }
    }
}
