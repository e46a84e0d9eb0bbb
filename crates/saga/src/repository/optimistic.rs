use async_trait::async_trait;
use saga_store::{CorrelationId, IsolationLevel, SagaRecord, StoreTransaction, Version};

use super::lock::LockStrategy;
use crate::error::{Result, SagaError};
use crate::settings::ConcurrencyMode;

/// Version-checked writes under read-committed isolation.
///
/// Nothing is locked while the chain runs. The final write only lands if the
/// stored version is still the one that was loaded; otherwise the repository
/// reloads and runs the chain again. A concurrent insert of the same new
/// instance is handled the same way.
#[derive(Debug, Clone, Copy, Default)]
pub struct OptimisticLock;

fn stale(correlation_id: CorrelationId, loaded: Version) -> SagaError {
    SagaError::ConcurrencyConflict {
        correlation_id: Some(correlation_id),
        reason: format!("version {loaded} of saga {correlation_id} is no longer current"),
    }
}

#[async_trait]
impl LockStrategy for OptimisticLock {
    fn mode(&self) -> ConcurrencyMode {
        ConcurrencyMode::Optimistic
    }

    fn isolation(&self) -> IsolationLevel {
        IsolationLevel::ReadCommitted
    }

    fn reruns_chain(&self) -> bool {
        true
    }

    async fn load(
        &self,
        transaction: &mut dyn StoreTransaction,
        correlation_id: CorrelationId,
    ) -> Result<Option<SagaRecord>> {
        Ok(transaction.load(correlation_id).await?)
    }

    async fn create(
        &self,
        _transaction: &mut dyn StoreTransaction,
        _placeholder: &SagaRecord,
    ) -> Result<()> {
        // the insert happens at save time and doubles as the conflict check
        Ok(())
    }

    async fn save(
        &self,
        transaction: &mut dyn StoreTransaction,
        record: &SagaRecord,
        loaded: Version,
    ) -> Result<()> {
        if loaded == Version::initial() {
            transaction.insert(record).await?;
            return Ok(());
        }

        match transaction.update_if_version(record, loaded).await? {
            0 => Err(stale(record.correlation_id, loaded)),
            _ => Ok(()),
        }
    }

    async fn remove(
        &self,
        transaction: &mut dyn StoreTransaction,
        correlation_id: CorrelationId,
        loaded: Version,
    ) -> Result<()> {
        if loaded == Version::initial() {
            return Ok(());
        }

        match transaction.delete_if_version(correlation_id, loaded).await? {
            0 => Err(stale(correlation_id, loaded)),
            _ => Ok(()),
        }
    }
}
