use async_trait::async_trait;
use saga_store::{CorrelationId, IsolationLevel, SagaRecord, StoreTransaction, Version};

use crate::error::Result;
use crate::settings::ConcurrencyMode;

/// How a repository gets exclusive use of one instance for one message.
///
/// The repository owns the transaction; the strategy decides the isolation
/// level, how rows are read and written inside it, and whether a conflict
/// that surfaces after the behavior chain ran may be retried.
#[async_trait]
pub trait LockStrategy: Send + Sync {
    fn mode(&self) -> ConcurrencyMode;

    fn isolation(&self) -> IsolationLevel;

    /// True if the whole chain may run again after a conflict at persist time.
    fn reruns_chain(&self) -> bool;

    /// Loads the instance, taking whatever lock the strategy relies on.
    async fn load(
        &self,
        transaction: &mut dyn StoreTransaction,
        correlation_id: CorrelationId,
    ) -> Result<Option<SagaRecord>>;

    /// Prepares storage for a new instance before the chain runs. `placeholder`
    /// is the fresh instance at [`Version::initial`].
    async fn create(
        &self,
        transaction: &mut dyn StoreTransaction,
        placeholder: &SagaRecord,
    ) -> Result<()>;

    /// Persists `record` over the version that was loaded (or created).
    async fn save(
        &self,
        transaction: &mut dyn StoreTransaction,
        record: &SagaRecord,
        loaded: Version,
    ) -> Result<()>;

    /// Deletes a finalized instance.
    async fn remove(
        &self,
        transaction: &mut dyn StoreTransaction,
        correlation_id: CorrelationId,
        loaded: Version,
    ) -> Result<()>;
}
