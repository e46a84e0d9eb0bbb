//! Saga repositories: load or create an instance, run the matched
//! transition, persist the result.

pub mod lock;
pub mod optimistic;
pub mod pessimistic;

use std::sync::Arc;
use std::time::Instant;

use pipeline::{ConsumeContext, Message};
use saga_store::{CorrelationId, SagaRecord, SagaStore, StoreTransaction, Version};

pub use lock::LockStrategy;
pub use optimistic::OptimisticLock;
pub use pessimistic::PessimisticLock;

use crate::activity::BehaviorContext;
use crate::correlation::CorrelationKey;
use crate::error::{Result, SagaError};
use crate::instance::{SagaInstance, State};
use crate::settings::{ConcurrencyMode, RepositorySettings};
use crate::state_machine::{EventBinding, MissingInstance, StateMachine, UnhandledEvent};

/// What a successful [`SagaRepository::send`] did to the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// A new instance was created and persisted.
    Created,
    /// An existing instance moved on and was persisted.
    Updated,
    /// The instance reached `Final` and was removed from storage.
    Finalized,
    /// The event has no transition in the instance's state; nothing changed.
    Ignored,
    /// No instance exists and the event is configured to be dropped.
    Discarded,
}

/// Runs messages against saga instances, one transaction per attempt.
///
/// Each message is applied exactly once to the persisted instance: either
/// the whole transition commits, or nothing does.
pub struct SagaRepository<S> {
    store: Arc<dyn SagaStore>,
    machine: Arc<StateMachine<S>>,
    strategy: Arc<dyn LockStrategy>,
    settings: RepositorySettings,
}

impl<S> Clone for SagaRepository<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            machine: Arc::clone(&self.machine),
            strategy: Arc::clone(&self.strategy),
            settings: self.settings.clone(),
        }
    }
}

impl<S: SagaInstance> SagaRepository<S> {
    /// Creates a repository using the lock strategy named by `settings`.
    pub fn new(
        store: impl SagaStore + 'static,
        machine: Arc<StateMachine<S>>,
        settings: RepositorySettings,
    ) -> Self {
        let strategy: Arc<dyn LockStrategy> = match settings.concurrency_mode {
            ConcurrencyMode::Optimistic => Arc::new(OptimisticLock),
            ConcurrencyMode::Pessimistic => Arc::new(PessimisticLock::new(settings.lock_timeout)),
        };
        Self {
            store: Arc::new(store),
            machine,
            strategy,
            settings,
        }
    }

    /// Creates a repository with optimistic concurrency.
    pub fn optimistic(
        store: impl SagaStore + 'static,
        machine: Arc<StateMachine<S>>,
        settings: RepositorySettings,
    ) -> Self {
        Self::new(
            store,
            machine,
            RepositorySettings {
                concurrency_mode: ConcurrencyMode::Optimistic,
                ..settings
            },
        )
    }

    /// Creates a repository with pessimistic concurrency.
    pub fn pessimistic(
        store: impl SagaStore + 'static,
        machine: Arc<StateMachine<S>>,
        settings: RepositorySettings,
    ) -> Self {
        Self::new(
            store,
            machine,
            RepositorySettings {
                concurrency_mode: ConcurrencyMode::Pessimistic,
                ..settings
            },
        )
    }

    /// Replaces the lock strategy.
    pub fn with_strategy(mut self, strategy: Arc<dyn LockStrategy>) -> Self {
        self.settings.concurrency_mode = strategy.mode();
        self.strategy = strategy;
        self
    }

    pub fn machine(&self) -> &Arc<StateMachine<S>> {
        &self.machine
    }

    pub fn settings(&self) -> &RepositorySettings {
        &self.settings
    }

    pub fn mode(&self) -> ConcurrencyMode {
        self.strategy.mode()
    }

    /// Applies one message to the instance identified by `key`.
    ///
    /// Conflicts are retried up to `max_attempts`; an optimistic retry runs
    /// the whole chain again, publishes included. Cancellation aborts the
    /// current attempt, rolling back its transaction.
    #[tracing::instrument(
        skip(self, context, key),
        fields(
            saga = %self.machine.name(),
            message_type = M::message_type(),
            mode = %self.strategy.mode(),
        )
    )]
    pub async fn send<M: Message>(
        &self,
        context: &ConsumeContext<M>,
        key: CorrelationKey,
    ) -> Result<SendOutcome> {
        metrics::counter!("saga_messages_total").increment(1);
        let started = Instant::now();
        let event = self.machine.binding::<M>()?;

        let mut attempt = 1;
        let result = loop {
            let mut executed = false;
            let result = tokio::select! {
                biased;
                () = context.cancellation().cancelled() => Err(SagaError::Cancelled),
                result = self.attempt(context, event, &key, &mut executed) => result,
            };

            match result {
                Err(error) if error.is_transient() && (self.strategy.reruns_chain() || !executed) => {
                    metrics::counter!("saga_concurrency_conflicts_total").increment(1);
                    if attempt >= self.settings.max_attempts {
                        tracing::warn!(attempt, %error, "concurrency retries exhausted");
                        break Err(SagaError::ConcurrencyExceeded {
                            message_type: M::message_type(),
                            attempts: attempt,
                        });
                    }

                    tracing::warn!(attempt, %error, "concurrency conflict, retrying");
                    tokio::select! {
                        biased;
                        () = context.cancellation().cancelled() => break Err(SagaError::Cancelled),
                        () = tokio::time::sleep(self.settings.backoff(attempt)) => {}
                    }
                    attempt += 1;
                }
                other => break other,
            }
        };

        metrics::histogram!("saga_send_duration_seconds").record(started.elapsed().as_secs_f64());
        result
    }

    async fn attempt<M: Message>(
        &self,
        context: &ConsumeContext<M>,
        event: &EventBinding<S, M>,
        key: &CorrelationKey,
        executed: &mut bool,
    ) -> Result<SendOutcome> {
        let mut transaction = self.store.begin(self.strategy.isolation()).await?;
        let correlation_id = self
            .resolve(transaction.as_mut(), key, M::message_type())
            .await?;

        let lock_started = Instant::now();
        let loaded = self
            .strategy
            .load(transaction.as_mut(), correlation_id)
            .await
            .inspect_err(|error| {
                if matches!(error, SagaError::LockTimeout { .. }) {
                    metrics::counter!("saga_lock_timeouts_total").increment(1);
                    tracing::warn!(%correlation_id, %error, "lock wait timed out");
                }
            })?;
        metrics::histogram!("saga_lock_wait_seconds").record(lock_started.elapsed().as_secs_f64());

        let (mut instance, version, created) = match loaded {
            Some(record) if self.visible(&record) => {
                let version = record.version;
                (self.restore(record)?, version, false)
            }
            None if event.is_initiating() => {
                let mut instance = S::with_correlation_id(correlation_id);
                instance.set_current_state(&State::INITIAL);
                let placeholder = SagaRecord::new(
                    correlation_id,
                    State::INITIAL.as_str(),
                    Version::initial(),
                    serde_json::to_value(&instance)?,
                );
                self.strategy
                    .create(transaction.as_mut(), &placeholder)
                    .await?;
                (instance, Version::initial(), true)
            }
            Some(record) => {
                // the id is still taken, so an initiating event cannot replace it
                tracing::debug!(
                    %correlation_id,
                    state = %record.current_state,
                    "instance hidden by the load query"
                );
                return self.missing(transaction, event, correlation_id).await;
            }
            None => return self.missing(transaction, event, correlation_id).await,
        };

        let state = instance.current_state().to_string();
        let Some(chain) = event.chain(&state, context) else {
            transaction.rollback().await?;
            return match event.unhandled {
                UnhandledEvent::Ignore => {
                    tracing::debug!(%correlation_id, state = %state, event = %event.name, "event ignored");
                    Ok(SendOutcome::Ignored)
                }
                UnhandledEvent::Fault => Err(SagaError::UnhandledEvent {
                    state,
                    event: event.name.clone(),
                }),
            };
        };

        *executed = true;
        let executed_chain = {
            let mut behavior = BehaviorContext::new(&mut instance, context, &event.name);
            chain.execute(&mut behavior).await
        };
        if let Err(fault) = executed_chain {
            metrics::counter!("saga_execution_faults_total").increment(1);
            if let Err(error) = transaction.rollback().await {
                tracing::warn!(%correlation_id, %error, "rollback after fault failed");
            }
            return Err(SagaError::Execution {
                saga: self.machine.name().to_string(),
                state,
                event: event.name.clone(),
                activity: fault.activity,
                source: fault.error,
            });
        }

        if context.is_cancelled() {
            transaction.rollback().await?;
            return Err(SagaError::Cancelled);
        }

        let outcome =
            if instance.is_in(&State::FINAL) && self.machine.completed_when_finalized() {
                self.strategy
                    .remove(transaction.as_mut(), correlation_id, version)
                    .await?;
                SendOutcome::Finalized
            } else {
                let record = SagaRecord::new(
                    correlation_id,
                    instance.current_state(),
                    version.next(),
                    serde_json::to_value(&instance)?,
                );
                self.strategy
                    .save(transaction.as_mut(), &record, version)
                    .await?;
                if created {
                    SendOutcome::Created
                } else {
                    SendOutcome::Updated
                }
            };
        transaction.commit().await?;

        if created {
            metrics::counter!("saga_instances_created_total").increment(1);
            tracing::info!(%correlation_id, state = instance.current_state(), "saga instance created");
        }
        if outcome == SendOutcome::Finalized {
            metrics::counter!("saga_instances_finalized_total").increment(1);
            tracing::info!(%correlation_id, "saga instance finalized");
        }
        tracing::debug!(
            %correlation_id,
            from = %state,
            to = instance.current_state(),
            ?outcome,
            "message applied"
        );

        Ok(outcome)
    }

    /// Turns a correlation key into an id, querying inside the attempt's
    /// transaction when needed.
    async fn resolve(
        &self,
        transaction: &mut dyn StoreTransaction,
        key: &CorrelationKey,
        message_type: &'static str,
    ) -> Result<CorrelationId> {
        match key {
            CorrelationKey::Id(id) => Ok(*id),
            CorrelationKey::Query { query, .. } => {
                let matches: Vec<CorrelationId> = transaction
                    .find(&query.clone().limit(2))
                    .await?
                    .into_iter()
                    .map(|record| record.correlation_id)
                    .collect();
                Ok(key.select(&matches, message_type)?)
            }
        }
    }

    fn visible(&self, record: &SagaRecord) -> bool {
        self.settings
            .load_query
            .as_ref()
            .is_none_or(|query| query.matches(record))
    }

    fn restore(&self, record: SagaRecord) -> Result<S> {
        if !self.machine.is_declared(&record.current_state) {
            return Err(SagaError::UnknownState(record.current_state));
        }
        let mut instance: S = serde_json::from_value(record.data)?;
        instance.set_current_state(&State::new(record.current_state));
        Ok(instance)
    }

    async fn missing<M: Message>(
        &self,
        transaction: Box<dyn StoreTransaction>,
        event: &EventBinding<S, M>,
        correlation_id: CorrelationId,
    ) -> Result<SendOutcome> {
        transaction.rollback().await?;
        match event.missing_instance {
            MissingInstance::Discard => {
                tracing::debug!(%correlation_id, event = %event.name, "no instance, message discarded");
                Ok(SendOutcome::Discarded)
            }
            MissingInstance::Fault => Err(SagaError::MissingInstance {
                saga: self.machine.name().to_string(),
                event: event.name.clone(),
                correlation_id,
            }),
        }
    }
}

impl<S> std::fmt::Debug for SagaRepository<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaRepository")
            .field("machine", &self.machine)
            .field("mode", &self.strategy.mode())
            .field("settings", &self.settings)
            .finish()
    }
}
