//! Connecting saga repositories to a consume pipe.

use std::marker::PhantomData;

use async_trait::async_trait;
use pipeline::{BoxError, ConnectHandle, ConsumeContext, ConsumePipe, Consumer, Message};

use crate::error::SagaError;
use crate::instance::SagaInstance;
use crate::repository::SagaRepository;

/// Pipe consumer that correlates an event message and hands it to a repository.
pub struct SagaConsumer<S, M> {
    repository: SagaRepository<S>,
    name: String,
    _message: PhantomData<fn(M)>,
}

impl<S: SagaInstance, M: Message> SagaConsumer<S, M> {
    pub fn new(repository: SagaRepository<S>) -> Self {
        let name = format!("saga:{}", repository.machine().name());
        Self {
            repository,
            name,
            _message: PhantomData,
        }
    }
}

#[async_trait]
impl<S: SagaInstance, M: Message> Consumer<M> for SagaConsumer<S, M> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn consume(&self, context: &ConsumeContext<M>) -> Result<(), BoxError> {
        let key = self
            .repository
            .machine()
            .correlate(context.message())
            .map_err(SagaError::from)?;
        self.repository.send(context, key).await?;
        Ok(())
    }
}

/// Adds saga routing to [`ConsumePipe`].
pub trait SagaPipeExt {
    /// Routes messages of type `M` to the repository's state machine.
    fn connect_saga<M: Message, S: SagaInstance>(
        &self,
        repository: &SagaRepository<S>,
    ) -> ConnectHandle;
}

impl SagaPipeExt for ConsumePipe {
    fn connect_saga<M: Message, S: SagaInstance>(
        &self,
        repository: &SagaRepository<S>,
    ) -> ConnectHandle {
        if !repository.machine().accepts::<M>() {
            tracing::warn!(
                saga = repository.machine().name(),
                message_type = M::message_type(),
                "connecting a message type the state machine does not declare"
            );
        }
        self.connect::<M, _>(SagaConsumer::<S, M>::new(repository.clone()))
    }
}
