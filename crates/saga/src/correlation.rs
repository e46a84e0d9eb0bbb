//! Mapping inbound messages to saga instances.

use std::fmt;
use std::sync::Arc;

use pipeline::Message;
use saga_store::{CorrelationId, SagaQuery};

use crate::error::CorrelationError;

type IdFn<M> = Arc<dyn Fn(&M) -> Option<CorrelationId> + Send + Sync>;
type QueryFn<M> = Arc<dyn Fn(&M) -> Option<SagaQuery> + Send + Sync>;
type NewIdFn<M> = Arc<dyn Fn(&M) -> CorrelationId + Send + Sync>;

/// How an event finds the saga instance it belongs to.
pub enum Correlation<M> {
    /// The message carries the instance's correlation id.
    ById(IdFn<M>),

    /// The instance is looked up by business data. `new_id` supplies the id
    /// of the instance an initiating message creates when the query finds
    /// nothing; it should be deterministic for a given message so that
    /// redeliveries create the same instance.
    ByQuery { query: QueryFn<M>, new_id: NewIdFn<M> },
}

impl<M> Clone for Correlation<M> {
    fn clone(&self) -> Self {
        match self {
            Correlation::ById(id) => Correlation::ById(Arc::clone(id)),
            Correlation::ByQuery { query, new_id } => Correlation::ByQuery {
                query: Arc::clone(query),
                new_id: Arc::clone(new_id),
            },
        }
    }
}

impl<M> fmt::Debug for Correlation<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Correlation::ById(_) => f.write_str("Correlation::ById"),
            Correlation::ByQuery { .. } => f.write_str("Correlation::ByQuery"),
        }
    }
}

impl<M: Message> Correlation<M> {
    /// Correlates by an id read from the message. Returning `None` makes the
    /// message uncorrelatable.
    pub fn by_id<F>(id: F) -> Self
    where
        F: Fn(&M) -> Option<CorrelationId> + Send + Sync + 'static,
    {
        Correlation::ById(Arc::new(id))
    }

    /// Correlates by a query over stored instances.
    pub fn by_query<Q, N>(query: Q, new_id: N) -> Self
    where
        Q: Fn(&M) -> Option<SagaQuery> + Send + Sync + 'static,
        N: Fn(&M) -> CorrelationId + Send + Sync + 'static,
    {
        Correlation::ByQuery {
            query: Arc::new(query),
            new_id: Arc::new(new_id),
        }
    }

    /// Computes the correlation key for a message. Performs no I/O.
    pub fn resolve(&self, message: &M) -> Result<CorrelationKey, CorrelationError> {
        let missing = || CorrelationError::MissingKey {
            message_type: M::message_type(),
        };

        match self {
            Correlation::ById(id) => id(message).map(CorrelationKey::Id).ok_or_else(missing),
            Correlation::ByQuery { query, new_id } => {
                let query = query(message).ok_or_else(missing)?;
                Ok(CorrelationKey::Query {
                    query,
                    new_id: new_id(message),
                })
            }
        }
    }
}

/// The key a repository uses to locate or create an instance.
#[derive(Debug, Clone, PartialEq)]
pub enum CorrelationKey {
    Id(CorrelationId),

    /// Resolved against the store inside the repository's transaction.
    Query {
        query: SagaQuery,
        new_id: CorrelationId,
    },
}

impl CorrelationKey {
    /// Returns the key's id when it is known without a store lookup.
    pub fn id(&self) -> Option<CorrelationId> {
        match self {
            CorrelationKey::Id(id) => Some(*id),
            CorrelationKey::Query { .. } => None,
        }
    }

    /// Resolves a query key against the matching instances.
    ///
    /// No match yields `new_id`; more than one match is ambiguous.
    pub(crate) fn select(
        &self,
        matches: &[CorrelationId],
        message_type: &'static str,
    ) -> Result<CorrelationId, CorrelationError> {
        match self {
            CorrelationKey::Id(id) => Ok(*id),
            CorrelationKey::Query { new_id, .. } => match matches {
                [] => Ok(*new_id),
                [found] => Ok(*found),
                _ => Err(CorrelationError::Ambiguous {
                    message_type,
                    count: matches.len(),
                }),
            },
        }
    }
}

impl From<CorrelationId> for CorrelationKey {
    fn from(id: CorrelationId) -> Self {
        CorrelationKey::Id(id)
    }
}
