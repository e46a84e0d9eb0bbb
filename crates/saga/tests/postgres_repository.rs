//! Saga repositories over PostgreSQL.
//!
//! These tests share one PostgreSQL container and truncate the saga table
//! per test. Run with:
//!
//! ```bash
//! cargo test -p saga --test postgres_repository -- --test-threads=1
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use pipeline::{ConsumeContext, Message};
use saga::{
    ConcurrencyMode, Correlation, RepositorySettings, SagaInstance, SagaRepository, SendOutcome,
    State, StateMachine, When,
};
use saga_store::{CorrelationId, PostgresSagaStore, SagaQuery, Version};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

const ACTIVE: State = State::named("Active");
const MODES: [ConcurrencyMode; 2] = [ConcurrencyMode::Optimistic, ConcurrencyMode::Pessimistic];

struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();
            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();
            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let pool = PgPool::connect(&connection_string).await.unwrap();
            PostgresSagaStore::new(pool.clone())
                .run_migrations()
                .await
                .unwrap();
            pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Tally {
    correlation_id: CorrelationId,
    current_state: String,
    key: String,
    count: u32,
}

impl SagaInstance for Tally {
    fn with_correlation_id(correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id,
            current_state: State::INITIAL.to_string(),
            key: String::new(),
            count: 0,
        }
    }

    fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    fn current_state(&self) -> &str {
        &self.current_state
    }

    fn set_current_state(&mut self, state: &State) {
        self.current_state = state.to_string();
    }
}

#[derive(Debug)]
struct Opened {
    id: CorrelationId,
    key: String,
}
impl Message for Opened {}

#[derive(Debug)]
struct Counted {
    id: CorrelationId,
}
impl Message for Counted {}

#[derive(Debug)]
struct CountedByKey {
    key: String,
}
impl Message for CountedByKey {}

#[derive(Debug)]
struct Closed {
    id: CorrelationId,
}
impl Message for Closed {}

fn machine() -> StateMachine<Tally> {
    StateMachine::builder("Tally")
        .state(ACTIVE)
        .event("Opened", Correlation::by_id(|m: &Opened| Some(m.id)))
        .event("Counted", Correlation::by_id(|m: &Counted| Some(m.id)))
        .event(
            "CountedByKey",
            Correlation::by_query(
                |m: &CountedByKey| Some(SagaQuery::field_eq("key", m.key.clone())),
                |_| CorrelationId::new(),
            ),
        )
        .event("Closed", Correlation::by_id(|m: &Closed| Some(m.id)))
        .initially(
            When::new()
                .then(|tally: &mut Tally, m: &Opened| tally.key = m.key.clone())
                .transition_to(ACTIVE),
        )
        .during(
            ACTIVE,
            When::new().then(|tally: &mut Tally, _m: &Counted| tally.count += 1),
        )
        .during(
            ACTIVE,
            When::new().then(|tally: &mut Tally, _m: &CountedByKey| tally.count += 100),
        )
        .during(ACTIVE, When::<Tally, Closed>::new().finalize())
        .set_completed_when_finalized()
        .build()
        .unwrap()
}

struct TestHarness {
    pool: PgPool,
    repository: SagaRepository<Tally>,
}

impl TestHarness {
    async fn new(mode: ConcurrencyMode) -> Self {
        let info = get_container_info().await;
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(12)
            .connect(&info.connection_string)
            .await
            .unwrap();
        sqlx::query("TRUNCATE TABLE saga_instances")
            .execute(&pool)
            .await
            .unwrap();

        let settings = RepositorySettings {
            concurrency_mode: mode,
            max_attempts: 40,
            lock_timeout: Duration::from_secs(10),
            retry_backoff: Duration::from_millis(5),
            ..RepositorySettings::default()
        };
        let repository =
            SagaRepository::new(PostgresSagaStore::new(pool.clone()), Arc::new(machine()), settings);
        Self { pool, repository }
    }

    async fn send<M: Message>(&self, message: M) -> saga::Result<SendOutcome> {
        let context = ConsumeContext::new(message);
        let key = self.repository.machine().correlate(context.message())?;
        self.repository.send(&context, key).await
    }

    async fn stored(&self, id: CorrelationId) -> Option<(Tally, Version, String)> {
        let row: Option<(serde_json::Value, i64, String)> = sqlx::query_as(
            "SELECT data, version, current_state FROM saga_instances WHERE correlation_id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .unwrap();
        row.map(|(data, version, state)| {
            (
                serde_json::from_value(data).unwrap(),
                Version::new(version),
                state,
            )
        })
    }

    async fn row_count(&self) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM saga_instances")
            .fetch_one(&self.pool)
            .await
            .unwrap()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_round_trip_persists_and_finalizes() {
    for mode in MODES {
        let h = TestHarness::new(mode).await;
        let id = CorrelationId::new();

        let created = h
            .send(Opened {
                id,
                key: "Unique".into(),
            })
            .await
            .unwrap();
        assert_eq!(created, SendOutcome::Created, "{mode}");

        let (tally, version, state) = h.stored(id).await.unwrap();
        assert_eq!(state, "Active", "{mode}");
        assert_eq!(version, Version::first(), "{mode}");
        assert_eq!(tally.key, "Unique", "{mode}");

        assert_eq!(h.send(Counted { id }).await.unwrap(), SendOutcome::Updated);
        let (tally, version, _) = h.stored(id).await.unwrap();
        assert_eq!(tally.count, 1, "{mode}");
        assert_eq!(version, Version::new(2), "{mode}");

        assert_eq!(h.send(Closed { id }).await.unwrap(), SendOutcome::Finalized);
        assert!(h.stored(id).await.is_none(), "{mode}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_initiating_messages_create_one_instance() {
    for mode in MODES {
        let h = Arc::new(TestHarness::new(mode).await);
        let id = CorrelationId::new();

        let sends = (0..8).map(|i| {
            let sender = Arc::clone(&h);
            tokio::spawn(async move {
                sender
                    .send(Opened {
                        id,
                        key: format!("key-{i}"),
                    })
                    .await
            })
        });
        let outcomes: Vec<SendOutcome> = join_all(sends)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();

        let created = outcomes
            .iter()
            .filter(|o| **o == SendOutcome::Created)
            .count();
        assert_eq!(created, 1, "{mode}: {outcomes:?}");
        assert!(
            outcomes
                .iter()
                .all(|o| matches!(o, SendOutcome::Created | SendOutcome::Ignored)),
            "{mode}: {outcomes:?}"
        );
        assert_eq!(h.row_count().await, 1, "{mode}");

        let (_, version, state) = h.stored(id).await.unwrap();
        assert_eq!(version, Version::first(), "{mode}");
        assert_eq!(state, "Active", "{mode}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_updates_are_not_lost() {
    for mode in MODES {
        let h = Arc::new(TestHarness::new(mode).await);
        let id = CorrelationId::new();
        h.send(Opened {
            id,
            key: "Unique".into(),
        })
        .await
        .unwrap();

        let sends = (0..10).map(|_| {
            let sender = Arc::clone(&h);
            tokio::spawn(async move { sender.send(Counted { id }).await })
        });
        for joined in join_all(sends).await {
            assert_eq!(joined.unwrap().unwrap(), SendOutcome::Updated, "{mode}");
        }

        let (tally, version, _) = h.stored(id).await.unwrap();
        assert_eq!(tally.count, 10, "{mode}");
        assert_eq!(version, Version::new(11), "{mode}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_query_correlation_under_contention() {
    for mode in MODES {
        let h = Arc::new(TestHarness::new(mode).await);
        let id = CorrelationId::new();
        h.send(Opened {
            id,
            key: "Shared".into(),
        })
        .await
        .unwrap();

        let sends = (0..4).map(|_| {
            let sender = Arc::clone(&h);
            tokio::spawn(async move {
                sender
                    .send(CountedByKey {
                        key: "Shared".into(),
                    })
                    .await
            })
        });
        for joined in join_all(sends).await {
            assert_eq!(joined.unwrap().unwrap(), SendOutcome::Updated, "{mode}");
        }

        let (tally, _, _) = h.stored(id).await.unwrap();
        assert_eq!(tally.count, 400, "{mode}");
    }
}
