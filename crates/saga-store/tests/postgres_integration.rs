//! PostgreSQL integration tests
//!
//! These tests use a shared PostgreSQL container for efficiency.
//! Run with:
//!
//! ```bash
//! cargo test -p saga-store --test postgres_integration -- --test-threads=1
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use saga_store::{
    CorrelationId, IsolationLevel, PostgresLockStatementProvider, PostgresSagaStore, SagaQuery,
    SagaRecord, SagaStore, StoreError, StoreTransaction, Version,
};
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

/// Global shared container
static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();

            sqlx::raw_sql(include_str!(
                "../../../migrations/001_create_saga_instances.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();

            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh store with its own pool and a cleared table
async fn get_test_store() -> PostgresSagaStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE saga_instances")
        .execute(&pool)
        .await
        .unwrap();

    PostgresSagaStore::new(pool)
}

fn record(id: CorrelationId, version: i64, state: &str, key: &str) -> SagaRecord {
    SagaRecord::new(
        id,
        state,
        Version::new(version),
        serde_json::json!({"correlation_id": id, "key": key, "count": version}),
    )
}

#[tokio::test]
async fn insert_and_load_roundtrip() {
    let store = get_test_store().await;
    let id = CorrelationId::new();
    let original = record(id, 1, "Active", "Unique");

    let mut tx = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
    tx.insert(&original).await.unwrap();
    tx.commit().await.unwrap();

    let mut tx = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
    let loaded = tx.load(id).await.unwrap().unwrap();
    assert_eq!(loaded.correlation_id, id);
    assert_eq!(loaded.current_state, "Active");
    assert_eq!(loaded.version, Version::first());
    assert_eq!(loaded.data, original.data);
}

#[tokio::test]
async fn duplicate_insert_maps_to_duplicate_key() {
    let store = get_test_store().await;
    let id = CorrelationId::new();

    let mut tx = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
    tx.insert(&record(id, 1, "Initial", "a")).await.unwrap();
    tx.commit().await.unwrap();

    let mut tx = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
    let result = tx.insert(&record(id, 1, "Initial", "a")).await;
    assert!(matches!(result, Err(StoreError::DuplicateKey(dup)) if dup == id));
}

#[tokio::test]
async fn conditional_update_checks_version() {
    let store = get_test_store().await;
    let id = CorrelationId::new();

    let mut tx = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
    tx.insert(&record(id, 1, "Active", "a")).await.unwrap();
    tx.commit().await.unwrap();

    let mut tx = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
    let stale = tx
        .update_if_version(&record(id, 2, "Done", "a"), Version::new(7))
        .await
        .unwrap();
    assert_eq!(stale, 0);
    let fresh = tx
        .update_if_version(&record(id, 2, "Done", "a"), Version::first())
        .await
        .unwrap();
    assert_eq!(fresh, 1);
    tx.commit().await.unwrap();

    let mut tx = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
    let loaded = tx.load(id).await.unwrap().unwrap();
    assert_eq!(loaded.version, Version::new(2));
    assert_eq!(loaded.current_state, "Done");
}

#[tokio::test]
async fn find_by_data_field() {
    let store = get_test_store().await;

    let mut tx = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
    let wanted = CorrelationId::new();
    tx.insert(&record(wanted, 1, "Active", "Unique"))
        .await
        .unwrap();
    tx.insert(&record(CorrelationId::new(), 1, "Active", "Other"))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let mut tx = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
    let found = tx
        .find(&SagaQuery::field_eq("key", "Unique").in_state("Active"))
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].correlation_id, wanted);
}

#[tokio::test]
async fn row_lock_serializes_transactions() {
    let store = get_test_store().await;
    let id = CorrelationId::new();

    let mut tx = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
    tx.insert(&record(id, 1, "Active", "a")).await.unwrap();
    tx.commit().await.unwrap();

    let mut holder = store.begin(IsolationLevel::Serializable).await.unwrap();
    holder
        .load_for_update(id, Duration::from_secs(5))
        .await
        .unwrap();

    let waiter_store = store.clone();
    let waiter = tokio::spawn(async move {
        let started = Instant::now();
        let mut tx = waiter_store
            .begin(IsolationLevel::Serializable)
            .await
            .unwrap();
        let loaded = tx
            .load_for_update(id, Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        tx.commit().await.unwrap();
        (started.elapsed(), loaded.version)
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    holder.update(&record(id, 2, "Done", "a")).await.unwrap();
    holder.commit().await.unwrap();

    let (waited, version) = waiter.await.unwrap();
    assert!(waited >= Duration::from_millis(150));
    assert_eq!(version, Version::new(2));
}

#[tokio::test]
async fn lock_wait_times_out() {
    let store = get_test_store().await;
    let id = CorrelationId::new();

    let mut tx = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
    tx.insert(&record(id, 1, "Active", "a")).await.unwrap();
    tx.commit().await.unwrap();

    let mut holder = store.begin(IsolationLevel::Serializable).await.unwrap();
    holder
        .load_for_update(id, Duration::from_secs(5))
        .await
        .unwrap();

    let mut other = store.begin(IsolationLevel::Serializable).await.unwrap();
    let result = other.load_for_update(id, Duration::from_millis(100)).await;
    assert!(matches!(result, Err(StoreError::LockTimeout { .. })));
}

#[tokio::test]
async fn no_wait_dialect_fails_fast() {
    let store = get_test_store()
        .await
        .with_lock_statements(Arc::new(PostgresLockStatementProvider::no_wait()));
    let id = CorrelationId::new();

    let mut tx = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
    tx.insert(&record(id, 1, "Active", "a")).await.unwrap();
    tx.commit().await.unwrap();

    let mut holder = store.begin(IsolationLevel::Serializable).await.unwrap();
    holder
        .load_for_update(id, Duration::from_secs(5))
        .await
        .unwrap();

    let started = Instant::now();
    let mut other = store.begin(IsolationLevel::Serializable).await.unwrap();
    let result = other.load_for_update(id, Duration::from_secs(5)).await;
    assert!(matches!(result, Err(StoreError::LockTimeout { .. })));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn rejects_invalid_table_name() {
    let store = get_test_store().await;
    let result = store.with_table("sagas; DROP TABLE x");
    assert!(matches!(result, Err(StoreError::InvalidTableName(_))));
}
