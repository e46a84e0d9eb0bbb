use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use uuid::Uuid;

use crate::{
    CorrelationId, IsolationLevel, LockStatementProvider, PostgresLockStatementProvider, Result,
    SagaQuery, SagaRecord, StoreError, Version,
    store::{SagaStore, StoreTransaction},
};

const DEFAULT_TABLE: &str = "saga_instances";
const COLUMNS: &str = "correlation_id, current_state, version, data, updated_at";

const UNIQUE_VIOLATION: &str = "23505";
const LOCK_NOT_AVAILABLE: &str = "55P03";
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";

/// PostgreSQL-backed saga store.
#[derive(Clone)]
pub struct PostgresSagaStore {
    pool: PgPool,
    table: Arc<str>,
    lock_statements: Arc<dyn LockStatementProvider>,
}

impl PostgresSagaStore {
    /// Creates a store over the default `saga_instances` table using `FOR UPDATE` locking.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            table: Arc::from(DEFAULT_TABLE),
            lock_statements: Arc::new(PostgresLockStatementProvider::new()),
        }
    }

    /// Uses a different table. The name may be schema-qualified.
    pub fn with_table(mut self, table: &str) -> Result<Self> {
        let valid = !table.is_empty()
            && table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
        if !valid {
            return Err(StoreError::InvalidTableName(table.to_string()));
        }
        self.table = Arc::from(table);
        Ok(self)
    }

    /// Uses a different row locking statement.
    pub fn with_lock_statements(mut self, provider: Arc<dyn LockStatementProvider>) -> Self {
        self.lock_statements = provider;
        self
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }
}

#[async_trait]
impl SagaStore for PostgresSagaStore {
    async fn begin(&self, isolation: IsolationLevel) -> Result<Box<dyn StoreTransaction>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("SET TRANSACTION ISOLATION LEVEL {}", isolation.as_sql()))
            .execute(&mut *tx)
            .await?;

        Ok(Box::new(PostgresTransaction {
            tx,
            table: Arc::clone(&self.table),
            lock_statement: self.lock_statements.row_lock_statement(&self.table, COLUMNS),
        }))
    }
}

/// Transaction over a [`PostgresSagaStore`].
pub struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
    table: Arc<str>,
    lock_statement: String,
}

fn row_to_record(row: PgRow) -> Result<SagaRecord> {
    Ok(SagaRecord {
        correlation_id: CorrelationId::from_uuid(row.try_get::<Uuid, _>("correlation_id")?),
        current_state: row.try_get("current_state")?,
        version: Version::new(row.try_get("version")?),
        data: row.try_get("data")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn sqlstate(error: &sqlx::Error) -> Option<String> {
    match error {
        sqlx::Error::Database(db_err) => db_err.code().map(|code| code.into_owned()),
        _ => None,
    }
}

/// SQLSTATE classes the store gives a concurrency meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failure {
    UniqueViolation,
    LockNotAvailable,
    TransactionConflict,
    Other,
}

fn classify(sqlstate: Option<&str>) -> Failure {
    match sqlstate {
        Some(UNIQUE_VIOLATION) => Failure::UniqueViolation,
        Some(LOCK_NOT_AVAILABLE) => Failure::LockNotAvailable,
        Some(SERIALIZATION_FAILURE) | Some(DEADLOCK_DETECTED) => Failure::TransactionConflict,
        _ => Failure::Other,
    }
}

/// Maps driver errors raised for one row onto store errors.
fn map_error(error: sqlx::Error, correlation_id: CorrelationId, lock_timeout: Duration) -> StoreError {
    match classify(sqlstate(&error).as_deref()) {
        Failure::UniqueViolation => StoreError::DuplicateKey(correlation_id),
        Failure::LockNotAvailable => StoreError::LockTimeout {
            correlation_id,
            waited: lock_timeout,
        },
        Failure::TransactionConflict => StoreError::TransactionConflict(error.to_string()),
        Failure::Other => StoreError::Database(error),
    }
}

/// Maps driver errors not tied to a single row: queries, session settings, commit.
fn map_transaction_error(error: sqlx::Error) -> StoreError {
    match classify(sqlstate(&error).as_deref()) {
        Failure::TransactionConflict => StoreError::TransactionConflict(error.to_string()),
        _ => StoreError::Database(error),
    }
}

#[async_trait]
impl StoreTransaction for PostgresTransaction {
    async fn load(&mut self, correlation_id: CorrelationId) -> Result<Option<SagaRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM {} WHERE correlation_id = $1",
            self.table
        ))
        .bind(correlation_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_error(e, correlation_id, Duration::ZERO))?;

        row.map(row_to_record).transpose()
    }

    async fn load_for_update(
        &mut self,
        correlation_id: CorrelationId,
        lock_timeout: Duration,
    ) -> Result<Option<SagaRecord>> {
        // SET does not take bind parameters
        sqlx::query(&format!(
            "SET LOCAL lock_timeout = '{}ms'",
            lock_timeout.as_millis()
        ))
        .execute(&mut *self.tx)
        .await
        .map_err(map_transaction_error)?;

        let row = sqlx::query(&self.lock_statement)
            .bind(correlation_id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_error(e, correlation_id, lock_timeout))?;

        row.map(row_to_record).transpose()
    }

    async fn find(&mut self, query: &SagaQuery) -> Result<Vec<SagaRecord>> {
        let mut sql = format!("SELECT {COLUMNS} FROM {} WHERE 1=1", self.table);
        let mut param_count = 0;

        if query.state.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND current_state = ${param_count}"));
        }
        if !query.fields.is_empty() {
            param_count += 1;
            sql.push_str(&format!(" AND data @> ${param_count}"));
        }
        sql.push_str(" ORDER BY correlation_id ASC");
        if query.limit.is_some() {
            param_count += 1;
            sql.push_str(&format!(" LIMIT ${param_count}"));
        }

        let mut sqlx_query = sqlx::query(&sql);
        if let Some(ref state) = query.state {
            sqlx_query = sqlx_query.bind(state);
        }
        if !query.fields.is_empty() {
            sqlx_query = sqlx_query.bind(query.fields_as_object());
        }
        if let Some(limit) = query.limit {
            sqlx_query = sqlx_query.bind(limit as i64);
        }

        let rows = sqlx_query
            .fetch_all(&mut *self.tx)
            .await
            .map_err(map_transaction_error)?;
        rows.into_iter().map(row_to_record).collect()
    }

    async fn insert(&mut self, record: &SagaRecord) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO {} ({COLUMNS}) VALUES ($1, $2, $3, $4, $5)",
            self.table
        ))
        .bind(record.correlation_id.as_uuid())
        .bind(&record.current_state)
        .bind(record.version.as_i64())
        .bind(&record.data)
        .bind(record.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_error(e, record.correlation_id, Duration::ZERO))?;

        Ok(())
    }

    async fn update_if_version(&mut self, record: &SagaRecord, expected: Version) -> Result<u64> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE {} SET current_state = $2, version = $3, data = $4, updated_at = $5
            WHERE correlation_id = $1 AND version = $6
            "#,
            self.table
        ))
        .bind(record.correlation_id.as_uuid())
        .bind(&record.current_state)
        .bind(record.version.as_i64())
        .bind(&record.data)
        .bind(record.updated_at)
        .bind(expected.as_i64())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_error(e, record.correlation_id, Duration::ZERO))?;

        Ok(result.rows_affected())
    }

    async fn update(&mut self, record: &SagaRecord) -> Result<u64> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE {} SET current_state = $2, version = $3, data = $4, updated_at = $5
            WHERE correlation_id = $1
            "#,
            self.table
        ))
        .bind(record.correlation_id.as_uuid())
        .bind(&record.current_state)
        .bind(record.version.as_i64())
        .bind(&record.data)
        .bind(record.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_error(e, record.correlation_id, Duration::ZERO))?;

        Ok(result.rows_affected())
    }

    async fn delete_if_version(
        &mut self,
        correlation_id: CorrelationId,
        expected: Version,
    ) -> Result<u64> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE correlation_id = $1 AND version = $2",
            self.table
        ))
        .bind(correlation_id.as_uuid())
        .bind(expected.as_i64())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_error(e, correlation_id, Duration::ZERO))?;

        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.map_err(map_transaction_error)
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
