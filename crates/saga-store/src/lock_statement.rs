//! Dialect-specific row locking statements.
//!
//! Pessimistic concurrency needs a "select for update" against the
//! correlation key, and the syntax differs between storage engines.

/// Supplies the statement that loads one saga row while locking it.
///
/// The statement must select `columns` from `table`, filter on the
/// `correlation_id` column with the first positional parameter, and hold an
/// exclusive row lock until the transaction ends.
pub trait LockStatementProvider: Send + Sync {
    fn row_lock_statement(&self, table: &str, columns: &str) -> String;
}

/// PostgreSQL `SELECT ... FOR UPDATE`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresLockStatementProvider {
    no_wait: bool,
}

impl PostgresLockStatementProvider {
    /// Blocks on a held lock until the transaction's lock timeout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails immediately instead of waiting for a held lock (`FOR UPDATE NOWAIT`).
    pub fn no_wait() -> Self {
        Self { no_wait: true }
    }
}

impl LockStatementProvider for PostgresLockStatementProvider {
    fn row_lock_statement(&self, table: &str, columns: &str) -> String {
        let mut sql = format!("SELECT {columns} FROM {table} WHERE correlation_id = $1 FOR UPDATE");
        if self.no_wait {
            sql.push_str(" NOWAIT");
        }
        sql
    }
}

/// SQL Server table hints `WITH (UPDLOCK, ROWLOCK)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlServerLockStatementProvider;

impl LockStatementProvider for SqlServerLockStatementProvider {
    fn row_lock_statement(&self, table: &str, columns: &str) -> String {
        format!("SELECT {columns} FROM {table} WITH (UPDLOCK, ROWLOCK) WHERE correlation_id = @p1")
    }
}
