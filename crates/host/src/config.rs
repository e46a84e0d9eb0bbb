//! Host configuration loaded from environment variables.

use std::time::Duration;

use saga::{ConcurrencyMode, RepositorySettings};

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// Host configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `DATABASE_URL`: PostgreSQL connection string (absent: in-memory store)
/// - `SAGA_TABLE`: saga table name (default: `"saga_instances"`)
/// - `SAGA_CONCURRENCY_MODE`: `optimistic` or `pessimistic` (default: `optimistic`)
/// - `SAGA_MAX_ATTEMPTS`: dispatch attempts per message (default: `5`)
/// - `SAGA_LOCK_TIMEOUT_MS`: row lock wait in milliseconds (default: `30000`)
/// - `SAGA_LOCK_NOWAIT`: fail row locks immediately instead of waiting (default: `false`)
/// - `PIPE_CONCURRENCY_LIMIT`: in-flight dispatches (default: `16`)
/// - `ORDER_BATCH_SIZE`: orders submitted by the sample run (default: `10`)
/// - `CONFIRMATION_TIMEOUT_MS`: wait for order confirmations (default: `30000`)
/// - `METRICS_ADDR`: Prometheus listener (default: `"0.0.0.0:9000"`)
/// - `LOG_FORMAT`: `text` or `json` (default: `text`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: Option<String>,
    pub saga_table: String,
    pub concurrency_mode: ConcurrencyMode,
    pub max_attempts: u32,
    pub lock_timeout: Duration,
    pub lock_nowait: bool,
    pub concurrency_limit: usize,
    pub order_count: usize,
    pub confirmation_timeout: Duration,
    pub metrics_addr: String,
    pub log_format: LogFormat,
    pub log_level: String,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from an arbitrary key lookup. Unparseable values
    /// fall back to their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        Self {
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            saga_table: lookup("SAGA_TABLE").unwrap_or(defaults.saga_table),
            concurrency_mode: lookup("SAGA_CONCURRENCY_MODE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.concurrency_mode),
            max_attempts: parsed("SAGA_MAX_ATTEMPTS")
                .and_then(|v| u32::try_from(v).ok())
                .filter(|v| *v > 0)
                .unwrap_or(defaults.max_attempts),
            lock_timeout: parsed("SAGA_LOCK_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_timeout),
            lock_nowait: lookup("SAGA_LOCK_NOWAIT")
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(defaults.lock_nowait),
            concurrency_limit: parsed("PIPE_CONCURRENCY_LIMIT")
                .and_then(|v| usize::try_from(v).ok())
                .filter(|v| *v > 0)
                .unwrap_or(defaults.concurrency_limit),
            order_count: parsed("ORDER_BATCH_SIZE")
                .and_then(|v| usize::try_from(v).ok())
                .unwrap_or(defaults.order_count),
            confirmation_timeout: parsed("CONFIRMATION_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.confirmation_timeout),
            metrics_addr: lookup("METRICS_ADDR").unwrap_or(defaults.metrics_addr),
            log_format: lookup("LOG_FORMAT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.log_format),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
        }
    }

    /// Repository settings derived from the saga options.
    pub fn repository_settings(&self) -> RepositorySettings {
        RepositorySettings {
            concurrency_mode: self.concurrency_mode,
            ..RepositorySettings::default()
        }
        .with_max_attempts(self.max_attempts)
        .with_lock_timeout(self.lock_timeout)
    }
}

impl Default for Config {
    fn default() -> Self {
        let repository = RepositorySettings::default();
        Self {
            database_url: None,
            saga_table: "saga_instances".to_string(),
            concurrency_mode: repository.concurrency_mode,
            max_attempts: repository.max_attempts,
            lock_timeout: repository.lock_timeout,
            lock_nowait: false,
            concurrency_limit: 16,
            order_count: 10,
            confirmation_timeout: Duration::from_secs(30),
            metrics_addr: "0.0.0.0:9000".to_string(),
            log_format: LogFormat::Text,
            log_level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.database_url, None);
        assert_eq!(config.saga_table, "saga_instances");
        assert_eq!(config.concurrency_mode, ConcurrencyMode::Optimistic);
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.lock_timeout, Duration::from_secs(30));
        assert_eq!(config.metrics_addr, "0.0.0.0:9000");
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_empty_environment_uses_defaults() {
        let config = from_pairs(&[]);
        assert_eq!(config.order_count, Config::default().order_count);
        assert!(!config.lock_nowait);
    }

    #[test]
    fn test_reads_saga_options() {
        let config = from_pairs(&[
            ("DATABASE_URL", "postgres://localhost/sagas"),
            ("SAGA_TABLE", "orders.saga_state"),
            ("SAGA_CONCURRENCY_MODE", "Pessimistic"),
            ("SAGA_MAX_ATTEMPTS", "3"),
            ("SAGA_LOCK_TIMEOUT_MS", "250"),
            ("SAGA_LOCK_NOWAIT", "true"),
            ("LOG_FORMAT", "json"),
        ]);

        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://localhost/sagas")
        );
        assert_eq!(config.saga_table, "orders.saga_state");
        assert_eq!(config.concurrency_mode, ConcurrencyMode::Pessimistic);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.lock_timeout, Duration::from_millis(250));
        assert!(config.lock_nowait);
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = from_pairs(&[
            ("DATABASE_URL", ""),
            ("SAGA_CONCURRENCY_MODE", "eventual"),
            ("SAGA_MAX_ATTEMPTS", "0"),
            ("PIPE_CONCURRENCY_LIMIT", "many"),
            ("LOG_FORMAT", "xml"),
        ]);

        assert_eq!(config.database_url, None);
        assert_eq!(config.concurrency_mode, ConcurrencyMode::Optimistic);
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.concurrency_limit, 16);
        assert_eq!(config.log_format, LogFormat::Text);
    }

    #[test]
    fn test_repository_settings() {
        let config = from_pairs(&[
            ("SAGA_CONCURRENCY_MODE", "pessimistic"),
            ("SAGA_MAX_ATTEMPTS", "2"),
            ("SAGA_LOCK_TIMEOUT_MS", "100"),
        ]);
        let settings = config.repository_settings();

        assert_eq!(settings.concurrency_mode, ConcurrencyMode::Pessimistic);
        assert_eq!(settings.max_attempts, 2);
        assert_eq!(settings.lock_timeout, Duration::from_millis(100));
    }
}
