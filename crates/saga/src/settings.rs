//! Repository configuration.

use std::str::FromStr;
use std::time::Duration;

use saga_store::SagaQuery;

/// How a repository keeps concurrent messages for one instance apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConcurrencyMode {
    /// Version-checked writes; conflicting messages are retried.
    #[default]
    Optimistic,
    /// Row locks held for the whole dispatch; no retries after the chain ran.
    Pessimistic,
}

impl ConcurrencyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConcurrencyMode::Optimistic => "optimistic",
            ConcurrencyMode::Pessimistic => "pessimistic",
        }
    }
}

impl std::fmt::Display for ConcurrencyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ConcurrencyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "optimistic" => Ok(ConcurrencyMode::Optimistic),
            "pessimistic" => Ok(ConcurrencyMode::Pessimistic),
            other => Err(format!("unknown concurrency mode '{other}'")),
        }
    }
}

/// Settings shared by both repository flavours.
#[derive(Debug, Clone)]
pub struct RepositorySettings {
    pub concurrency_mode: ConcurrencyMode,

    /// Attempts per message before giving up with `ConcurrencyExceeded`.
    pub max_attempts: u32,

    /// Longest a pessimistic repository waits for a row lock.
    pub lock_timeout: Duration,

    /// Delay before retry `n` is `n * retry_backoff`.
    pub retry_backoff: Duration,

    /// Instances that do not match are treated as missing.
    pub load_query: Option<SagaQuery>,
}

impl Default for RepositorySettings {
    fn default() -> Self {
        Self {
            concurrency_mode: ConcurrencyMode::default(),
            max_attempts: 5,
            lock_timeout: Duration::from_secs(30),
            retry_backoff: Duration::from_millis(10),
            load_query: None,
        }
    }
}

impl RepositorySettings {
    pub fn optimistic() -> Self {
        Self::default()
    }

    pub fn pessimistic() -> Self {
        Self {
            concurrency_mode: ConcurrencyMode::Pessimistic,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    pub fn with_retry_backoff(mut self, retry_backoff: Duration) -> Self {
        self.retry_backoff = retry_backoff;
        self
    }

    /// Restricts which stored instances a load may return.
    pub fn with_load_query(mut self, query: SagaQuery) -> Self {
        self.load_query = Some(query);
        self
    }

    /// Delay before the given retry (1-based).
    pub(crate) fn backoff(&self, retry: u32) -> Duration {
        self.retry_backoff.saturating_mul(retry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let settings = RepositorySettings::default();
        assert_eq!(settings.concurrency_mode, ConcurrencyMode::Optimistic);
        assert_eq!(settings.max_attempts, 5);
        assert_eq!(settings.lock_timeout, Duration::from_secs(30));
        assert!(settings.load_query.is_none());
    }

    #[test]
    fn backoff_is_linear() {
        let settings = RepositorySettings::default().with_retry_backoff(Duration::from_millis(4));
        assert_eq!(settings.backoff(1), Duration::from_millis(4));
        assert_eq!(settings.backoff(3), Duration::from_millis(12));
    }

    #[test]
    fn at_least_one_attempt() {
        assert_eq!(RepositorySettings::default().with_max_attempts(0).max_attempts, 1);
    }

    #[test]
    fn parses_concurrency_mode() {
        assert_eq!(
            "Pessimistic".parse::<ConcurrencyMode>().unwrap(),
            ConcurrencyMode::Pessimistic
        );
        assert_eq!(
            "optimistic".parse::<ConcurrencyMode>().unwrap(),
            ConcurrencyMode::Optimistic
        );
        assert!("eventual".parse::<ConcurrencyMode>().is_err());
        assert_eq!(ConcurrencyMode::Pessimistic.to_string(), "pessimistic");
    }
}
