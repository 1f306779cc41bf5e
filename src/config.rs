use std::time::Duration;

use crate::error::{QueueError, Result};

/// Tunables for a worker process.
///
/// The stale lock threshold must always exceed the execution timeout:
/// a lock is only presumed abandoned once its command can no longer be
/// running. [`WorkerConfig::validate`] enforces this.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Sleep between polls when no job is eligible (milliseconds)
    pub poll_interval_ms: u64,
    /// Hard cap on a single command execution (milliseconds)
    pub exec_timeout_ms: u64,
    /// Processing locks older than this are considered abandoned and
    /// become rescuable by another worker (milliseconds)
    pub stale_lock_ms: u64,
    /// Ceiling on the exponential retry delay (seconds)
    pub backoff_cap_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            exec_timeout_ms: 30_000,
            stale_lock_ms: 60_000,
            backoff_cap_secs: 3_600,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn exec_timeout(&self) -> Duration {
        Duration::from_millis(self.exec_timeout_ms)
    }

    pub fn stale_lock(&self) -> Duration {
        Duration::from_millis(self.stale_lock_ms)
    }

    /// Check that the configuration cannot produce duplicate execution.
    pub fn validate(&self) -> Result<()> {
        if self.stale_lock_ms <= self.exec_timeout_ms {
            return Err(QueueError::InvalidConfig(format!(
                "stale_lock_ms ({}) must exceed exec_timeout_ms ({}), \
                 otherwise a slow job can be rescued while still running",
                self.stale_lock_ms, self.exec_timeout_ms
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(QueueError::InvalidConfig(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(WorkerConfig::default().validate().is_ok());
    }

    #[test]
    fn stale_threshold_must_exceed_timeout() {
        let config = WorkerConfig {
            exec_timeout_ms: 30_000,
            stale_lock_ms: 10_000,
            ..WorkerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn equal_stale_and_timeout_is_rejected() {
        let config = WorkerConfig {
            exec_timeout_ms: 30_000,
            stale_lock_ms: 30_000,
            ..WorkerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let config = WorkerConfig {
            poll_interval_ms: 0,
            ..WorkerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
