use chrono::{DateTime, Utc};

/// Next persisted state for a job after an execution attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Completed,
    Retry { run_at: DateTime<Utc> },
    Dead,
}

/// Decides between completion, a backed-off retry, and the dead-letter
/// queue.
///
/// The delay for the Nth attempt is `backoff_base^N` seconds, computed
/// with saturating arithmetic and clamped to `backoff_cap_secs` so high
/// attempt counts cannot overflow or wait unboundedly.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    backoff_cap_secs: u64,
}

impl RetryPolicy {
    pub fn new(backoff_cap_secs: u64) -> Self {
        Self { backoff_cap_secs }
    }

    /// Compute the disposition for an attempt that just finished.
    ///
    /// `attempts` is the post-increment count, i.e. the number of the
    /// attempt that just ran. `backoff_base` is read from config by the
    /// caller at decision time, so administrative changes take effect on
    /// the next retry.
    pub fn decide(
        &self,
        succeeded: bool,
        attempts: i64,
        max_retries: i64,
        backoff_base: u32,
        now: DateTime<Utc>,
    ) -> Disposition {
        if succeeded {
            return Disposition::Completed;
        }
        if attempts >= max_retries {
            return Disposition::Dead;
        }
        let delay_secs = self.backoff_secs(backoff_base, attempts);
        Disposition::Retry {
            run_at: now + chrono::Duration::seconds(delay_secs as i64),
        }
    }

    /// Backoff delay in seconds for the given post-increment attempt count.
    pub fn backoff_secs(&self, base: u32, attempts: i64) -> u64 {
        let exponent = u32::try_from(attempts).unwrap_or(u32::MAX);
        let delay = (base as u64).checked_pow(exponent).unwrap_or(u64::MAX);
        delay.min(self.backoff_cap_secs)
    }
}
