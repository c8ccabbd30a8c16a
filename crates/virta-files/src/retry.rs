//! Bounded retry of transient I/O failures.

use std::time::Duration;
use tracing::warn;
use virta_common::{MerkleDbConfig, Result, VirtaError};

/// Retry budget for file operations.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Delay before the first retry; doubled for each further retry.
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Creates a policy from the configured budget.
    pub fn from_config(config: &MerkleDbConfig) -> Self {
        Self {
            attempts: config.io_retry_attempts.max(1),
            backoff: Duration::from_millis(config.io_retry_backoff_ms),
        }
    }

    /// Runs `op`, retrying while it fails with a transient I/O error.
    ///
    /// Non-transient errors are returned at once. When the budget runs out
    /// the last error is wrapped in `RetriesExhausted`.
    pub fn run<T>(&self, what: &str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    if attempt >= self.attempts {
                        return Err(VirtaError::RetriesExhausted {
                            attempts: attempt,
                            reason: format!("{}: {}", what, e),
                        });
                    }
                    let delay = self.backoff * (1 << (attempt - 1).min(16));
                    warn!(operation = what, attempt, error = %e, "Transient I/O failure, retrying");
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&MerkleDbConfig::default())
    }
}
