use std::time::Duration;

use serde::Serialize;

use crate::SyncError;

/// Bounded retry with a fixed pause between attempts. Attempts count from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Folder attempts: three tries, five seconds apart.
    pub fn folder_default() -> Self {
        Self::new(3, Duration::from_secs(5))
    }

    /// Failed messages get one more try at the end of the run.
    pub fn message_default() -> Self {
        Self::new(2, Duration::ZERO)
    }

    pub fn has_attempts_left(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Pause before the next attempt, or `None` when `err` ends the retry.
    pub fn next_delay(&self, attempt: u32, err: &SyncError) -> Option<Duration> {
        self.delay_after(attempt, err.is_retryable())
    }

    /// Same decision for a failure known only by its recorded
    /// classification, as for messages queued during a folder pass.
    pub fn delay_after(&self, attempt: u32, retryable: bool) -> Option<Duration> {
        if retryable && self.has_attempts_left(attempt) {
            Some(self.backoff)
        } else {
            None
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::folder_default()
    }
}
