//! Timeouts, retry budgets and policies for a review session.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// What to do once a decision has exhausted its delivery attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Keep the local decision and emit a `SubmissionFailed` notification.
    #[default]
    Notify,
    /// Pull the job status once first; if the server already holds the
    /// local decision, count the submission as confirmed.
    Verify,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown failure policy {0:?} (expected notify or verify)")]
pub struct ParsePolicyError(pub String);

impl FromStr for FailurePolicy {
    type Err = ParsePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "notify" => Ok(FailurePolicy::Notify),
            "verify" => Ok(FailurePolicy::Verify),
            _ => Err(ParsePolicyError(s.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Upper bound on each status pull, subscription and decision round trip.
    pub request_timeout: Duration,
    /// Status pulls per reconciliation before the job is marked errored.
    pub reconcile_attempts: u32,
    /// Delivery attempts per decision before it is reported failed.
    pub submit_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Wait between status pulls while the job is still running.
    pub poll_interval: Duration,
    /// Silence on the event stream longer than this counts as a dropped
    /// connection and triggers a status pull.
    pub stream_idle_timeout: Duration,
    /// Periodic redelivery of failed decisions; `None` disables it.
    pub flush_interval: Option<Duration>,
    pub failure_policy: FailurePolicy,
    /// Buffer size of the notification channel.
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            reconcile_attempts: 3,
            submit_attempts: 3,
            backoff_base: Duration::from_millis(250),
            backoff_max: Duration::from_secs(5),
            poll_interval: Duration::from_secs(2),
            stream_idle_timeout: Duration::from_secs(30),
            flush_interval: None,
            failure_policy: FailurePolicy::Notify,
            event_capacity: 256,
        }
    }
}

impl SyncConfig {
    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at `backoff_max`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.backoff_base
            .saturating_mul(1u32 << exp)
            .min(self.backoff_max)
    }
}
