//! Server-owned job state: status, progress, and the pull/stream payloads that carry it.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::Redline;

/// Lifecycle of one document analysis run.
///
/// `Complete` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    #[serde(alias = "Pending")]
    Pending,
    #[serde(alias = "Processing")]
    Processing,
    #[serde(alias = "Complete")]
    Complete,
    #[serde(alias = "Failed")]
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Complete => "complete",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A document analysis job as last reported by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    #[serde(default)]
    pub status: JobStatus,
    /// Fraction complete, always within `[0, 1]` once applied locally.
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub total_redlines: usize,
    /// Server failure message, present when `status` is `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Job {
    /// A placeholder for a job whose state has not been heard from yet.
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            status: JobStatus::Pending,
            progress: 0.0,
            filename: String::new(),
            total_redlines: 0,
            error: None,
        }
    }

    /// Fold a streamed status event into this job.
    ///
    /// Only `status`, `progress` and `error` move; redline content never
    /// arrives over the stream. Returns `true` if anything changed.
    pub fn apply_event(&mut self, event: &StatusEvent) -> bool {
        let progress = clamp_progress(event.progress);
        let changed = self.status != event.status
            || self.progress != progress
            || (event.error.is_some() && self.error != event.error);

        self.status = event.status;
        self.progress = progress;
        if event.error.is_some() {
            self.error = event.error.clone();
        }
        debug!(job_id = %self.job_id, status = %self.status, progress, "applied status event");
        changed
    }
}

/// Clamp a reported progress value into `[0, 1]`; NaN reads as zero.
pub fn clamp_progress(progress: f64) -> f64 {
    if progress.is_nan() {
        0.0
    } else {
        progress.clamp(0.0, 1.0)
    }
}

/// One event from `GET /jobs/{id}/events`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub status: JobStatus,
    #[serde(default)]
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusEvent {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Full job state from `GET /jobs/{id}/status`.
///
/// The job fields sit at the top level of the JSON object alongside the
/// `redlines` array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    #[serde(flatten)]
    pub job: Job,
    #[serde(default)]
    pub redlines: Vec<Redline>,
}
