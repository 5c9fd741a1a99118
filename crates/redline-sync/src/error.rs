use std::time::Duration;

use redline_core::{Decision, JobStatus};
use thiserror::Error;

/// Failure talking to the analysis backend.
#[derive(Error, Debug)]
pub enum ApiError {
    #[cfg(feature = "http")]
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned {status}: {body}")]
    Server { status: u16, body: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("event stream error: {0}")]
    Stream(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

impl ApiError {
    /// Whether another attempt could succeed.
    ///
    /// `NotFound` and client errors other than 408/429 are permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::NotFound(_) | ApiError::InvalidUrl(_) => false,
            ApiError::Server { status, .. } => {
                !(400..500).contains(status) || *status == 408 || *status == 429
            }
            _ => true,
        }
    }
}

/// Errors surfaced by the review session.
#[derive(Error, Debug)]
pub enum ReviewError {
    #[error("transport error: {0}")]
    Transport(#[from] ApiError),
    #[error("redline not found: {redline_id}")]
    NotFound { redline_id: String },
    #[error("invalid decision: {0}")]
    InvalidDecision(String),
    #[error("reconciliation failed: {0}")]
    Reconciliation(String),
    #[error("decision {decision} for {redline_id} not confirmed after {attempts} attempts: {reason}")]
    SubmissionFailure {
        redline_id: String,
        decision: Decision,
        attempts: u32,
        reason: String,
    },
    #[error("export blocked: job is {status} with {pending} redlines pending")]
    ExportBlocked { status: JobStatus, pending: usize },
}
