//! The backend seam: everything the review engine needs from the analysis service.

use async_trait::async_trait;
use futures::stream::BoxStream;
use redline_core::{DecisionEntry, JobSnapshot, StatusEvent};

use crate::ApiError;

/// Lazy, possibly unbounded sequence of streamed status events.
///
/// Dropping the stream releases the underlying subscription.
pub type EventStream = BoxStream<'static, Result<StatusEvent, ApiError>>;

/// Operations consumed from the document analysis backend.
#[async_trait]
pub trait JobApi: Send + Sync {
    /// `GET /jobs/{id}/status`: the authoritative job and redline snapshot.
    async fn fetch_status(&self, job_id: &str) -> Result<JobSnapshot, ApiError>;

    /// `GET /jobs/{id}/events`: subscribe to pushed status events.
    async fn subscribe_events(&self, job_id: &str) -> Result<EventStream, ApiError>;

    /// `POST /jobs/{id}/decisions`. Idempotent per redline id.
    async fn submit_decisions(
        &self,
        job_id: &str,
        decisions: &[DecisionEntry],
    ) -> Result<(), ApiError>;

    /// `GET /jobs/{id}/download?final=true`: the final document artifact.
    async fn download_final(&self, job_id: &str) -> Result<Vec<u8>, ApiError>;
}
