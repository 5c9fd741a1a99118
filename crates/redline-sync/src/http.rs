//! HTTP client for the document analysis backend.

use async_trait::async_trait;
use redline_core::{DecisionBatch, DecisionEntry, JobSnapshot};
use reqwest::{StatusCode, Url};
use tracing::info;

use crate::api::{EventStream, JobApi};
use crate::{ApiError, sse};

/// `reqwest` implementation of [`JobApi`].
pub struct JobClient {
    client: reqwest::Client,
    base_url: String,
}

impl JobClient {
    /// Create a client for the given backend base URL.
    ///
    /// `base_url` should be like `http://localhost:8000` (no trailing slash).
    pub fn new(base_url: String) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    /// Use a preconfigured `reqwest::Client` (proxies, TLS roots, ...).
    pub fn with_client(client: reqwest::Client, base_url: String) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `{base_url}/jobs/{job_id}/{path}` with `job_id` percent-encoded as a
    /// single path segment.
    fn job_url(&self, job_id: &str, path: &str) -> Result<Url, ApiError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| ApiError::InvalidUrl(format!("{}: {e}", self.base_url)))?;
        url.path_segments_mut()
            .map_err(|_| ApiError::InvalidUrl(format!("{} cannot be a base", self.base_url)))?
            .pop_if_empty()
            .extend(["jobs", job_id, path]);
        Ok(url)
    }

    /// Map non-success responses onto [`ApiError`]; 404 means the job is unknown.
    async fn check(
        resp: reqwest::Response,
        job_id: &str,
    ) -> Result<reqwest::Response, ApiError> {
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ApiError::NotFound(format!("job {job_id}")));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError::Server {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp)
    }
}

#[async_trait]
impl JobApi for JobClient {
    async fn fetch_status(&self, job_id: &str) -> Result<JobSnapshot, ApiError> {
        let url = self.job_url(job_id, "status")?;

        info!(url = %url, "fetching job status");
        let resp = self.client.get(url).send().await?;
        let resp = Self::check(resp, job_id).await?;

        let snapshot: JobSnapshot = resp.json().await?;
        info!(
            status = %snapshot.job.status,
            redlines = snapshot.redlines.len(),
            "fetched job status"
        );
        Ok(snapshot)
    }

    async fn subscribe_events(&self, job_id: &str) -> Result<EventStream, ApiError> {
        let url = self.job_url(job_id, "events")?;

        info!(url = %url, "subscribing to job events");
        let resp = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;
        let resp = Self::check(resp, job_id).await?;

        Ok(sse::status_events(Box::pin(resp.bytes_stream())))
    }

    async fn submit_decisions(
        &self,
        job_id: &str,
        decisions: &[DecisionEntry],
    ) -> Result<(), ApiError> {
        let url = self.job_url(job_id, "decisions")?;
        let body = DecisionBatch {
            decisions: decisions.to_vec(),
        };

        info!(url = %url, count = decisions.len(), "posting decisions");
        let resp = self.client.post(url).json(&body).send().await?;
        Self::check(resp, job_id).await?;
        Ok(())
    }

    async fn download_final(&self, job_id: &str) -> Result<Vec<u8>, ApiError> {
        let mut url = self.job_url(job_id, "download")?;
        url.query_pairs_mut().append_pair("final", "true");

        info!(url = %url, "downloading final document");
        let resp = self.client.get(url).send().await?;
        let resp = Self::check(resp, job_id).await?;

        let bytes = resp.bytes().await?;
        info!(bytes = bytes.len(), "download complete");
        Ok(bytes.to_vec())
    }
}
