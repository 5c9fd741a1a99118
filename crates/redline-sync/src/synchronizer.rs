//! Job status synchronizer: stream while the job runs, pull to settle.
//!
//! ```text
//! Connecting ──subscribed──▶ Streaming ──terminal event / drop / error──▶ Reconciling
//!     │                                                                   │
//!     └──────────────subscription failed──────────────────────────────────┘
//! Reconciling ──complete──▶ Settled
//!             ──failed / not found / retries exhausted──▶ Errored
//!             ──still running──▶ (poll interval) ──▶ Connecting
//! ```
//!
//! The pull is the only writer of redline content; streamed events only move
//! status and progress.

use std::sync::Arc;

use futures::StreamExt;
use redline_core::{JobSnapshot, JobStatus};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{EventStream, JobApi};
use crate::state::{Shared, SyncState};
use crate::{ApiError, ReviewError, SyncConfig};

enum Reconciled {
    Settled,
    Errored(String),
    StillRunning,
}

pub(crate) struct Synchronizer {
    api: Arc<dyn JobApi>,
    shared: Arc<Shared>,
    job_id: String,
    config: SyncConfig,
    cancel: CancellationToken,
}

impl Synchronizer {
    pub(crate) fn new(
        api: Arc<dyn JobApi>,
        shared: Arc<Shared>,
        job_id: String,
        config: SyncConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            api,
            shared,
            job_id,
            config,
            cancel,
        }
    }

    /// Drive the job to `Settled` or `Errored`, or until cancelled.
    ///
    /// Returns the final sync state. The event subscription is dropped
    /// before this returns on every path.
    pub(crate) async fn run(self) -> SyncState {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                let state = self.shared.read(|s| s.sync_state.clone());
                info!(job_id = %self.job_id, state = %state, "synchronizer cancelled");
                state
            }
            state = self.drive() => state,
        }
    }

    async fn drive(&self) -> SyncState {
        loop {
            self.transition(SyncState::Connecting);
            match self.subscribe().await {
                Ok(stream) => {
                    self.transition(SyncState::Streaming);
                    self.consume(stream).await;
                }
                Err(err) => {
                    warn!(job_id = %self.job_id, error = %err, "event subscription failed; reconciling");
                }
            }

            self.transition(SyncState::Reconciling);
            match self.reconcile().await {
                Reconciled::Settled => {
                    self.transition(SyncState::Settled);
                    return SyncState::Settled;
                }
                Reconciled::Errored(message) => {
                    let state = SyncState::Errored(message);
                    self.transition(state.clone());
                    return state;
                }
                Reconciled::StillRunning => {
                    debug!(job_id = %self.job_id, "job still running; resubscribing after poll interval");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }
    }

    async fn subscribe(&self) -> Result<EventStream, ApiError> {
        match tokio::time::timeout(
            self.config.request_timeout,
            self.api.subscribe_events(&self.job_id),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ApiError::Timeout(self.config.request_timeout)),
        }
    }

    /// Apply streamed events until a terminal one, an error, the end of the
    /// stream, or `stream_idle_timeout` of silence. Consumes (and so
    /// releases) the subscription.
    async fn consume(&self, mut stream: EventStream) {
        let idle = self.config.stream_idle_timeout;
        loop {
            let item = match tokio::time::timeout(idle, stream.next()).await {
                Ok(Some(item)) => item,
                Ok(None) => {
                    warn!(job_id = %self.job_id, "event stream closed before a terminal event; reconciling");
                    return;
                }
                Err(_) => {
                    warn!(
                        job_id = %self.job_id,
                        idle_secs = idle.as_secs(),
                        "event stream silent; treating as dropped and reconciling"
                    );
                    return;
                }
            };
            match item {
                Ok(event) => {
                    debug!(job_id = %self.job_id, status = %event.status, progress = event.progress, "status event");
                    self.shared.apply(|s| s.apply_status_event(&event));
                    if event.is_terminal() {
                        info!(job_id = %self.job_id, status = %event.status, "terminal status event");
                        return;
                    }
                }
                Err(err) => {
                    warn!(job_id = %self.job_id, error = %err, "event stream failed; reconciling");
                    return;
                }
            }
        }
    }

    /// Authoritative pull with bounded retries on transient failures.
    async fn reconcile(&self) -> Reconciled {
        let attempts = self.config.reconcile_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(
                self.config.request_timeout,
                self.api.fetch_status(&self.job_id),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ApiError::Timeout(self.config.request_timeout)),
            };

            match result {
                Ok(snapshot) => return self.apply_snapshot(snapshot),
                Err(err) if err.is_transient() && attempt < attempts => {
                    let delay = self.config.backoff(attempt);
                    warn!(
                        job_id = %self.job_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "status pull failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    warn!(job_id = %self.job_id, attempt, error = %err, "status pull failed; giving up");
                    return Reconciled::Errored(ReviewError::Reconciliation(err.to_string()).to_string());
                }
            }
        }
    }

    fn apply_snapshot(&self, snapshot: JobSnapshot) -> Reconciled {
        match snapshot.job.status {
            JobStatus::Complete => {
                let count = snapshot.redlines.len();
                match self.shared.apply(|s| s.settle(snapshot)) {
                    Ok(()) => {
                        info!(job_id = %self.job_id, redlines = count, "job settled");
                        Reconciled::Settled
                    }
                    Err(err) => Reconciled::Errored(
                        ReviewError::Reconciliation(format!("invalid snapshot: {err}")).to_string(),
                    ),
                }
            }
            JobStatus::Failed => {
                let message = snapshot
                    .job
                    .error
                    .clone()
                    .unwrap_or_else(|| "analysis failed".to_string());
                self.shared.apply(|s| s.apply_job(snapshot.job));
                Reconciled::Errored(message)
            }
            JobStatus::Pending | JobStatus::Processing => {
                self.shared.apply(|s| s.apply_job(snapshot.job));
                Reconciled::StillRunning
            }
        }
    }

    fn transition(&self, next: SyncState) {
        self.shared.apply(|s| s.set_sync_state(next));
    }
}
