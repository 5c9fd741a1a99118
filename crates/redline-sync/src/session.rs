//! Driver-facing view of one job under review.

use std::sync::Arc;

use redline_core::{Decision, Job, Redline};
use redline_store::{DecisionCounts, ExportReadiness};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::api::JobApi;
use crate::queue::{DecisionQueue, RecordStatus};
use crate::state::{ReviewEvent, Shared, SyncState};
use crate::synchronizer::Synchronizer;
use crate::{ReviewError, SyncConfig};

/// A live review of one job.
///
/// Opening a session starts the synchronizer in the background. Dropping the
/// session (or calling [`shutdown`](Self::shutdown)) releases the event
/// subscription and cancels pending decision retries; requests already on
/// the wire finish and their results are discarded.
pub struct ReviewSession {
    job_id: String,
    api: Arc<dyn JobApi>,
    shared: Arc<Shared>,
    queue: DecisionQueue,
    cancel: CancellationToken,
}

impl ReviewSession {
    /// Start synchronizing `job_id`. Must be called within a tokio runtime.
    pub fn open(api: Arc<dyn JobApi>, job_id: impl Into<String>, config: SyncConfig) -> Self {
        let job_id = job_id.into();
        let shared = Arc::new(Shared::new(&job_id, config.event_capacity));
        let cancel = CancellationToken::new();

        let queue = DecisionQueue::new(
            api.clone(),
            shared.clone(),
            job_id.clone(),
            config.clone(),
            cancel.clone(),
        );
        let synchronizer = Synchronizer::new(
            api.clone(),
            shared.clone(),
            job_id.clone(),
            config,
            cancel.child_token(),
        );
        tokio::spawn(synchronizer.run());

        info!(job_id = %job_id, "review session opened");
        Self {
            job_id,
            api,
            shared,
            queue,
            cancel,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Subscribe to status, redline, sync-state, gate and decision notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ReviewEvent> {
        self.shared.subscribe()
    }

    pub fn job(&self) -> Job {
        self.shared.read(|s| s.job.clone())
    }

    pub fn redlines(&self) -> Vec<Redline> {
        self.shared.read(|s| s.store.to_vec())
    }

    pub fn redline(&self, redline_id: &str) -> Option<Redline> {
        self.shared.read(|s| s.store.get(redline_id).cloned())
    }

    /// The next undecided redline after `after` in document order, wrapping.
    pub fn next_pending(&self, after: Option<&str>) -> Option<Redline> {
        self.shared.read(|s| s.store.next_pending(after).cloned())
    }

    pub fn counts(&self) -> DecisionCounts {
        self.shared.read(|s| s.store.counts())
    }

    pub fn sync_state(&self) -> SyncState {
        self.shared.read(|s| s.sync_state.clone())
    }

    /// Wait for the synchronizer to settle or error. Returns the current
    /// state immediately if the session has been shut down.
    pub async fn wait_settled(&self) -> SyncState {
        let mut watch = self.shared.watch_sync();
        tokio::select! {
            result = watch.wait_for(SyncState::is_terminal) => match result {
                Ok(state) => state.clone(),
                Err(_) => self.sync_state(),
            },
            _ = self.cancel.cancelled() => self.sync_state(),
        }
    }

    /// Apply a reviewer decision locally and confirm it in the background.
    ///
    /// Returns the previous decision.
    pub fn submit_decision(
        &self,
        redline_id: &str,
        decision: Decision,
    ) -> Result<Decision, ReviewError> {
        self.queue.submit(redline_id, decision)
    }

    pub fn decision_status(&self, redline_id: &str) -> Option<RecordStatus> {
        self.queue.status(redline_id)
    }

    pub fn failed_submissions(&self) -> Vec<String> {
        self.queue.failed_ids()
    }

    /// Redeliver failed decisions and wait for every confirmation to finish.
    pub async fn flush(&self) {
        self.queue.flush().await;
    }

    /// Wait for in-flight confirmations without redelivering failures.
    pub async fn wait_idle(&self) {
        self.queue.wait_idle().await;
    }

    pub fn export_readiness(&self) -> ExportReadiness {
        self.shared.read(|s| s.readiness())
    }

    pub fn can_export(&self) -> bool {
        self.export_readiness().can_export
    }

    pub fn pending_count(&self) -> usize {
        self.export_readiness().pending
    }

    /// Download the final document. Refused without a network call while the
    /// export gate is closed.
    pub async fn export(&self) -> Result<Vec<u8>, ReviewError> {
        let (status, readiness) = self.shared.read(|s| (s.job.status, s.readiness()));
        if !readiness.can_export {
            return Err(ReviewError::ExportBlocked {
                status,
                pending: readiness.pending,
            });
        }
        let bytes = self.api.download_final(&self.job_id).await?;
        info!(job_id = %self.job_id, bytes = bytes.len(), "final document exported");
        Ok(bytes)
    }

    /// Stop synchronizing and cancel pending retries.
    pub fn shutdown(&self) {
        if !self.cancel.is_cancelled() {
            info!(job_id = %self.job_id, "review session closed");
            self.cancel.cancel();
        }
    }
}

impl Drop for ReviewSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}
