//! Shared per-job review state and the notifications emitted when it changes.

use std::sync::{Mutex, MutexGuard};

use redline_core::{Decision, Job, JobSnapshot, JobStatus, Redline, StatusEvent};
use redline_store::{ExportReadiness, RedlineStore, StoreError, gate};
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

/// Phase of the job status synchronizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    Connecting,
    Streaming,
    Reconciling,
    Settled,
    /// Job-level failure; blocks the review with a human-readable message.
    Errored(String),
}

impl SyncState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncState::Settled | SyncState::Errored(_))
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncState::Connecting => f.write_str("connecting"),
            SyncState::Streaming => f.write_str("streaming"),
            SyncState::Reconciling => f.write_str("reconciling"),
            SyncState::Settled => f.write_str("settled"),
            SyncState::Errored(msg) => write!(f, "errored: {msg}"),
        }
    }
}

/// Change notifications delivered to session subscribers.
#[derive(Debug, Clone)]
pub enum ReviewEvent {
    StatusChanged(Job),
    RedlinesChanged(Vec<Redline>),
    SyncStateChanged(SyncState),
    ExportReadinessChanged(ExportReadiness),
    DecisionConfirmed {
        redline_id: String,
        decision: Decision,
    },
    /// Non-blocking warning: the local decision stands but the server has
    /// not acknowledged it.
    SubmissionFailed {
        redline_id: String,
        decision: Decision,
        attempts: u32,
        reason: String,
    },
}

/// Everything a review session knows about its job.
///
/// Mutators queue notifications in `outbox`; [`Shared::apply`] publishes
/// them before releasing the lock so subscribers observe changes in order.
#[derive(Debug)]
pub struct ReviewState {
    pub job: Job,
    pub store: RedlineStore,
    pub sync_state: SyncState,
    readiness: ExportReadiness,
    outbox: Vec<ReviewEvent>,
}

impl ReviewState {
    fn new(job_id: &str) -> Self {
        let mut state = Self {
            job: Job::new(job_id),
            store: RedlineStore::new(),
            sync_state: SyncState::Connecting,
            readiness: ExportReadiness {
                can_export: false,
                pending: 0,
            },
            outbox: Vec::new(),
        };
        state.readiness = state.evaluate_gate();
        state
    }

    pub fn readiness(&self) -> ExportReadiness {
        self.readiness
    }

    pub(crate) fn set_sync_state(&mut self, next: SyncState) {
        if self.sync_state == next {
            return;
        }
        info!(job_id = %self.job.job_id, from = %self.sync_state, to = %next, "sync state transition");
        self.sync_state = next.clone();
        self.outbox.push(ReviewEvent::SyncStateChanged(next));
        self.refresh_gate();
    }

    /// Fold a streamed event into the job. Redlines are untouched.
    pub(crate) fn apply_status_event(&mut self, event: &StatusEvent) {
        if self.job.apply_event(event) {
            self.outbox.push(ReviewEvent::StatusChanged(self.job.clone()));
            self.refresh_gate();
        }
    }

    /// Take job fields from a non-final snapshot; redlines are not applied
    /// until the job completes.
    pub(crate) fn apply_job(&mut self, mut job: Job) {
        job.progress = redline_core::clamp_progress(job.progress);
        if self.job != job {
            self.job = job;
            self.outbox.push(ReviewEvent::StatusChanged(self.job.clone()));
            self.refresh_gate();
        }
    }

    /// Install the final redline collection from a completed snapshot.
    pub(crate) fn settle(&mut self, snapshot: JobSnapshot) -> Result<(), StoreError> {
        let JobSnapshot { mut job, redlines } = snapshot;
        self.store.replace_all(redlines)?;

        if job.total_redlines != self.store.len() {
            warn!(
                job_id = %job.job_id,
                reported = job.total_redlines,
                actual = self.store.len(),
                "total_redlines disagrees with snapshot; using collection size"
            );
            job.total_redlines = self.store.len();
        }
        job.progress = redline_core::clamp_progress(job.progress);
        if job.status == JobStatus::Complete {
            job.progress = 1.0;
        }

        self.job = job;
        self.outbox.push(ReviewEvent::StatusChanged(self.job.clone()));
        self.outbox.push(ReviewEvent::RedlinesChanged(self.store.to_vec()));
        self.refresh_gate();
        Ok(())
    }

    pub(crate) fn set_decision(
        &mut self,
        redline_id: &str,
        decision: Decision,
    ) -> Result<Decision, StoreError> {
        let previous = self.store.set_decision(redline_id, decision)?;
        if previous != decision {
            self.outbox
                .push(ReviewEvent::RedlinesChanged(self.store.to_vec()));
            self.refresh_gate();
        }
        Ok(previous)
    }

    pub(crate) fn notify(&mut self, event: ReviewEvent) {
        self.outbox.push(event);
    }

    /// The gate only opens once a reconciliation pull has installed the
    /// final collection; a streamed `complete` alone leaves it closed.
    fn evaluate_gate(&self) -> ExportReadiness {
        let counts = self.store.counts();
        if self.sync_state == SyncState::Settled {
            gate::evaluate(self.job.status, &counts)
        } else {
            ExportReadiness {
                can_export: false,
                pending: counts.pending,
            }
        }
    }

    fn refresh_gate(&mut self) {
        let readiness = self.evaluate_gate();
        if readiness != self.readiness {
            self.readiness = readiness;
            self.outbox
                .push(ReviewEvent::ExportReadinessChanged(readiness));
        }
    }
}

/// Review state plus its notification channels, shared by the session,
/// synchronizer and decision queue.
pub(crate) struct Shared {
    state: Mutex<ReviewState>,
    events: broadcast::Sender<ReviewEvent>,
    sync_watch: watch::Sender<SyncState>,
}

impl Shared {
    pub(crate) fn new(job_id: &str, event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        let (sync_watch, _) = watch::channel(SyncState::Connecting);
        Self {
            state: Mutex::new(ReviewState::new(job_id)),
            events,
            sync_watch,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ReviewState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn read<R>(&self, f: impl FnOnce(&ReviewState) -> R) -> R {
        f(&self.lock())
    }

    /// Mutate the state and publish whatever notifications the mutation queued.
    pub(crate) fn apply<R>(&self, f: impl FnOnce(&mut ReviewState) -> R) -> R {
        let mut state = self.lock();
        let result = f(&mut state);
        for event in state.outbox.drain(..) {
            if let ReviewEvent::SyncStateChanged(sync) = &event {
                self.sync_watch.send_replace(sync.clone());
            }
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
        result
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ReviewEvent> {
        self.events.subscribe()
    }

    pub(crate) fn watch_sync(&self) -> watch::Receiver<SyncState> {
        self.sync_watch.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redline_core::{ChecklistRule, Severity, Span};

    fn redline(id: &str) -> Redline {
        Redline {
            id: id.into(),
            clause_type: "termination".into(),
            span: Span::new(5, 25),
            original_text: "terminate on 10 days notice".into(),
            revised_text: "terminate on 30 days notice".into(),
            severity: Severity::Low,
            confidence: 0.6,
            source: "playbook".into(),
            explanation: String::new(),
            checklist_rule: ChecklistRule::default(),
            decision: Decision::Pending,
        }
    }

    fn complete_snapshot(ids: &[&str], reported_total: usize) -> JobSnapshot {
        let mut job = Job::new("job-1");
        job.status = JobStatus::Complete;
        job.progress = 0.97;
        job.total_redlines = reported_total;
        JobSnapshot {
            job,
            redlines: ids.iter().map(|id| redline(id)).collect(),
        }
    }

    #[test]
    fn settle_fixes_total_and_progress() {
        let shared = Shared::new("job-1", 16);
        shared
            .apply(|s| s.settle(complete_snapshot(&["a", "b"], 5)))
            .unwrap();
        shared.read(|s| {
            assert_eq!(s.job.total_redlines, 2);
            assert_eq!(s.job.progress, 1.0);
            assert_eq!(s.store.len(), 2);
            assert!(!s.readiness().can_export);
            assert_eq!(s.readiness().pending, 2);
        });
    }

    #[test]
    fn notifications_follow_mutation_order() {
        let shared = Shared::new("job-1", 16);
        let mut rx = shared.subscribe();

        shared.apply(|s| s.set_sync_state(SyncState::Reconciling));
        shared
            .apply(|s| s.settle(complete_snapshot(&["a"], 1)))
            .unwrap();
        shared
            .apply(|s| s.set_decision("a", Decision::Accepted))
            .unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(match event {
                ReviewEvent::SyncStateChanged(_) => "sync",
                ReviewEvent::StatusChanged(_) => "status",
                ReviewEvent::RedlinesChanged(_) => "redlines",
                ReviewEvent::ExportReadinessChanged(_) => "gate",
                ReviewEvent::DecisionConfirmed { .. } => "confirmed",
                ReviewEvent::SubmissionFailed { .. } => "failed",
            });
        }
        assert_eq!(
            kinds,
            vec!["sync", "status", "redlines", "gate", "redlines", "gate"]
        );
        assert_eq!(*shared.watch_sync().borrow(), SyncState::Reconciling);
    }

    #[test]
    fn unchanged_decision_is_silent() {
        let shared = Shared::new("job-1", 16);
        shared
            .apply(|s| s.settle(complete_snapshot(&["a"], 1)))
            .unwrap();
        shared
            .apply(|s| s.set_decision("a", Decision::Rejected))
            .unwrap();

        let mut rx = shared.subscribe();
        let previous = shared
            .apply(|s| s.set_decision("a", Decision::Rejected))
            .unwrap();
        assert_eq!(previous, Decision::Rejected);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn streamed_completion_keeps_gate_closed() {
        let shared = Shared::new("job-1", 16);
        shared.apply(|s| {
            s.set_sync_state(SyncState::Streaming);
            s.apply_status_event(&StatusEvent {
                status: JobStatus::Complete,
                progress: 1.0,
                error: None,
            });
        });
        shared.read(|s| {
            assert_eq!(s.job.status, JobStatus::Complete);
            assert!(!s.readiness().can_export);
        });

        shared.apply(|s| s.set_sync_state(SyncState::Errored("pull failed".into())));
        assert!(!shared.read(|s| s.readiness().can_export));
    }

    #[test]
    fn gate_opens_once_settled() {
        let shared = Shared::new("job-1", 16);
        shared
            .apply(|s| s.settle(complete_snapshot(&["a"], 1)))
            .unwrap();
        shared
            .apply(|s| s.set_decision("a", Decision::Accepted))
            .unwrap();
        assert!(!shared.read(|s| s.readiness().can_export));

        shared.apply(|s| s.set_sync_state(SyncState::Settled));
        assert_eq!(
            shared.read(|s| s.readiness()),
            ExportReadiness {
                can_export: true,
                pending: 0
            }
        );
    }

    #[test]
    fn invalid_snapshot_leaves_state_alone() {
        let shared = Shared::new("job-1", 16);
        let result = shared.apply(|s| s.settle(complete_snapshot(&["a", "a"], 2)));
        assert!(matches!(result, Err(StoreError::DuplicateId(_))));
        shared.read(|s| {
            assert_eq!(s.job.status, JobStatus::Pending);
            assert!(s.store.is_empty());
        });
    }
}
