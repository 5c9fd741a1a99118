//! Decision submission queue.
//!
//! Decisions are applied to the store immediately and confirmed with the
//! backend on a background task per redline. Each redline has a single
//! pending-request slot: a newer decision overwrites the slot and the worker
//! sends it once the request already on the wire returns. Decisions that
//! exhaust their retries are kept in a redelivery set and retried on the next
//! submission, on [`DecisionQueue::flush`], or on the periodic flush timer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use redline_core::{Decision, DecisionEntry};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::JobApi;
use crate::state::{ReviewEvent, Shared};
use crate::{ApiError, FailurePolicy, ReviewError, SyncConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    Queued,
    Inflight,
    Confirmed,
    Failed,
}

/// A reviewer decision on its way to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionRecord {
    pub redline_id: String,
    pub decision: Decision,
    pub attempt_count: u32,
    pub status: RecordStatus,
}

impl DecisionRecord {
    fn queued(redline_id: &str, decision: Decision) -> Self {
        Self {
            redline_id: redline_id.to_string(),
            decision,
            attempt_count: 0,
            status: RecordStatus::Queued,
        }
    }
}

/// A slot exists exactly while a worker task owns delivery for its redline.
/// `generation` bumps whenever the slot's decision is replaced.
struct Slot {
    record: DecisionRecord,
    generation: u64,
}

#[derive(Default)]
struct Registers {
    slots: HashMap<String, Slot>,
    failed: HashMap<String, DecisionRecord>,
    /// Worker tasks still running, including ones reporting a failure.
    workers: usize,
}

struct QueueInner {
    api: Arc<dyn JobApi>,
    shared: Arc<Shared>,
    job_id: String,
    config: SyncConfig,
    cancel: CancellationToken,
    registers: Mutex<Registers>,
    idle: Notify,
}

impl QueueInner {
    fn lock(&self) -> MutexGuard<'_, Registers> {
        self.registers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Cheap to clone; clones share the same registers.
#[derive(Clone)]
pub struct DecisionQueue {
    inner: Arc<QueueInner>,
}

impl DecisionQueue {
    /// Must be called within a tokio runtime when `flush_interval` is set.
    pub(crate) fn new(
        api: Arc<dyn JobApi>,
        shared: Arc<Shared>,
        job_id: String,
        config: SyncConfig,
        cancel: CancellationToken,
    ) -> Self {
        let queue = Self {
            inner: Arc::new(QueueInner {
                api,
                shared,
                job_id,
                config,
                cancel,
                registers: Mutex::new(Registers::default()),
                idle: Notify::new(),
            }),
        };
        if let Some(interval) = queue.inner.config.flush_interval {
            tokio::spawn(periodic_flush(queue.clone(), interval));
        }
        queue
    }

    /// Record a reviewer decision and start confirming it.
    ///
    /// Returns the decision it replaced locally. Fails without touching any
    /// state if the redline is unknown or the decision is not accept/reject.
    pub fn submit(&self, redline_id: &str, decision: Decision) -> Result<Decision, ReviewError> {
        let not_found = || ReviewError::NotFound {
            redline_id: redline_id.to_string(),
        };
        if !self.inner.shared.read(|s| s.store.contains(redline_id)) {
            return Err(not_found());
        }
        if decision.is_pending() {
            return Err(ReviewError::InvalidDecision(format!(
                "{decision} is not a reviewer verdict for {redline_id}"
            )));
        }

        let previous = self
            .inner
            .shared
            .apply(|s| s.set_decision(redline_id, decision))
            .map_err(|_| not_found())?;
        info!(redline_id, %previous, %decision, "decision applied locally");

        self.enqueue(redline_id, decision);
        self.redeliver_failed();
        Ok(previous)
    }

    fn enqueue(&self, redline_id: &str, decision: Decision) {
        let spawn = {
            let mut registers = self.inner.lock();
            registers.failed.remove(redline_id);
            match registers.slots.get_mut(redline_id) {
                Some(slot) if slot.record.decision == decision => {
                    debug!(redline_id, %decision, "identical decision already queued");
                    false
                }
                Some(slot) => {
                    debug!(redline_id, superseded = %slot.record.decision, %decision, "decision superseded");
                    slot.record = DecisionRecord::queued(redline_id, decision);
                    slot.generation += 1;
                    false
                }
                None => {
                    registers.workers += 1;
                    registers.slots.insert(
                        redline_id.to_string(),
                        Slot {
                            record: DecisionRecord::queued(redline_id, decision),
                            generation: 0,
                        },
                    );
                    true
                }
            }
        };
        if spawn {
            tokio::spawn(deliver(self.inner.clone(), redline_id.to_string()));
        }
    }

    /// Move every failed decision back into delivery.
    pub fn redeliver_failed(&self) {
        let failed: Vec<DecisionRecord> = {
            let mut registers = self.inner.lock();
            registers.failed.drain().map(|(_, record)| record).collect()
        };
        if failed.is_empty() || self.inner.cancel.is_cancelled() {
            return;
        }
        info!(count = failed.len(), "redelivering failed decisions");
        for record in failed {
            self.enqueue(&record.redline_id, record.decision);
        }
    }

    /// Redeliver failed decisions and wait until nothing is in flight.
    pub async fn flush(&self) {
        self.redeliver_failed();
        self.wait_idle().await;
    }

    /// Wait until no decision is queued or in flight (or the queue is shut down).
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.lock().workers == 0 {
                return;
            }
            tokio::select! {
                _ = notified => {}
                _ = self.inner.cancel.cancelled() => return,
            }
        }
    }

    /// Delivery status of a redline's latest decision; `None` once confirmed
    /// or if nothing was ever submitted.
    pub fn status(&self, redline_id: &str) -> Option<RecordStatus> {
        let registers = self.inner.lock();
        registers
            .slots
            .get(redline_id)
            .map(|slot| slot.record.status)
            .or_else(|| registers.failed.get(redline_id).map(|r| r.status))
    }

    /// Redlines whose decisions exhausted their retries.
    pub fn failed_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.lock().failed.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock().slots.len()
    }
}

enum Outcome {
    Confirmed(DecisionRecord),
    Failed(DecisionRecord, ApiError),
}

/// Counts a running worker; wakes idle waiters when it exits.
struct WorkerGuard(Arc<QueueInner>);

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        let mut registers = self.0.lock();
        registers.workers = registers.workers.saturating_sub(1);
        drop(registers);
        self.0.idle.notify_waiters();
    }
}

/// Worker owning delivery for one redline until its slot empties.
async fn deliver(inner: Arc<QueueInner>, redline_id: String) {
    let _worker = WorkerGuard(inner.clone());
    let outcome = loop {
        let (record, generation) = {
            let mut registers = inner.lock();
            let Some(slot) = registers.slots.get_mut(&redline_id) else {
                return;
            };
            slot.record.status = RecordStatus::Inflight;
            slot.record.attempt_count += 1;
            (slot.record.clone(), slot.generation)
        };

        if inner.cancel.is_cancelled() {
            release(&inner, &redline_id);
            return;
        }

        let entry = DecisionEntry {
            redline_id: redline_id.clone(),
            decision: record.decision,
        };
        let result = match tokio::time::timeout(
            inner.config.request_timeout,
            inner.api.submit_decisions(&inner.job_id, std::slice::from_ref(&entry)),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ApiError::Timeout(inner.config.request_timeout)),
        };

        if inner.cancel.is_cancelled() {
            debug!(redline_id, "queue shut down; discarding confirmation result");
            release(&inner, &redline_id);
            return;
        }

        let superseded = {
            let mut registers = inner.lock();
            let current = registers.slots.get(&redline_id).map(|s| s.generation);
            if current == Some(generation) {
                // Final outcome for this slot unless we are about to retry.
                let retry = matches!(&result, Err(err)
                    if err.is_transient() && record.attempt_count < inner.config.submit_attempts);
                match registers.slots.get_mut(&redline_id) {
                    Some(slot) if retry => slot.record.status = RecordStatus::Queued,
                    _ => {
                        registers.slots.remove(&redline_id);
                    }
                }
                false
            } else {
                true
            }
        };
        if superseded {
            debug!(redline_id, "newer decision queued; sending it next");
            continue;
        }

        match result {
            Ok(()) => {
                let mut record = record;
                record.status = RecordStatus::Confirmed;
                break Outcome::Confirmed(record);
            }
            Err(err) if err.is_transient() && record.attempt_count < inner.config.submit_attempts => {
                let delay = inner.config.backoff(record.attempt_count);
                warn!(
                    redline_id,
                    attempt = record.attempt_count,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "decision confirmation failed; retrying"
                );
                tokio::select! {
                    _ = inner.cancel.cancelled() => {
                        release(&inner, &redline_id);
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(err) => {
                let mut record = record;
                record.status = RecordStatus::Failed;
                break Outcome::Failed(record, err);
            }
        }
    };

    match outcome {
        Outcome::Confirmed(record) => {
            info!(redline_id, decision = %record.decision, attempts = record.attempt_count, "decision confirmed");
            inner.shared.apply(|s| {
                s.notify(ReviewEvent::DecisionConfirmed {
                    redline_id: record.redline_id.clone(),
                    decision: record.decision,
                })
            });
        }
        Outcome::Failed(record, err) => fail(&inner, record, err).await,
    }
}

/// Drop a slot without an outcome (shutdown).
fn release(inner: &QueueInner, redline_id: &str) {
    inner.lock().slots.remove(redline_id);
}

async fn fail(inner: &QueueInner, record: DecisionRecord, err: ApiError) {
    if inner.config.failure_policy == FailurePolicy::Verify && server_holds(inner, &record).await {
        info!(
            redline_id = %record.redline_id,
            decision = %record.decision,
            "server already holds decision; treating as confirmed"
        );
        inner.shared.apply(|s| {
            s.notify(ReviewEvent::DecisionConfirmed {
                redline_id: record.redline_id.clone(),
                decision: record.decision,
            })
        });
        return;
    }

    let reason = err.to_string();
    warn!(
        redline_id = %record.redline_id,
        decision = %record.decision,
        attempts = record.attempt_count,
        error = %reason,
        "decision not confirmed; keeping local decision"
    );
    {
        let mut registers = inner.lock();
        // A newer submission for this redline supersedes the failure.
        if !registers.slots.contains_key(&record.redline_id) {
            registers
                .failed
                .insert(record.redline_id.clone(), record.clone());
        }
    }
    let failure = ReviewError::SubmissionFailure {
        redline_id: record.redline_id.clone(),
        decision: record.decision,
        attempts: record.attempt_count,
        reason,
    };
    inner.shared.apply(|s| {
        s.notify(ReviewEvent::SubmissionFailed {
            redline_id: record.redline_id.clone(),
            decision: record.decision,
            attempts: record.attempt_count,
            reason: failure.to_string(),
        })
    });
}

/// One status pull to check whether the server already has `record`.
async fn server_holds(inner: &QueueInner, record: &DecisionRecord) -> bool {
    let pulled = tokio::time::timeout(
        inner.config.request_timeout,
        inner.api.fetch_status(&inner.job_id),
    )
    .await;
    match pulled {
        Ok(Ok(snapshot)) => snapshot
            .redlines
            .iter()
            .any(|r| r.id == record.redline_id && r.decision == record.decision),
        Ok(Err(err)) => {
            warn!(redline_id = %record.redline_id, error = %err, "verification pull failed");
            false
        }
        Err(_) => {
            warn!(redline_id = %record.redline_id, "verification pull timed out");
            false
        }
    }
}

async fn periodic_flush(queue: DecisionQueue, interval: std::time::Duration) {
    loop {
        tokio::select! {
            _ = queue.inner.cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => queue.redeliver_failed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{FakeJobApi, snapshot_with};
    use crate::state::SyncState;
    use redline_core::JobStatus;
    use std::time::Duration;
    use tokio::sync::broadcast;

    struct Harness {
        api: Arc<FakeJobApi>,
        shared: Arc<Shared>,
        queue: DecisionQueue,
        cancel: CancellationToken,
    }

    fn harness(config: SyncConfig) -> Harness {
        let api = Arc::new(FakeJobApi::new());
        api.set_status(snapshot_with("job-1", JobStatus::Complete, 3));
        let shared = Arc::new(Shared::new("job-1", 64));
        shared
            .apply(|s| s.settle(snapshot_with("job-1", JobStatus::Complete, 3)))
            .unwrap();
        shared.apply(|s| s.set_sync_state(SyncState::Settled));
        let cancel = CancellationToken::new();
        let queue = DecisionQueue::new(
            api.clone(),
            shared.clone(),
            "job-1".into(),
            config,
            cancel.clone(),
        );
        Harness {
            api,
            shared,
            queue,
            cancel,
        }
    }

    fn local_decision(h: &Harness, id: &str) -> Decision {
        h.shared
            .read(|s| s.store.get(id).map(|r| r.decision))
            .unwrap()
    }

    fn drain(rx: &mut broadcast::Receiver<ReviewEvent>) -> Vec<ReviewEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn unknown_redline_is_rejected_untouched() {
        let h = harness(SyncConfig::default());
        let before = h.shared.read(|s| s.store.to_vec());
        let err = h.queue.submit("unknown-id", Decision::Accepted).unwrap_err();
        assert!(matches!(err, ReviewError::NotFound { ref redline_id } if redline_id == "unknown-id"));
        assert_eq!(h.shared.read(|s| s.store.to_vec()), before);
        h.queue.wait_idle().await;
        assert!(h.api.decision_posts().is_empty());
    }

    #[tokio::test]
    async fn pending_is_not_a_verdict() {
        let h = harness(SyncConfig::default());
        let err = h.queue.submit("r-1", Decision::Pending).unwrap_err();
        assert!(matches!(err, ReviewError::InvalidDecision(_)));
        assert_eq!(local_decision(&h, "r-1"), Decision::Pending);
        assert_eq!(h.queue.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn applies_locally_before_confirmation() {
        let h = harness(SyncConfig::default());
        h.api.delay_decisions("r-1", Duration::from_secs(1));

        let previous = h.queue.submit("r-1", Decision::Accepted).unwrap();
        assert_eq!(previous, Decision::Pending);
        assert_eq!(local_decision(&h, "r-1"), Decision::Accepted);
        assert_eq!(h.api.server_decision("r-1"), None);

        h.queue.wait_idle().await;
        assert_eq!(h.api.server_decision("r-1"), Some(Decision::Accepted));
        assert_eq!(h.queue.status("r-1"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn identical_submissions_coalesce() {
        let h = harness(SyncConfig::default());
        h.api.delay_decisions("r-2", Duration::from_millis(500));

        h.queue.submit("r-2", Decision::Rejected).unwrap();
        let after_first = h.shared.read(|s| s.store.to_vec());
        h.queue.submit("r-2", Decision::Rejected).unwrap();
        assert_eq!(h.shared.read(|s| s.store.to_vec()), after_first);

        h.queue.wait_idle().await;
        assert_eq!(h.api.decision_posts().len(), 1);
        assert_eq!(h.api.max_in_flight("r-2"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn latest_decision_wins() {
        let h = harness(SyncConfig::default());
        h.api.delay_decisions("r-1", Duration::from_millis(200));
        let mut rx = h.shared.subscribe();

        h.queue.submit("r-1", Decision::Accepted).unwrap();
        // Let the first request reach the wire, then change our mind.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.queue.status("r-1"), Some(RecordStatus::Inflight));
        h.queue.submit("r-1", Decision::Rejected).unwrap();

        h.queue.wait_idle().await;
        let posts = h.api.decision_posts();
        assert_eq!(posts.len(), 2);
        assert_eq!(posts[1].decision, Decision::Rejected);
        assert_eq!(h.api.server_decision("r-1"), Some(Decision::Rejected));
        assert_eq!(local_decision(&h, "r-1"), Decision::Rejected);
        assert_eq!(h.api.max_in_flight("r-1"), 1);

        let confirmed: Vec<Decision> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                ReviewEvent::DecisionConfirmed { decision, .. } => Some(decision),
                ReviewEvent::SubmissionFailed { .. } => panic!("superseded submission reported as failed"),
                _ => None,
            })
            .collect();
        assert_eq!(confirmed, vec![Decision::Rejected]);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let h = harness(SyncConfig::default());
        h.api.fail_decisions("r-1", 2);

        h.queue.submit("r-1", Decision::Accepted).unwrap();
        h.queue.wait_idle().await;

        assert_eq!(h.api.decision_posts().len(), 3);
        assert_eq!(h.api.server_decision("r-1"), Some(Decision::Accepted));
        assert!(h.queue.failed_ids().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_keep_local_decision() {
        let h = harness(SyncConfig::default());
        h.api.fail_decisions("r-3", 3);
        let mut rx = h.shared.subscribe();

        h.queue.submit("r-3", Decision::Rejected).unwrap();
        h.queue.wait_idle().await;

        assert_eq!(h.api.decision_posts().len(), 3);
        assert_eq!(local_decision(&h, "r-3"), Decision::Rejected);
        assert_eq!(h.queue.failed_ids(), vec!["r-3".to_string()]);
        assert_eq!(h.queue.status("r-3"), Some(RecordStatus::Failed));

        let failures: Vec<u32> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                ReviewEvent::SubmissionFailed { attempts, .. } => Some(attempts),
                _ => None,
            })
            .collect();
        assert_eq!(failures, vec![3]);

        // The backend has recovered; a flush delivers it.
        h.queue.flush().await;
        assert!(h.queue.failed_ids().is_empty());
        assert_eq!(h.api.server_decision("r-3"), Some(Decision::Rejected));
    }

    #[tokio::test(start_paused = true)]
    async fn next_submission_redelivers_failures() {
        let h = harness(SyncConfig::default());
        h.api.fail_decisions("r-1", 3);

        h.queue.submit("r-1", Decision::Accepted).unwrap();
        h.queue.wait_idle().await;
        assert_eq!(h.queue.failed_ids(), vec!["r-1".to_string()]);

        h.queue.submit("r-2", Decision::Accepted).unwrap();
        h.queue.wait_idle().await;
        assert!(h.queue.failed_ids().is_empty());
        assert_eq!(h.api.server_decision("r-1"), Some(Decision::Accepted));
        assert_eq!(h.api.server_decision("r-2"), Some(Decision::Accepted));
    }

    #[tokio::test(start_paused = true)]
    async fn not_found_is_not_retried() {
        let h = harness(SyncConfig::default());
        h.api.fail_decisions_with("r-1", 1, 404);

        h.queue.submit("r-1", Decision::Accepted).unwrap();
        h.queue.wait_idle().await;

        assert_eq!(h.api.decision_posts().len(), 1);
        assert_eq!(h.queue.failed_ids(), vec!["r-1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_confirmation_counts_as_failed_attempt() {
        let h = harness(SyncConfig {
            request_timeout: Duration::from_secs(1),
            submit_attempts: 2,
            ..Default::default()
        });
        h.api.delay_decisions("r-1", Duration::from_secs(30));

        h.queue.submit("r-1", Decision::Accepted).unwrap();
        h.queue.wait_idle().await;

        assert_eq!(h.api.decision_posts().len(), 2);
        assert_eq!(h.queue.failed_ids(), vec!["r-1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_order_confirmations() {
        let h = harness(SyncConfig::default());
        h.api.delay_decisions("r-1", Duration::from_millis(300));

        h.queue.submit("r-1", Decision::Accepted).unwrap();
        h.queue.submit("r-2", Decision::Rejected).unwrap();
        h.queue.wait_idle().await;

        let order: Vec<String> = h
            .api
            .confirmations()
            .into_iter()
            .map(|e| e.redline_id)
            .collect();
        assert_eq!(order, vec!["r-2".to_string(), "r-1".to_string()]);
        assert_eq!(local_decision(&h, "r-1"), Decision::Accepted);
        assert_eq!(local_decision(&h, "r-2"), Decision::Rejected);
    }

    #[tokio::test(start_paused = true)]
    async fn verify_policy_detects_delivered_decision() {
        let h = harness(SyncConfig {
            failure_policy: FailurePolicy::Verify,
            ..Default::default()
        });
        h.queue.submit("r-1", Decision::Accepted).unwrap();
        h.queue.wait_idle().await;

        h.api.fail_decisions("r-1", 6);
        h.queue.submit("r-1", Decision::Rejected).unwrap();
        h.queue.wait_idle().await;
        // Server still has the earlier acceptance.
        assert_eq!(h.queue.failed_ids(), vec!["r-1".to_string()]);

        h.queue.submit("r-1", Decision::Accepted).unwrap();
        h.queue.wait_idle().await;
        assert!(h.queue.failed_ids().is_empty());
        assert_eq!(h.api.decision_posts().len(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_pending_retries() {
        let h = harness(SyncConfig::default());
        h.api.fail_decisions("r-1", 10);

        h.queue.submit("r-1", Decision::Accepted).unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(h.api.decision_posts().len(), 1);

        h.cancel.cancel();
        tokio::time::sleep(Duration::from_secs(30)).await;
        h.queue.wait_idle().await;
        assert_eq!(h.api.decision_posts().len(), 1);
        assert_eq!(local_decision(&h, "r-1"), Decision::Accepted);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_flush_redelivers() {
        let h = harness(SyncConfig {
            flush_interval: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        h.api.fail_decisions("r-2", 3);

        h.queue.submit("r-2", Decision::Accepted).unwrap();
        h.queue.wait_idle().await;
        assert_eq!(h.queue.failed_ids(), vec!["r-2".to_string()]);

        tokio::time::sleep(Duration::from_secs(6)).await;
        h.queue.wait_idle().await;
        assert!(h.queue.failed_ids().is_empty());
        assert_eq!(h.api.server_decision("r-2"), Some(Decision::Accepted));
    }
}
