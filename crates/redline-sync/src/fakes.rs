//! In-memory [`JobApi`] for tests.
//!
//! Scripted event streams and status results, recorded decision posts, and
//! injectable failures and delays. Decisions the fake accepts are reflected
//! back in later status pulls, like the real backend.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redline_core::{
    ChecklistRule, Decision, DecisionEntry, Job, JobSnapshot, JobStatus, Redline, Severity, Span,
    StatusEvent,
};

use crate::ApiError;
use crate::api::{EventStream, JobApi};

enum Subscription {
    Finite(Vec<Result<StatusEvent, ApiError>>),
    Hanging(Vec<Result<StatusEvent, ApiError>>),
    Refused(ApiError),
}

#[derive(Default)]
struct FakeState {
    subscriptions: VecDeque<Subscription>,
    statuses: VecDeque<Result<JobSnapshot, ApiError>>,
    fallback_status: Option<JobSnapshot>,
    status_delay: Option<Duration>,
    decision_failures: HashMap<String, (u32, u16)>,
    decision_delays: HashMap<String, Duration>,
    posts: Vec<DecisionEntry>,
    confirmations: Vec<DecisionEntry>,
    server_decisions: HashMap<String, Decision>,
    in_flight: HashMap<String, usize>,
    max_in_flight: HashMap<String, usize>,
    download: Vec<u8>,
    status_calls: usize,
    subscribe_calls: usize,
    download_calls: usize,
}

#[derive(Default)]
pub struct FakeJobApi {
    state: Mutex<FakeState>,
    open_streams: Arc<AtomicUsize>,
}

impl FakeJobApi {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ── Scripting ──

    /// Queue a subscription that yields `items` and then closes.
    pub fn script_stream(&self, items: Vec<Result<StatusEvent, ApiError>>) {
        self.lock()
            .subscriptions
            .push_back(Subscription::Finite(items));
    }

    /// Queue a subscription that yields `items` and then stays open.
    pub fn script_hanging_stream(&self, items: Vec<Result<StatusEvent, ApiError>>) {
        self.lock()
            .subscriptions
            .push_back(Subscription::Hanging(items));
    }

    /// Queue a subscription attempt that fails outright.
    pub fn fail_subscription(&self, err: ApiError) {
        self.lock()
            .subscriptions
            .push_back(Subscription::Refused(err));
    }

    /// Snapshot returned once the one-shot status queue is empty.
    pub fn set_status(&self, snapshot: JobSnapshot) {
        self.lock().fallback_status = Some(snapshot);
    }

    pub fn push_status(&self, snapshot: JobSnapshot) {
        self.lock().statuses.push_back(Ok(snapshot));
    }

    pub fn push_status_error(&self, err: ApiError) {
        self.lock().statuses.push_back(Err(err));
    }

    pub fn delay_status(&self, delay: Duration) {
        self.lock().status_delay = Some(delay);
    }

    /// Fail the next `times` posts for `redline_id` with a 503.
    pub fn fail_decisions(&self, redline_id: &str, times: u32) {
        self.fail_decisions_with(redline_id, times, 503);
    }

    /// Fail the next `times` posts for `redline_id` with HTTP `status`
    /// (404 maps to [`ApiError::NotFound`]).
    pub fn fail_decisions_with(&self, redline_id: &str, times: u32, status: u16) {
        self.lock()
            .decision_failures
            .insert(redline_id.to_string(), (times, status));
    }

    pub fn delay_decisions(&self, redline_id: &str, delay: Duration) {
        self.lock()
            .decision_delays
            .insert(redline_id.to_string(), delay);
    }

    pub fn set_download(&self, bytes: Vec<u8>) {
        self.lock().download = bytes;
    }

    // ── Inspection ──

    /// Every decision post attempt, including failed ones.
    pub fn decision_posts(&self) -> Vec<DecisionEntry> {
        self.lock().posts.clone()
    }

    /// Successful decision posts in completion order.
    pub fn confirmations(&self) -> Vec<DecisionEntry> {
        self.lock().confirmations.clone()
    }

    pub fn server_decision(&self, redline_id: &str) -> Option<Decision> {
        self.lock().server_decisions.get(redline_id).copied()
    }

    /// Highest number of simultaneous posts seen for one redline.
    pub fn max_in_flight(&self, redline_id: &str) -> usize {
        self.lock()
            .max_in_flight
            .get(redline_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn status_calls(&self) -> usize {
        self.lock().status_calls
    }

    pub fn subscribe_calls(&self) -> usize {
        self.lock().subscribe_calls
    }

    pub fn download_calls(&self) -> usize {
        self.lock().download_calls
    }

    /// Subscriptions handed out and not yet dropped.
    pub fn open_streams(&self) -> usize {
        self.open_streams.load(Ordering::SeqCst)
    }

    fn track(&self, stream: EventStream) -> EventStream {
        struct OpenGuard(Arc<AtomicUsize>);
        impl Drop for OpenGuard {
            fn drop(&mut self) {
                self.0.fetch_sub(1, Ordering::SeqCst);
            }
        }

        self.open_streams.fetch_add(1, Ordering::SeqCst);
        let guard = OpenGuard(self.open_streams.clone());
        stream
            .map(move |item| {
                let _open = &guard;
                item
            })
            .boxed()
    }
}

#[async_trait]
impl JobApi for FakeJobApi {
    async fn fetch_status(&self, job_id: &str) -> Result<JobSnapshot, ApiError> {
        let delay = {
            let mut state = self.lock();
            state.status_calls += 1;
            state.status_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        let mut snapshot = match state.statuses.pop_front() {
            Some(result) => result?,
            None => state
                .fallback_status
                .clone()
                .ok_or_else(|| ApiError::NotFound(format!("job {job_id}")))?,
        };
        for redline in &mut snapshot.redlines {
            if let Some(&decision) = state.server_decisions.get(&redline.id) {
                redline.decision = decision;
            }
        }
        Ok(snapshot)
    }

    async fn subscribe_events(&self, _job_id: &str) -> Result<EventStream, ApiError> {
        let subscription = {
            let mut state = self.lock();
            state.subscribe_calls += 1;
            state.subscriptions.pop_front()
        };
        let stream = match subscription {
            Some(Subscription::Finite(items)) => futures::stream::iter(items).boxed(),
            Some(Subscription::Hanging(items)) => futures::stream::iter(items)
                .chain(futures::stream::pending())
                .boxed(),
            Some(Subscription::Refused(err)) => return Err(err),
            None => return Err(ApiError::Stream("no scripted subscription".into())),
        };
        Ok(self.track(stream))
    }

    async fn submit_decisions(
        &self,
        _job_id: &str,
        decisions: &[DecisionEntry],
    ) -> Result<(), ApiError> {
        let delay = {
            let mut state = self.lock();
            let mut delay = None;
            for entry in decisions {
                state.posts.push(entry.clone());
                let n = state.in_flight.entry(entry.redline_id.clone()).or_default();
                *n += 1;
                let n = *n;
                let max = state
                    .max_in_flight
                    .entry(entry.redline_id.clone())
                    .or_default();
                *max = (*max).max(n);
                delay = delay.max(state.decision_delays.get(&entry.redline_id).copied());
            }
            delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        let mut failure = None;
        for entry in decisions {
            if let Some(n) = state.in_flight.get_mut(&entry.redline_id) {
                *n = n.saturating_sub(1);
            }
            if let Some((remaining, status)) = state.decision_failures.get_mut(&entry.redline_id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    failure = Some(*status);
                }
            }
        }
        match failure {
            Some(404) => Err(ApiError::NotFound("redline".into())),
            Some(status) => Err(ApiError::Server {
                status,
                body: "injected failure".into(),
            }),
            None => {
                for entry in decisions {
                    state
                        .server_decisions
                        .insert(entry.redline_id.clone(), entry.decision);
                    state.confirmations.push(entry.clone());
                }
                Ok(())
            }
        }
    }

    async fn download_final(&self, _job_id: &str) -> Result<Vec<u8>, ApiError> {
        let mut state = self.lock();
        state.download_calls += 1;
        Ok(state.download.clone())
    }
}

// ── Fixtures ──

pub fn processing(progress: f64) -> StatusEvent {
    StatusEvent {
        status: JobStatus::Processing,
        progress,
        error: None,
    }
}

pub fn sample_redline(id: &str) -> Redline {
    Redline {
        id: id.to_string(),
        clause_type: "limitation_of_liability".into(),
        span: Span::new(100, 180),
        original_text: "Neither party's liability shall be limited.".into(),
        revised_text: "Each party's liability is capped at fees paid in the prior 12 months."
            .into(),
        severity: Severity::Critical,
        confidence: 0.88,
        source: "playbook".into(),
        explanation: "Unlimited liability is outside the approved position.".into(),
        checklist_rule: ChecklistRule {
            title: "Liability cap".into(),
            requirement: "Cap liability at 12 months of fees".into(),
            description: "Mutual cap on direct damages".into(),
            why: "Keeps exposure proportional to contract value".into(),
            standard_language: "Liability is capped at fees paid in the prior 12 months.".into(),
        },
        decision: Decision::Pending,
    }
}

/// Snapshot of `job_id` in `status` with redlines `r-1..=r-n`, all pending.
pub fn snapshot_with(job_id: &str, status: JobStatus, n: usize) -> JobSnapshot {
    let mut job = Job::new(job_id);
    job.status = status;
    job.progress = if status == JobStatus::Complete { 1.0 } else { 0.5 };
    job.filename = "master-services-agreement.docx".into();
    job.total_redlines = n;
    JobSnapshot {
        job,
        redlines: (1..=n).map(|i| sample_redline(&format!("r-{i}"))).collect(),
    }
}
