//! Shared job, redline and decision types for the redline review engine.

pub mod job;
pub mod redline;

pub use job::{Job, JobSnapshot, JobStatus, StatusEvent, clamp_progress};
pub use redline::{
    ChecklistRule, Decision, DecisionBatch, DecisionEntry, ParseDecisionError, Redline, Severity,
    Span,
};
