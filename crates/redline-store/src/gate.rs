//! Export gate: whether the final document may be downloaded.

use redline_core::JobStatus;
use serde::Serialize;

use crate::DecisionCounts;

/// Outcome of evaluating the export gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExportReadiness {
    pub can_export: bool,
    /// Redlines still awaiting a decision.
    pub pending: usize,
}

/// Export is allowed iff the job is `Complete` and nothing is pending.
pub fn evaluate(status: JobStatus, counts: &DecisionCounts) -> ExportReadiness {
    ExportReadiness {
        can_export: status == JobStatus::Complete && counts.pending == 0,
        pending: counts.pending,
    }
}
