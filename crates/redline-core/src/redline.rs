//! Redline records and the reviewer decisions attached to them.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How strongly a redline departs from the reviewer's playbook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[serde(alias = "Critical")]
    Critical,
    #[serde(alias = "High")]
    High,
    #[serde(alias = "Moderate")]
    Moderate,
    #[serde(alias = "Low")]
    Low,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Moderate => "moderate",
            Severity::Low => "low",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reviewer verdict on a redline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    #[default]
    #[serde(alias = "Pending")]
    Pending,
    #[serde(alias = "Accepted", alias = "accept")]
    Accepted,
    #[serde(alias = "Rejected", alias = "reject")]
    Rejected,
}

impl Decision {
    pub fn is_pending(self) -> bool {
        self == Decision::Pending
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Pending => "pending",
            Decision::Accepted => "accepted",
            Decision::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognised decision {0:?} (expected accept or reject)")]
pub struct ParseDecisionError(pub String);

impl FromStr for Decision {
    type Err = ParseDecisionError;

    /// Parses reviewer input. `pending` parses so callers can report it as an
    /// invalid submission rather than a typo.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "accept" | "accepted" => Ok(Decision::Accepted),
            "reject" | "rejected" => Ok(Decision::Rejected),
            "pending" => Ok(Decision::Pending),
            _ => Err(ParseDecisionError(s.to_string())),
        }
    }
}

/// Byte offsets `[start, end)` into the source document.
///
/// Serialized as a two-element array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "(usize, usize)", into = "(usize, usize)")]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn is_valid(&self) -> bool {
        self.start <= self.end
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<(usize, usize)> for Span {
    fn from((start, end): (usize, usize)) -> Self {
        Self { start, end }
    }
}

impl From<Span> for (usize, usize) {
    fn from(span: Span) -> Self {
        (span.start, span.end)
    }
}

/// The playbook rule a redline was raised against.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChecklistRule {
    pub title: String,
    #[serde(default)]
    pub requirement: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub why: String,
    #[serde(default)]
    pub standard_language: String,
}

/// A single proposed change to the contract plus its justification.
///
/// Everything except `decision` is fixed once the job completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Redline {
    pub id: String,
    pub clause_type: String,
    pub span: Span,
    pub original_text: String,
    pub revised_text: String,
    pub severity: Severity,
    pub confidence: f32,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub explanation: String,
    #[serde(default)]
    pub checklist_rule: ChecklistRule,
    #[serde(default)]
    pub decision: Decision,
}

/// One entry of a `POST /jobs/{id}/decisions` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionEntry {
    pub redline_id: String,
    pub decision: Decision,
}

/// Request body for `POST /jobs/{id}/decisions`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DecisionBatch {
    pub decisions: Vec<DecisionEntry>,
}
