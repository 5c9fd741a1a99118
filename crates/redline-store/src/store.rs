//! Ordered, id-keyed redline collection for a single job.

use std::collections::HashMap;

use redline_core::{Decision, Redline};
use serde::Serialize;
use tracing::{debug, info};

use crate::StoreError;

/// Tally of reviewer decisions across the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct DecisionCounts {
    pub accepted: usize,
    pub rejected: usize,
    pub pending: usize,
}

impl DecisionCounts {
    pub fn total(&self) -> usize {
        self.accepted + self.rejected + self.pending
    }

    pub fn decided(&self) -> usize {
        self.accepted + self.rejected
    }
}

/// Redlines in server order, indexed by id.
///
/// Redlines are never removed individually: the collection only changes
/// shape through [`replace_all`](Self::replace_all). Individual records only
/// change through [`set_decision`](Self::set_decision).
#[derive(Debug, Clone, Default)]
pub struct RedlineStore {
    redlines: Vec<Redline>,
    index: HashMap<String, usize>,
}

impl RedlineStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Swap in a complete collection.
    ///
    /// Decisions carried by the snapshot win over anything set locally. The
    /// snapshot is validated first; on error the store is left untouched.
    pub fn replace_all(&mut self, redlines: Vec<Redline>) -> Result<(), StoreError> {
        let mut index = HashMap::with_capacity(redlines.len());
        for (pos, redline) in redlines.iter().enumerate() {
            if !redline.span.is_valid() {
                return Err(StoreError::InvalidSpan {
                    id: redline.id.clone(),
                    start: redline.span.start,
                    end: redline.span.end,
                });
            }
            if index.insert(redline.id.clone(), pos).is_some() {
                return Err(StoreError::DuplicateId(redline.id.clone()));
            }
        }

        self.redlines = redlines;
        self.index = index;
        info!(count = self.redlines.len(), "replaced redline collection");
        Ok(())
    }

    /// Set a redline's decision, returning the one it replaced.
    pub fn set_decision(&mut self, id: &str, decision: Decision) -> Result<Decision, StoreError> {
        let pos = *self
            .index
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let redline = &mut self.redlines[pos];
        let previous = std::mem::replace(&mut redline.decision, decision);
        debug!(redline_id = id, %previous, %decision, "decision set");
        Ok(previous)
    }

    pub fn counts(&self) -> DecisionCounts {
        let mut counts = DecisionCounts::default();
        for redline in &self.redlines {
            match redline.decision {
                Decision::Accepted => counts.accepted += 1,
                Decision::Rejected => counts.rejected += 1,
                Decision::Pending => counts.pending += 1,
            }
        }
        counts
    }

    pub fn get(&self, id: &str) -> Option<&Redline> {
        self.index.get(id).map(|&pos| &self.redlines[pos])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Display position of a redline.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// The next undecided redline after `after` in display order, wrapping
    /// around. With `after = None` the search starts at the beginning.
    pub fn next_pending(&self, after: Option<&str>) -> Option<&Redline> {
        let n = self.redlines.len();
        if n == 0 {
            return None;
        }
        let start = match after.and_then(|id| self.position(id)) {
            Some(pos) => pos + 1,
            None => 0,
        };
        (0..n)
            .map(|offset| &self.redlines[(start + offset) % n])
            .find(|r| r.decision.is_pending())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Redline> {
        self.redlines.iter()
    }

    pub fn as_slice(&self) -> &[Redline] {
        &self.redlines
    }

    pub fn to_vec(&self) -> Vec<Redline> {
        self.redlines.clone()
    }

    pub fn len(&self) -> usize {
        self.redlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.redlines.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use redline_core::{ChecklistRule, Severity, Span};

    pub(crate) fn redline(id: &str) -> Redline {
        Redline {
            id: id.into(),
            clause_type: "governing_law".into(),
            span: Span::new(0, 10),
            original_text: "laws of Delaware".into(),
            revised_text: "laws of England and Wales".into(),
            severity: Severity::Moderate,
            confidence: 0.7,
            source: "playbook".into(),
            explanation: "Governing law should match the customer's seat.".into(),
            checklist_rule: ChecklistRule {
                title: "Governing law".into(),
                ..Default::default()
            },
            decision: Decision::Pending,
        }
    }

    fn store_of(ids: &[&str]) -> RedlineStore {
        let mut store = RedlineStore::new();
        store
            .replace_all(ids.iter().map(|id| redline(id)).collect())
            .unwrap();
        store
    }

    #[test]
    fn replace_all_preserves_server_order() {
        let store = store_of(&["c", "a", "b"]);
        let ids: Vec<&str> = store.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
        assert_eq!(store.position("a"), Some(1));
    }

    #[test]
    fn set_decision_returns_previous() {
        let mut store = store_of(&["a"]);
        assert_eq!(store.set_decision("a", Decision::Accepted), Ok(Decision::Pending));
        assert_eq!(store.set_decision("a", Decision::Rejected), Ok(Decision::Accepted));
        assert_eq!(store.get("a").unwrap().decision, Decision::Rejected);
    }

    #[test]
    fn set_decision_unknown_id() {
        let mut store = store_of(&["a"]);
        let before = store.to_vec();
        assert_eq!(
            store.set_decision("nope", Decision::Accepted),
            Err(StoreError::NotFound("nope".into()))
        );
        assert_eq!(store.to_vec(), before);
    }

    #[test]
    fn counts_cover_every_redline() {
        let mut store = store_of(&["a", "b", "c", "d"]);
        store.set_decision("a", Decision::Accepted).unwrap();
        store.set_decision("b", Decision::Rejected).unwrap();
        store.set_decision("c", Decision::Rejected).unwrap();
        let counts = store.counts();
        assert_eq!(
            counts,
            DecisionCounts {
                accepted: 1,
                rejected: 2,
                pending: 1
            }
        );
        assert_eq!(counts.total(), store.len());
    }

    #[test]
    fn replace_all_takes_server_decisions() {
        let mut store = store_of(&["a", "b"]);
        store.set_decision("a", Decision::Accepted).unwrap();

        let mut incoming = vec![redline("a"), redline("b")];
        incoming[1].decision = Decision::Rejected;
        store.replace_all(incoming).unwrap();

        assert_eq!(store.get("a").unwrap().decision, Decision::Pending);
        assert_eq!(store.get("b").unwrap().decision, Decision::Rejected);
    }

    #[test]
    fn replace_all_rejects_duplicates_without_mutating() {
        let mut store = store_of(&["a"]);
        let err = store
            .replace_all(vec![redline("x"), redline("x")])
            .unwrap_err();
        assert_eq!(err, StoreError::DuplicateId("x".into()));
        assert!(store.contains("a"));
        assert!(!store.contains("x"));
    }

    #[test]
    fn replace_all_rejects_inverted_span() {
        let mut store = RedlineStore::new();
        let mut bad = redline("a");
        bad.span = Span::new(9, 3);
        assert!(matches!(
            store.replace_all(vec![bad]),
            Err(StoreError::InvalidSpan { start: 9, end: 3, .. })
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn next_pending_wraps_around() {
        let mut store = store_of(&["a", "b", "c"]);
        store.set_decision("c", Decision::Accepted).unwrap();
        assert_eq!(store.next_pending(None).unwrap().id, "a");
        assert_eq!(store.next_pending(Some("b")).unwrap().id, "a");
        store.set_decision("a", Decision::Accepted).unwrap();
        assert_eq!(store.next_pending(Some("b")).unwrap().id, "b");
        store.set_decision("b", Decision::Rejected).unwrap();
        assert!(store.next_pending(None).is_none());
    }
}
