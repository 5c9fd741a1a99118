//! Terminal rendering for jobs and redlines.
//!
//! Redlines print as vertical cards grouped into sections; collections print
//! as a one-line-per-redline summary followed by decision counts.

use redline_core::{Job, JobStatus, Redline};
use redline_store::{DecisionCounts, ExportReadiness};

const MAX_LIST_ITEMS: usize = 50;
const EXCERPT_CHARS: usize = 60;

// ── Public API ──

/// Print a single redline as a vertical card.
pub fn print_redline_card(redline: &Redline) {
    println!("=== {} ===", redline.id);
    println!("{} [{}]", redline.clause_type, redline.severity);
    println!();

    print_section(
        "Review",
        &[
            ("decision", redline.decision.to_string()),
            ("severity", redline.severity.to_string()),
            ("confidence", format!("{:.0}%", redline.confidence * 100.0)),
            ("source", redline.source.clone()),
        ],
    );
    print_section(
        "Location",
        &[
            ("span", format!("{}..{}", redline.span.start, redline.span.end)),
            ("length", redline.span.len().to_string()),
        ],
    );
    print_section(
        "Change",
        &[
            ("original", redline.original_text.clone()),
            ("revised", redline.revised_text.clone()),
        ],
    );
    print_section("Rationale", &[("explanation", redline.explanation.clone())]);

    let rule = &redline.checklist_rule;
    print_section(
        "Checklist Rule",
        &[
            ("title", rule.title.clone()),
            ("requirement", rule.requirement.clone()),
            ("description", rule.description.clone()),
            ("why", rule.why.clone()),
            ("standard_language", rule.standard_language.clone()),
        ],
    );
}

/// Print one line per redline in document order.
pub fn print_redline_summary(redlines: &[Redline]) {
    if redlines.is_empty() {
        println!("No redlines proposed.");
        return;
    }

    println!("Redlines ({}):", redlines.len());
    for redline in redlines.iter().take(MAX_LIST_ITEMS) {
        println!(
            "  {:<12} {:<9} {:<9} {:<28} {}",
            redline.id,
            redline.severity.as_str(),
            redline.decision.as_str(),
            excerpt(&redline.clause_type, 28),
            excerpt(&redline.revised_text, EXCERPT_CHARS),
        );
    }
    if redlines.len() > MAX_LIST_ITEMS {
        println!("  ... and {} more", redlines.len() - MAX_LIST_ITEMS);
    }
    println!();
}

pub fn print_counts(counts: &DecisionCounts, readiness: &ExportReadiness) {
    println!("Decisions");
    println!("  {:<26} {}", "accepted", counts.accepted);
    println!("  {:<26} {}", "rejected", counts.rejected);
    println!("  {:<26} {}", "pending", counts.pending);
    println!(
        "  {:<26} {}",
        "export",
        if readiness.can_export {
            "ready".to_string()
        } else {
            format!("blocked ({} pending)", readiness.pending)
        }
    );
    println!();
}

/// One status line, e.g. `processing  42%  contract.docx`.
pub fn status_line(job: &Job) -> String {
    let mut line = format!(
        "{:<10} {:>3.0}%",
        job.status.as_str(),
        job.progress * 100.0
    );
    if !job.filename.is_empty() {
        line.push_str("  ");
        line.push_str(&job.filename);
    }
    if job.status == JobStatus::Complete {
        line.push_str(&format!("  ({} redlines)", job.total_redlines));
    }
    if let Some(error) = &job.error {
        line.push_str(&format!("  error: {error}"));
    }
    line
}

// ── Section rendering ──

fn print_section(header: &str, fields: &[(&str, String)]) {
    if fields.iter().all(|(_, value)| value.is_empty()) {
        return;
    }

    println!("{header}");
    for (name, value) in fields {
        if value.is_empty() {
            continue;
        }
        println!("  {:<26} {}", name, value);
    }
    println!();
}

/// Truncate to `max` characters, marking the cut with `...`.
fn excerpt(text: &str, max: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max {
        return text.to_string();
    }
    let kept: String = text.chars().take(max.saturating_sub(3)).collect();
    format!("{kept}...")
}
