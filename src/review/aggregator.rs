//! Finding aggregation.
//!
//! Flattens per-task finding lists into one sequence whose order depends
//! only on the findings themselves, never on which task finished first.

use std::cmp::Ordering;

use super::traits::Finding;

/// Canonical report order: severity descending, then path, start line and
/// category ascending.
pub fn report_order(a: &Finding, b: &Finding) -> Ordering {
    b.severity
        .cmp(&a.severity)
        .then_with(|| a.location.path.cmp(&b.location.path))
        .then_with(|| a.location.start_line.cmp(&b.location.start_line))
        .then_with(|| a.category.cmp(&b.category))
}

/// Merge task results given in task order. Ties keep insertion order.
pub fn merge(results: &[Vec<Finding>]) -> Vec<Finding> {
    let mut merged: Vec<Finding> = results.iter().flatten().cloned().collect();
    merged.sort_by(report_order);
    merged
}

/// Re-apply the canonical order to an already merged sequence.
pub fn reorder(mut findings: Vec<Finding>) -> Vec<Finding> {
    findings.sort_by(report_order);
    findings
}
