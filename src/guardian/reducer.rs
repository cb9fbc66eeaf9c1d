//! Latest-decision reduction.
//!
//! The decision log is append-only and arrives in no particular order.
//! Views want one representative per tenant: the newest one.

use std::collections::HashSet;

use super::Decision;

/// Sorts newest first. `sort_by` is stable, so equal timestamps keep their
/// input order and the first of them wins below.
fn newest_first(decisions: &[Decision]) -> Vec<&Decision> {
    let mut sorted: Vec<&Decision> = decisions.iter().collect();
    sorted.sort_by(|a, b| b.timestamp.at.cmp(&a.timestamp.at));
    sorted
}

/// One decision per tenant, the newest, ordered newest first.
pub fn latest_per_tenant(decisions: &[Decision]) -> Vec<Decision> {
    let mut seen: HashSet<&str> = HashSet::new();
    newest_first(decisions)
        .into_iter()
        .filter(|d| seen.insert(d.tenant.as_str()))
        .cloned()
        .collect()
}

/// Newest decision recorded for `tenant`, if any.
pub fn latest_for<'a>(decisions: &'a [Decision], tenant: &str) -> Option<&'a Decision> {
    newest_first(decisions)
        .into_iter()
        .find(|d| d.tenant == tenant)
}

/// Full history of `tenant`, newest first.
pub fn history_for<'a>(decisions: &'a [Decision], tenant: &str) -> Vec<&'a Decision> {
    newest_first(decisions)
        .into_iter()
        .filter(|d| d.tenant == tenant)
        .collect()
}
