//! Merging concerns from several reviewers into one ranked list.

use crate::review::types::{AgentOutput, Concern, Severity};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Combined view over a set of reviewer outputs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergedReview {
    /// Deduplicated concerns, most severe first, then by category.
    pub concerns: Vec<Concern>,
    pub by_category: BTreeMap<String, Vec<Concern>>,
    pub by_severity: BTreeMap<Severity, Vec<Concern>>,
    pub all_approved: bool,
    /// Agent ids of outputs that did not approve.
    pub dissenting: Vec<String>,
    pub has_blockers: bool,
    pub approvals: usize,
    pub total: usize,
    pub summary: String,
}

impl MergedReview {
    pub fn approval_ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.approvals as f64 / self.total as f64
        }
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.by_severity.get(&severity).map_or(0, Vec::len)
    }
}

/// Merge reviewer outputs.
///
/// Concerns are deduplicated by normalized description, keeping the more
/// severe of each duplicate. An empty set of outputs is never "all approved".
pub fn merge_agent_outputs(outputs: &[AgentOutput]) -> MergedReview {
    let mut concerns: Vec<Concern> = Vec::new();
    let mut seen: HashMap<String, usize> = HashMap::new();

    for concern in outputs.iter().flat_map(|o| o.concerns.iter()) {
        let key = concern.normalized_description();
        match seen.get(&key) {
            Some(&idx) => {
                if concern.severity < concerns[idx].severity {
                    concerns[idx] = concern.clone();
                }
            }
            None => {
                seen.insert(key, concerns.len());
                concerns.push(concern.clone());
            }
        }
    }

    concerns.sort_by(|a, b| {
        a.severity
            .cmp(&b.severity)
            .then_with(|| a.category.cmp(&b.category))
    });

    let mut by_category: BTreeMap<String, Vec<Concern>> = BTreeMap::new();
    let mut by_severity: BTreeMap<Severity, Vec<Concern>> = BTreeMap::new();
    for concern in &concerns {
        by_category
            .entry(concern.category.clone())
            .or_default()
            .push(concern.clone());
        by_severity
            .entry(concern.severity)
            .or_default()
            .push(concern.clone());
    }

    let dissenting: Vec<String> = outputs
        .iter()
        .filter(|o| !o.approved)
        .map(|o| o.agent_id.clone())
        .collect();
    let total = outputs.len();
    let approvals = total - dissenting.len();
    let all_approved = total > 0 && dissenting.is_empty();
    let has_blockers = concerns.iter().any(|c| c.severity.is_blocker());

    let mut merged = MergedReview {
        concerns,
        by_category,
        by_severity,
        all_approved,
        dissenting,
        has_blockers,
        approvals,
        total,
        summary: String::new(),
    };
    merged.summary = summarize(&merged);
    merged
}

fn summarize(merged: &MergedReview) -> String {
    let mut summary = format!(
        "{}/{} reviewers approved ({:.0}%). {} concern{}: {} blocker{}, {} warning{}, {} suggestion{}.",
        merged.approvals,
        merged.total,
        merged.approval_ratio() * 100.0,
        merged.concerns.len(),
        plural(merged.concerns.len()),
        merged.count(Severity::Blocker),
        plural(merged.count(Severity::Blocker)),
        merged.count(Severity::Warning),
        plural(merged.count(Severity::Warning)),
        merged.count(Severity::Suggestion),
        plural(merged.count(Severity::Suggestion)),
    );
    if !merged.dissenting.is_empty() {
        summary.push_str(&format!(" Dissenting: {}.", merged.dissenting.join(", ")));
    }
    summary
}

fn plural(n: usize) -> &'static str {
    if n == 1 { "" } else { "s" }
}

/// Concerns raised by at least two distinct outputs, at their most severe
/// occurrence, most severe first.
pub fn find_shared_concerns(outputs: &[AgentOutput]) -> Vec<Concern> {
    // normalized description -> (first occurrence, raising outputs)
    let mut order: Vec<String> = Vec::new();
    let mut shared: HashMap<String, (Concern, HashSet<usize>)> = HashMap::new();

    for (idx, output) in outputs.iter().enumerate() {
        for concern in &output.concerns {
            let key = concern.normalized_description();
            let entry = shared.entry(key.clone()).or_insert_with(|| {
                order.push(key);
                (concern.clone(), HashSet::new())
            });
            entry.0.severity = entry.0.severity.most_severe(concern.severity);
            entry.1.insert(idx);
        }
    }

    let mut result: Vec<Concern> = order
        .into_iter()
        .filter_map(|key| shared.remove(&key))
        .filter(|(_, raised_by)| raised_by.len() >= 2)
        .map(|(concern, _)| concern)
        .collect();
    result.sort_by_key(|c| c.severity);
    result
}
