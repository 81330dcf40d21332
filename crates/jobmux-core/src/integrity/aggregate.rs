//! Aggregation strategies: combine per-platform record sets into the
//! job's final aggregated record set.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::signature;
use crate::adapter::JobRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationStrategy {
    MergeAll,
    DeduplicateSmart,
    PriorityBased,
    QualityWeighted,
    ConsensusBased,
    PlatformSpecific,
}

fn record_quality(record: &JobRecord) -> f64 {
    let mut score = 0.0;
    if !record.title.is_empty() {
        score += 1.0;
    }
    if !record.company.is_empty() {
        score += 1.0;
    }
    if !record.location.is_empty() {
        score += 1.0;
    }
    if record.date_posted.is_some() {
        score += 1.0;
    }
    if record.description.is_some() {
        score += 1.0;
    }
    if record.job_url.is_some() {
        score += 1.0;
    }
    score / 6.0
}

fn group_by_signature(records: &[JobRecord]) -> Vec<(String, Vec<&JobRecord>)> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<&JobRecord>> = HashMap::new();
    for record in records {
        let sig = signature(record);
        if !groups.contains_key(&sig) {
            order.push(sig.clone());
        }
        groups.entry(sig).or_default().push(record);
    }
    order
        .into_iter()
        .map(|sig| {
            let members = groups.remove(&sig).unwrap();
            (sig, members)
        })
        .collect()
}

/// Run the chosen aggregation strategy. Deterministic given a
/// deterministic input order, so running twice on the same input produces
/// byte-identical output (testable property 8).
pub fn aggregate(strategy: AggregationStrategy, records: &[JobRecord]) -> Vec<JobRecord> {
    match strategy {
        AggregationStrategy::MergeAll => records.to_vec(),
        AggregationStrategy::PlatformSpecific => records.to_vec(),
        AggregationStrategy::DeduplicateSmart => group_by_signature(records)
            .into_iter()
            .map(|(_, members)| {
                members
                    .into_iter()
                    .max_by(|a, b| record_quality(a).total_cmp(&record_quality(b)))
                    .cloned()
                    .expect("group is never empty")
            })
            .collect(),
        AggregationStrategy::PriorityBased => group_by_signature(records)
            .into_iter()
            .map(|(_, members)| members.first().cloned().cloned().expect("group is never empty"))
            .collect(),
        AggregationStrategy::QualityWeighted => group_by_signature(records)
            .into_iter()
            .map(|(_, members)| {
                members
                    .into_iter()
                    .max_by(|a, b| record_quality(a).total_cmp(&record_quality(b)))
                    .cloned()
                    .expect("group is never empty")
            })
            .collect(),
        AggregationStrategy::ConsensusBased => group_by_signature(records)
            .into_iter()
            .map(|(_, members)| consensus_merge(&members))
            .collect(),
    }
}

/// Merge a group of identically-signatured records: strings take the
/// longest non-empty value, everything else takes the first member's
/// value (there is no numeric field on `JobRecord` today, but the merge
/// rule is defined for when one is added).
fn consensus_merge(members: &[&JobRecord]) -> JobRecord {
    let longest_or_first = |values: Vec<&str>| -> String {
        values
            .iter()
            .filter(|v| !v.is_empty())
            .max_by_key(|v| v.len())
            .map(|v| v.to_string())
            .unwrap_or_default()
    };

    let first = members[0];
    JobRecord {
        title: longest_or_first(members.iter().map(|r| r.title.as_str()).collect()),
        company: longest_or_first(members.iter().map(|r| r.company.as_str()).collect()),
        location: longest_or_first(members.iter().map(|r| r.location.as_str()).collect()),
        date_posted: members.iter().find_map(|r| r.date_posted),
        description: members.iter().find_map(|r| r.description.clone()),
        salary: members.iter().find_map(|r| r.salary.clone()),
        job_url: members.iter().find_map(|r| r.job_url.clone()),
        source_platform: first.source_platform.clone(),
    }
}
