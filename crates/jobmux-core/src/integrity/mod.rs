//! Integrity Engine (C6): validates per-platform payloads, detects
//! duplicates, aggregates results via a pluggable strategy, and computes a
//! quality report.

mod aggregate;

pub use aggregate::{aggregate, AggregationStrategy};

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::adapter::JobRecord;
use crate::registry::Registry;

/// An exact signature used for duplicate decisions: lowercased,
/// whitespace-normalized `title|company|location`, hashed. Exact
/// signature equality decides duplicates; similarity score is
/// reporting-only.
pub fn signature(record: &JobRecord) -> String {
    let normalize = |s: &str| s.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ");
    let key = format!(
        "{}|{}|{}",
        normalize(&record.title),
        normalize(&record.company),
        normalize(&record.location)
    );
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Jaccard similarity over whitespace tokens of `title|company|location`,
/// used only for reporting how close two non-identical records are.
pub fn jaccard_similarity(a: &JobRecord, b: &JobRecord) -> f64 {
    let tokens = |r: &JobRecord| -> std::collections::HashSet<String> {
        format!("{} {} {}", r.title, r.company, r.location)
            .to_lowercase()
            .split_whitespace()
            .map(|s| s.to_string())
            .collect()
    };
    let ta = tokens(a);
    let tb = tokens(b);
    if ta.is_empty() && tb.is_empty() {
        return 1.0;
    }
    let intersection = ta.intersection(&tb).count() as f64;
    let union = ta.union(&tb).count() as f64;
    if union == 0.0 {
        0.0
    } else {
        intersection / union
    }
}

/// Per-platform analysis result: every input record's validity and
/// duplicate status within that platform's own result set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformSummary {
    pub platform: String,
    pub total: usize,
    pub valid: usize,
    pub duplicates: usize,
    pub completeness: f64,
    pub accuracy: f64,
    pub uniqueness: f64,
    pub validity: f64,
    pub consistency: f64,
    pub timeliness: f64,
    pub overall: f64,
    pub quality_level: String,
}

fn quality_level(overall: f64) -> &'static str {
    if overall >= 0.95 {
        "Excellent"
    } else if overall >= 0.85 {
        "Good"
    } else if overall >= 0.70 {
        "Fair"
    } else if overall >= 0.50 {
        "Poor"
    } else {
        "Critical"
    }
}

/// Required fields expected on every `JobRecord`, per the registry schema.
const REQUIRED_FIELDS: &[&str] = &["title", "company", "location"];

fn field_coverage(record: &JobRecord) -> f64 {
    let present = REQUIRED_FIELDS
        .iter()
        .filter(|f| match **f {
            "title" => !record.title.is_empty(),
            "company" => !record.company.is_empty(),
            "location" => !record.location.is_empty(),
            _ => true,
        })
        .count();
    present as f64 / REQUIRED_FIELDS.len() as f64
}

fn is_fully_valid(record: &JobRecord) -> bool {
    field_coverage(record) >= 1.0
}

fn timeliness_score(record: &JobRecord, now: chrono::DateTime<chrono::Utc>) -> f64 {
    match record.date_posted {
        None => 0.5,
        Some(posted) => {
            let age_days = (now - posted).num_days().max(0) as f64;
            // Decays linearly over a year, floored at 0.
            (1.0 - age_days / 365.0).clamp(0.0, 1.0)
        }
    }
}

/// Compute the per-platform summary for one platform's record set.
pub fn analyze_platform(platform: &str, records: &[JobRecord]) -> PlatformSummary {
    let now = chrono::Utc::now();
    let total = records.len();

    if total == 0 {
        return PlatformSummary {
            platform: platform.to_string(),
            total: 0,
            valid: 0,
            duplicates: 0,
            completeness: 0.0,
            accuracy: 0.0,
            uniqueness: 0.0,
            validity: 0.0,
            consistency: 0.0,
            timeliness: 0.0,
            overall: 0.0,
            quality_level: quality_level(0.0).to_string(),
        };
    }

    let mut seen = HashMap::new();
    let mut duplicates = 0usize;
    for record in records {
        let sig = signature(record);
        *seen.entry(sig).or_insert(0) += 1;
    }
    for count in seen.values() {
        if *count > 1 {
            duplicates += count - 1;
        }
    }

    let valid = records.iter().filter(|r| is_fully_valid(r)).count();
    let completeness = records.iter().map(field_coverage).sum::<f64>() / total as f64;
    let accuracy = completeness;
    let unique_signatures = seen.len() as f64;
    let uniqueness = unique_signatures / total as f64;
    let validity = valid as f64 / total as f64;
    let consistency = completeness;
    let timeliness = records.iter().map(|r| timeliness_score(r, now)).sum::<f64>() / total as f64;

    let metrics = [completeness, accuracy, uniqueness, validity, consistency, timeliness];
    let nonzero: Vec<f64> = metrics.iter().copied().filter(|m| *m > 0.0).collect();
    let overall = if nonzero.is_empty() {
        0.0
    } else {
        nonzero.iter().sum::<f64>() / nonzero.len() as f64
    };

    PlatformSummary {
        platform: platform.to_string(),
        total,
        valid,
        duplicates,
        completeness,
        accuracy,
        uniqueness,
        validity,
        consistency,
        timeliness,
        overall,
        quality_level: quality_level(overall).to_string(),
    }
}

/// Thresholds driving the check pipeline.
#[derive(Debug, Clone)]
pub struct IntegrityThresholds {
    pub min_platform_coverage: f64,
    pub min_completeness: f64,
    pub max_duplicate_rate: f64,
    pub min_overall_quality: f64,
}

impl Default for IntegrityThresholds {
    fn default() -> Self {
        Self {
            min_platform_coverage: 0.5,
            min_completeness: 0.7,
            max_duplicate_rate: 0.3,
            min_overall_quality: 0.7,
        }
    }
}

/// The completed report for one terminal job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub platform_summaries: Vec<PlatformSummary>,
    pub aggregated_records: Vec<JobRecord>,
    pub overall_quality: f64,
    pub quality_level: String,
    pub passed: bool,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Run the full pipeline: load is the caller's job (it hands us the
/// per-platform record sets already fetched from the Task Store),
/// analysis, checks, aggregation, and final quality.
pub fn build_report(
    registry: &Registry,
    expected_platforms: &[String],
    failed_platforms: &[String],
    per_platform: &HashMap<String, Vec<JobRecord>>,
    strategy: AggregationStrategy,
    thresholds: &IntegrityThresholds,
) -> IntegrityReport {
    let mut issues = Vec::new();
    let mut warnings = Vec::new();
    let mut recommendations = Vec::new();

    let summaries: Vec<PlatformSummary> = per_platform
        .iter()
        .map(|(platform, records)| analyze_platform(platform, records))
        .collect();

    // Platform coverage check.
    let actual = per_platform.len() as f64;
    let expected = expected_platforms.len().max(1) as f64;
    let coverage = actual / expected;
    if coverage < thresholds.min_platform_coverage {
        issues.push(format!(
            "platform coverage {coverage:.2} below minimum {:.2}",
            thresholds.min_platform_coverage
        ));
    }
    for platform in failed_platforms {
        recommendations.push(format!("platform {platform} failed; consider a fallback source"));
    }

    // Data completeness and duplicate-rate checks, per platform.
    for summary in &summaries {
        if summary.completeness < thresholds.min_completeness {
            warnings.push(format!(
                "{} completeness {:.2} below threshold {:.2}",
                summary.platform, summary.completeness, thresholds.min_completeness
            ));
        }
        let duplicate_rate = if summary.total > 0 {
            summary.duplicates as f64 / summary.total as f64
        } else {
            0.0
        };
        if duplicate_rate > thresholds.max_duplicate_rate {
            warnings.push(format!(
                "{} duplicate rate {:.2} exceeds threshold {:.2}",
                summary.platform, duplicate_rate, thresholds.max_duplicate_rate
            ));
        }
    }

    // Schema validation: flag platforms with any invalid record.
    for summary in &summaries {
        if summary.valid < summary.total {
            issues.push(format!(
                "{} has {} record(s) missing required fields",
                summary.platform,
                summary.total - summary.valid
            ));
        }
    }

    // Temporal consistency: warn when registry knows nothing of a
    // requested platform (degraded coverage, never fatal).
    for platform in expected_platforms {
        if registry.platform(platform).is_none() && !registry.is_dispatchable(platform) {
            warnings.push(format!("{platform} has no registry entry; degraded coverage"));
        }
    }

    // Platforms in registry-configured priority order (lower number = higher
    // priority), so `PriorityBased` aggregation's "first-seen wins" reads
    // records off in that order rather than arbitrary `HashMap` iteration.
    // Platforms absent from the registry sort last, ties broken by name.
    let mut platform_order: Vec<&String> = per_platform.keys().collect();
    platform_order.sort_by_key(|name| {
        let priority = registry.platform(name).map(|p| p.priority).unwrap_or(u32::MAX);
        (priority, (*name).clone())
    });
    let all_records: Vec<JobRecord> = platform_order
        .into_iter()
        .flat_map(|name| per_platform[name].iter().cloned())
        .collect();
    let aggregated_records = aggregate(strategy, &all_records);

    let total_records: usize = summaries.iter().map(|s| s.total).sum();
    let overall_quality = if total_records == 0 {
        0.0
    } else {
        summaries
            .iter()
            .map(|s| s.overall * s.total as f64)
            .sum::<f64>()
            / total_records as f64
    };

    let passed = overall_quality >= thresholds.min_overall_quality;

    IntegrityReport {
        platform_summaries: summaries,
        aggregated_records,
        overall_quality,
        quality_level: quality_level(overall_quality).to_string(),
        passed,
        issues,
        warnings,
        recommendations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::JobRecord;

    fn record(title: &str, company: &str, location: &str) -> JobRecord {
        JobRecord {
            title: title.to_string(),
            company: company.to_string(),
            location: location.to_string(),
            date_posted: Some(chrono::Utc::now()),
            description: None,
            salary: None,
            job_url: None,
            source_platform: "linkedin".to_string(),
        }
    }

    #[test]
    fn identical_normalized_fields_are_duplicates() {
        let a = record("SWE", "Acme", "NYC");
        let b = record("swe", "  ACME ", "nyc");
        assert_eq!(signature(&a), signature(&b));
    }

    #[test]
    fn differing_field_breaks_duplicate_match() {
        let a = record("SWE", "Acme", "NYC");
        let b = record("SWE", "Acme", "SF");
        assert_ne!(signature(&a), signature(&b));
    }

    #[test]
    fn analyze_platform_counts_duplicates() {
        let records = vec![
            record("SWE", "Acme", "NYC"),
            record("SWE", "Acme", "NYC"),
            record("PM", "Acme", "NYC"),
        ];
        let summary = analyze_platform("linkedin", &records);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.duplicates, 1);
        assert!(summary.validity > 0.99);
    }

    #[test]
    fn quality_level_buckets() {
        assert_eq!(quality_level(0.96), "Excellent");
        assert_eq!(quality_level(0.90), "Good");
        assert_eq!(quality_level(0.75), "Fair");
        assert_eq!(quality_level(0.55), "Poor");
        assert_eq!(quality_level(0.1), "Critical");
    }

    #[test]
    fn build_report_flags_missing_platform_coverage() {
        let registry = Registry::default_catalog();
        let mut per_platform = HashMap::new();
        per_platform.insert("linkedin".to_string(), vec![record("SWE", "Acme", "NYC")]);
        let report = build_report(
            &registry,
            &["linkedin".to_string(), "indeed".to_string()],
            &["indeed".to_string()],
            &per_platform,
            AggregationStrategy::DeduplicateSmart,
            &IntegrityThresholds::default(),
        );
        assert!(report.issues.iter().any(|i| i.contains("coverage")));
        assert!(report.recommendations.iter().any(|r| r.contains("indeed")));
    }

    #[test]
    fn priority_based_aggregation_picks_the_higher_priority_platform_regardless_of_insertion_order() {
        let registry = Registry::default_catalog();
        // indeed has priority 2, linkedin priority 1 in the default catalog;
        // insert indeed first so a `HashMap`-iteration-order bug would
        // surface it as the winner instead.
        let mut per_platform = HashMap::new();
        per_platform.insert("indeed".to_string(), vec![record("SWE", "Acme", "NYC")]);
        per_platform.insert("linkedin".to_string(), vec![record("SWE", "Acme", "NYC")]);

        let report = build_report(
            &registry,
            &["linkedin".to_string(), "indeed".to_string()],
            &[],
            &per_platform,
            AggregationStrategy::PriorityBased,
            &IntegrityThresholds::default(),
        );

        assert_eq!(report.aggregated_records.len(), 1);
        assert_eq!(report.aggregated_records[0].source_platform, "linkedin");
    }
}
