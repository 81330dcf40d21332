//! Database query functions for the `integrity_reports` table.

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::IntegrityReport;

/// Parameters for persisting a freshly computed integrity report.
#[derive(Debug, Clone)]
pub struct NewIntegrityReport {
    pub job_id: Uuid,
    pub overall_quality: f64,
    pub quality_level: String,
    pub passed: bool,
    pub platform_summaries: Value,
    pub aggregated_records: Value,
    pub issues: Value,
    pub warnings: Value,
    pub recommendations: Value,
}

/// Persist the report. A job has at most one report (unique on `job_id`);
/// re-running against an already-reported job is rejected rather than
/// silently overwritten, since reports are immutable once produced.
pub async fn insert_report(pool: &PgPool, new: &NewIntegrityReport) -> Result<IntegrityReport> {
    let report = sqlx::query_as::<_, IntegrityReport>(
        "INSERT INTO integrity_reports \
             (job_id, overall_quality, quality_level, passed, platform_summaries, \
              aggregated_records, issues, warnings, recommendations) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
         RETURNING *",
    )
    .bind(new.job_id)
    .bind(new.overall_quality)
    .bind(&new.quality_level)
    .bind(new.passed)
    .bind(&new.platform_summaries)
    .bind(&new.aggregated_records)
    .bind(&new.issues)
    .bind(&new.warnings)
    .bind(&new.recommendations)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert integrity report for job {}", new.job_id))?;

    Ok(report)
}

pub async fn get_for_job(pool: &PgPool, job_id: Uuid) -> Result<Option<IntegrityReport>> {
    let report = sqlx::query_as::<_, IntegrityReport>(
        "SELECT * FROM integrity_reports WHERE job_id = $1",
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch integrity report")?;
    Ok(report)
}
