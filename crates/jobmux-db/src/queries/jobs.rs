//! Database query functions for the `jobs` table and the `CreateJob` /
//! aggregated-status contract of the Task Store.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Job, JobStatus, PlatformTaskStatus};

/// Parameters for `CreateJob`.
#[derive(Debug, Clone)]
pub struct NewJobSpec {
    pub query: String,
    pub location: Option<String>,
    pub region: String,
    pub platforms: Vec<String>,
    pub priority: i32,
    pub user_tag: Option<String>,
    pub deadline: Option<DateTime<Utc>>,
}

/// `CreateJob(spec) -> job_id`.
///
/// Inserts the `Job` row and one `PlatformTask` per requested platform in
/// `Pending` state, then emits `JobCreated` and one `SubTaskCreated` event
/// per platform. All inserts happen in a single transaction so the job and
/// its sub-tasks are never observed partially created.
pub async fn create_job(pool: &PgPool, spec: &NewJobSpec) -> Result<Job> {
    anyhow::ensure!(!spec.platforms.is_empty(), "job must target at least one platform");

    let mut tx = pool.begin().await.context("failed to begin create_job transaction")?;

    let job = sqlx::query_as::<_, Job>(
        "INSERT INTO jobs (query, location, region, platforms, priority, user_tag, deadline, status) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending') \
         RETURNING *",
    )
    .bind(&spec.query)
    .bind(&spec.location)
    .bind(&spec.region)
    .bind(&spec.platforms)
    .bind(spec.priority)
    .bind(&spec.user_tag)
    .bind(spec.deadline)
    .fetch_one(&mut *tx)
    .await
    .context("failed to insert job")?;

    for platform in &spec.platforms {
        sqlx::query(
            "INSERT INTO platform_tasks (job_id, platform, status, attempt) \
             VALUES ($1, $2, 'pending', 0)",
        )
        .bind(job.id)
        .bind(platform)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("failed to insert platform task for {platform}"))?;

        sqlx::query(
            "INSERT INTO events (job_id, platform, event_type, to_status, payload) \
             VALUES ($1, $2, 'SubTaskCreated', $3, $4)",
        )
        .bind(job.id)
        .bind(platform)
        .bind(PlatformTaskStatus::Pending.to_string())
        .bind(json!({ "platform": platform }))
        .execute(&mut *tx)
        .await
        .context("failed to insert SubTaskCreated event")?;
    }

    sqlx::query(
        "INSERT INTO events (job_id, event_type, to_status, payload) \
         VALUES ($1, 'JobCreated', $2, $3)",
    )
    .bind(job.id)
    .bind(JobStatus::Pending.to_string())
    .bind(json!({ "query": spec.query, "platforms": spec.platforms }))
    .execute(&mut *tx)
    .await
    .context("failed to insert JobCreated event")?;

    tx.commit().await.context("failed to commit create_job transaction")?;

    Ok(job)
}

/// `QueryJob(job_id)`.
pub async fn get_job(pool: &PgPool, job_id: Uuid) -> Result<Option<Job>> {
    let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
        .bind(job_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch job")?;
    Ok(job)
}

/// Optional filter for `ListJobs`.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub user_tag: Option<String>,
    pub limit: i64,
}

/// `ListJobs(filter)` — the Coordinator's read path over recent jobs.
pub async fn list_jobs(pool: &PgPool, filter: &JobFilter) -> Result<Vec<Job>> {
    let limit = if filter.limit > 0 { filter.limit } else { 100 };
    let jobs = sqlx::query_as::<_, Job>(
        "SELECT * FROM jobs \
         WHERE ($1::text IS NULL OR status = $1) \
           AND ($2::text IS NULL OR user_tag = $2) \
         ORDER BY submitted_at DESC \
         LIMIT $3",
    )
    .bind(filter.status.map(|s| s.to_string()))
    .bind(&filter.user_tag)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list jobs")?;
    Ok(jobs)
}

/// Recompute the aggregated job status from the current multiset of
/// sub-task statuses and persist it if changed.
///
/// Returns the status the job now has. A job already terminal is left
/// untouched (terminal monotonicity).
pub async fn recompute_job_status(pool: &PgPool, job_id: Uuid) -> Result<JobStatus> {
    let job = get_job(pool, job_id)
        .await?
        .with_context(|| format!("job {job_id} not found"))?;

    if job.status.is_terminal() {
        return Ok(job.status);
    }

    let counts: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status::text, COUNT(*) FROM platform_tasks WHERE job_id = $1 GROUP BY status",
    )
    .bind(job_id)
    .fetch_all(pool)
    .await
    .context("failed to count platform task statuses")?;

    let count = |s: &str| counts.iter().find(|(k, _)| k == s).map(|(_, c)| *c).unwrap_or(0);
    let total: i64 = counts.iter().map(|(_, c)| c).sum();
    let processing = count("processing") + count("assigned") + count("pending");
    let completed = count("completed");
    let failed = count("failed");
    let cancelled = count("cancelled");
    let terminal = completed + failed + cancelled;

    let new_status = if terminal == total && total > 0 {
        if completed > 0 {
            JobStatus::Completed
        } else if failed == total {
            JobStatus::Failed
        } else {
            // All terminal but mixed failed/cancelled with no completions.
            JobStatus::Failed
        }
    } else if processing > 0 {
        JobStatus::Processing
    } else {
        job.status
    };

    if new_status != job.status {
        sqlx::query("UPDATE jobs SET status = $1, updated_at = NOW() WHERE id = $2")
            .bind(new_status)
            .bind(job_id)
            .execute(pool)
            .await
            .context("failed to persist recomputed job status")?;

        let event_type = match new_status {
            JobStatus::Processing => "JobStarted",
            JobStatus::Completed => "JobCompleted",
            JobStatus::Failed => "JobFailed",
            JobStatus::Cancelled => "JobCancelled",
            _ => "JobStatusChanged",
        };
        sqlx::query(
            "INSERT INTO events (job_id, event_type, from_status, to_status, payload) \
             VALUES ($1, $2, $3, $4, '{}'::jsonb)",
        )
        .bind(job_id)
        .bind(event_type)
        .bind(job.status.to_string())
        .bind(new_status.to_string())
        .execute(pool)
        .await
        .context("failed to insert job status change event")?;
    }

    Ok(new_status)
}

/// `CompleteJob(job_id, report)` — idempotent terminal transition driven by
/// the Integrity Engine once all sub-tasks are terminal.
///
/// Rejects if the sub-task multiset is inconsistent with `final_status`
/// (e.g. requesting `Completed` when every sub-task failed).
pub async fn complete_job(pool: &PgPool, job_id: Uuid, final_status: JobStatus) -> Result<bool> {
    anyhow::ensure!(final_status.is_terminal(), "complete_job requires a terminal status");

    let job = get_job(pool, job_id)
        .await?
        .with_context(|| format!("job {job_id} not found"))?;

    if job.status.is_terminal() {
        // Idempotent: already terminal, nothing to do.
        return Ok(false);
    }

    let completed: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM platform_tasks WHERE job_id = $1 AND status = 'completed'",
    )
    .bind(job_id)
    .fetch_one(pool)
    .await
    .context("failed to count completed platform tasks")?;

    if final_status == JobStatus::Completed {
        anyhow::ensure!(
            completed > 0,
            "cannot mark job {job_id} Completed with zero successful platforms"
        );
    }

    let result = sqlx::query("UPDATE jobs SET status = $1, updated_at = NOW() WHERE id = $2")
        .bind(final_status)
        .bind(job_id)
        .execute(pool)
        .await
        .context("failed to complete job")?;

    Ok(result.rows_affected() > 0)
}

/// `Cancel(job_id)` — flips the job and every non-terminal sub-task to
/// `Cancelled`. Idempotent: a no-op if the job is already terminal.
pub async fn cancel_job(pool: &PgPool, job_id: Uuid) -> Result<bool> {
    let mut tx = pool.begin().await.context("failed to begin cancel_job transaction")?;

    let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1 FOR UPDATE")
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await
        .context("failed to fetch job for cancellation")?
        .with_context(|| format!("job {job_id} not found"))?;

    if job.status.is_terminal() {
        return Ok(false);
    }

    sqlx::query(
        "UPDATE platform_tasks SET status = 'cancelled', completed_at = NOW() \
         WHERE job_id = $1 AND status NOT IN ('completed', 'failed', 'cancelled')",
    )
    .bind(job_id)
    .execute(&mut *tx)
    .await
    .context("failed to cancel platform tasks")?;

    sqlx::query("UPDATE jobs SET status = 'cancelled', updated_at = NOW() WHERE id = $1")
        .bind(job_id)
        .execute(&mut *tx)
        .await
        .context("failed to cancel job")?;

    sqlx::query(
        "INSERT INTO events (job_id, event_type, from_status, to_status, payload) \
         VALUES ($1, 'JobCancelled', $2, 'cancelled', '{}'::jsonb)",
    )
    .bind(job_id)
    .bind(job.status.to_string())
    .execute(&mut *tx)
    .await
    .context("failed to insert JobCancelled event")?;

    tx.commit().await.context("failed to commit cancel_job transaction")?;
    Ok(true)
}

/// Flip the `requires_manual_intervention` flag when the Error Engine
/// escalates a failure to a human rather than retrying or substituting.
pub async fn mark_requires_manual_intervention(pool: &PgPool, job_id: Uuid) -> Result<()> {
    sqlx::query("UPDATE jobs SET requires_manual_intervention = true, updated_at = NOW() WHERE id = $1")
        .bind(job_id)
        .execute(pool)
        .await
        .context("failed to mark job as requiring manual intervention")?;
    Ok(())
}
