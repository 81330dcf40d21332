//! Database query functions for the `platform_tasks` table: the atomic
//! `TransitionSubTask` contract and its retry/fallback/hide variants.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{PlatformTask, PlatformTaskStatus};

/// Fetch a single platform task by its opaque id.
pub async fn get_platform_task(pool: &PgPool, id: Uuid) -> Result<Option<PlatformTask>> {
    let task = sqlx::query_as::<_, PlatformTask>("SELECT * FROM platform_tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch platform task")?;
    Ok(task)
}

/// Fetch the platform task for a `(job_id, platform)` pair.
pub async fn get_by_job_and_platform(
    pool: &PgPool,
    job_id: Uuid,
    platform: &str,
) -> Result<Option<PlatformTask>> {
    let task = sqlx::query_as::<_, PlatformTask>(
        "SELECT * FROM platform_tasks WHERE job_id = $1 AND platform = $2",
    )
    .bind(job_id)
    .bind(platform)
    .fetch_optional(pool)
    .await
    .context("failed to fetch platform task by job and platform")?;
    Ok(task)
}

/// All platform tasks for a job, in creation order.
pub async fn list_for_job(pool: &PgPool, job_id: Uuid) -> Result<Vec<PlatformTask>> {
    let tasks = sqlx::query_as::<_, PlatformTask>(
        "SELECT * FROM platform_tasks WHERE job_id = $1 ORDER BY created_at ASC",
    )
    .bind(job_id)
    .fetch_all(pool)
    .await
    .context("failed to list platform tasks for job")?;
    Ok(tasks)
}

/// `TransitionSubTask(job_id, platform, from, to, payload)`.
///
/// Optimistic locking: the `UPDATE`'s `WHERE` clause requires the task's
/// current status to equal `from`, so concurrent transitions race safely —
/// exactly one caller observes `rows_affected() == 1`. The job's terminality
/// is re-checked in the same statement by joining against `jobs`, so a
/// transition against a now-terminal job is also rejected.
pub async fn transition(
    pool: &PgPool,
    task_id: Uuid,
    from: PlatformTaskStatus,
    to: PlatformTaskStatus,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE platform_tasks pt \
         SET status = $1, \
             started_at = COALESCE($2, pt.started_at), \
             completed_at = COALESCE($3, pt.completed_at) \
         FROM jobs j \
         WHERE pt.id = $4 AND pt.status = $5 \
           AND j.id = pt.job_id AND j.status NOT IN ('completed', 'failed', 'cancelled')",
    )
    .bind(to)
    .bind(started_at)
    .bind(completed_at)
    .bind(task_id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition platform task status")?;

    Ok(result.rows_affected())
}

/// Record the produced record count and payload hash on a successful
/// terminal transition, in the same statement as the transition itself.
pub async fn complete(
    pool: &PgPool,
    task_id: Uuid,
    from: PlatformTaskStatus,
    record_count: i32,
    payload_hash: &str,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE platform_tasks \
         SET status = 'completed', completed_at = NOW(), \
             record_count = $1, payload_hash = $2 \
         WHERE id = $3 AND status = $4",
    )
    .bind(record_count)
    .bind(payload_hash)
    .bind(task_id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to complete platform task")?;

    Ok(result.rows_affected())
}

/// `RecordError(job_id, platform, error_record)` — attaches to the current
/// attempt without changing status (the caller issues the status
/// transition separately, matching the distilled spec's separation of
/// concerns between error recording and transition).
pub async fn record_error(pool: &PgPool, task_id: Uuid, error_record: &Value) -> Result<()> {
    sqlx::query("UPDATE platform_tasks SET last_error = $1 WHERE id = $2")
        .bind(error_record)
        .bind(task_id)
        .execute(pool)
        .await
        .context("failed to record platform task error")?;
    Ok(())
}

/// Atomically transition a task from `failed` back to `pending` for a
/// retry, incrementing the attempt counter. Optimistic locking on both
/// status and the current attempt value, matching the source system's
/// `retry_task_to_pending` shape.
pub async fn retry_to_pending(pool: &PgPool, task_id: Uuid, current_attempt: i32) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE platform_tasks \
         SET status = 'pending', attempt = attempt + 1, \
             assigned_worker = NULL, started_at = NULL, completed_at = NULL \
         WHERE id = $1 AND status = 'failed' AND attempt = $2",
    )
    .bind(task_id)
    .bind(current_attempt)
    .execute(pool)
    .await
    .context("failed to retry platform task to pending")?;

    Ok(result.rows_affected())
}

/// Mark a platform task's payload hidden without deleting it or its event
/// history. Rollback hides rather than deletes so the event log stays a
/// complete, replayable record of what actually happened.
pub async fn mark_hidden(pool: &PgPool, task_id: Uuid) -> Result<()> {
    sqlx::query("UPDATE platform_tasks SET hidden = true WHERE id = $1")
        .bind(task_id)
        .execute(pool)
        .await
        .context("failed to mark platform task hidden")?;
    Ok(())
}

/// Fallback substitution: hide the exhausted task for `old_platform` and
/// insert a fresh `Pending` task for `new_platform` on the same job.
/// Returns the new task. The caller is responsible for emitting the
/// `FallbackApplied` event with both platform names.
pub async fn substitute_fallback(
    pool: &PgPool,
    job_id: Uuid,
    old_task_id: Uuid,
    new_platform: &str,
) -> Result<PlatformTask> {
    let mut tx = pool
        .begin()
        .await
        .context("failed to begin fallback substitution transaction")?;

    sqlx::query("UPDATE platform_tasks SET hidden = true WHERE id = $1")
        .bind(old_task_id)
        .execute(&mut *tx)
        .await
        .context("failed to hide exhausted platform task")?;

    let new_task = sqlx::query_as::<_, PlatformTask>(
        "INSERT INTO platform_tasks (job_id, platform, status, attempt) \
         VALUES ($1, $2, 'pending', 0) \
         RETURNING *",
    )
    .bind(job_id)
    .bind(new_platform)
    .fetch_one(&mut *tx)
    .await
    .context("failed to insert fallback platform task")?;

    tx.commit()
        .await
        .context("failed to commit fallback substitution transaction")?;

    Ok(new_task)
}

/// Pending sub-tasks ready for dispatch, highest job priority first and
/// oldest within a priority tier first. Hidden tasks (superseded by a
/// fallback) are never dispatchable.
pub async fn list_pending(pool: &PgPool, limit: i64) -> Result<Vec<PlatformTask>> {
    let tasks = sqlx::query_as::<_, PlatformTask>(
        "SELECT pt.* FROM platform_tasks pt \
         JOIN jobs j ON j.id = pt.job_id \
         WHERE pt.status = 'pending' AND pt.hidden = false \
           AND j.status NOT IN ('completed', 'failed', 'cancelled') \
         ORDER BY j.priority DESC, pt.created_at ASC \
         LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list pending platform tasks")?;
    Ok(tasks)
}

/// Count sub-tasks currently `Processing` for a platform, across all jobs.
/// Used to cross-check the Scheduler's in-process semaphore bound
/// (testable property 5).
pub async fn count_processing_for_platform(pool: &PgPool, platform: &str) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM platform_tasks WHERE platform = $1 AND status = 'processing'",
    )
    .bind(platform)
    .fetch_one(pool)
    .await
    .context("failed to count processing platform tasks")?;
    Ok(count)
}
