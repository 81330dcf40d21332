//! Convenience dispatch helpers that wrap the Task Store's
//! `TransitionSubTask` contract with semantic names.

use anyhow::Result;
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use jobmux_db::models::PlatformTaskStatus;
use jobmux_db::queries::platform_tasks;

/// The CAS outcome of a status transition attempt, typed so callers can
/// distinguish "lost the race" from "job is already terminal" without
/// re-querying.
#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    #[error("platform task {0} not found")]
    NotFound(Uuid),
    #[error("platform task {task_id} is not in status {expected}, transition rejected")]
    StatusMismatch {
        task_id: Uuid,
        expected: PlatformTaskStatus,
    },
    #[error("job for platform task {0} is already terminal")]
    JobTerminal(Uuid),
}

async fn apply_transition(
    pool: &PgPool,
    task_id: Uuid,
    from: PlatformTaskStatus,
    to: PlatformTaskStatus,
    started: bool,
    completed: bool,
) -> Result<(), TransitionError> {
    let now = Utc::now();
    let rows = platform_tasks::transition(
        pool,
        task_id,
        from,
        to,
        started.then_some(now),
        completed.then_some(now),
    )
    .await
    .map_err(|_| TransitionError::NotFound(task_id))?;

    if rows == 0 {
        let task = platform_tasks::get_platform_task(pool, task_id)
            .await
            .map_err(|_| TransitionError::NotFound(task_id))?;
        return match task {
            None => Err(TransitionError::NotFound(task_id)),
            Some(t) if t.status != from => Err(TransitionError::StatusMismatch {
                task_id,
                expected: from,
            }),
            Some(_) => Err(TransitionError::JobTerminal(task_id)),
        };
    }

    Ok(())
}

/// `Pending -> Assigned`: the dispatcher has handed the sub-task a worker.
pub async fn assign(pool: &PgPool, task_id: Uuid) -> Result<(), TransitionError> {
    apply_transition(
        pool,
        task_id,
        PlatformTaskStatus::Pending,
        PlatformTaskStatus::Assigned,
        false,
        false,
    )
    .await
}

/// `Assigned -> Processing`: the worker has begun invoking the adapter.
pub async fn start(pool: &PgPool, task_id: Uuid) -> Result<(), TransitionError> {
    apply_transition(
        pool,
        task_id,
        PlatformTaskStatus::Assigned,
        PlatformTaskStatus::Processing,
        true,
        false,
    )
    .await
}

/// `Processing -> Failed`: the adapter call failed or timed out.
pub async fn fail(pool: &PgPool, task_id: Uuid) -> Result<(), TransitionError> {
    apply_transition(
        pool,
        task_id,
        PlatformTaskStatus::Processing,
        PlatformTaskStatus::Failed,
        false,
        true,
    )
    .await
}

/// `Processing -> Cancelled`: a job-level cancellation reached this worker.
pub async fn cancel(pool: &PgPool, task_id: Uuid) -> Result<(), TransitionError> {
    apply_transition(
        pool,
        task_id,
        PlatformTaskStatus::Processing,
        PlatformTaskStatus::Cancelled,
        false,
        true,
    )
    .await
}
