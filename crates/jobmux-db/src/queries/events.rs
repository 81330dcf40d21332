//! Database query functions for the append-only `events` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::Event;

/// Parameters for inserting a new event row.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub job_id: Uuid,
    pub platform: Option<String>,
    pub event_type: String,
    pub from_status: Option<String>,
    pub to_status: Option<String>,
    pub payload: Value,
}

/// Append a new event. Events are never updated or deleted.
pub async fn insert_event(pool: &PgPool, new: &NewEvent) -> Result<Event> {
    let event = sqlx::query_as::<_, Event>(
        "INSERT INTO events (job_id, platform, event_type, from_status, to_status, payload) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         RETURNING *",
    )
    .bind(new.job_id)
    .bind(&new.platform)
    .bind(&new.event_type)
    .bind(&new.from_status)
    .bind(&new.to_status)
    .bind(&new.payload)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert {} event for job {}", new.event_type, new.job_id))?;

    Ok(event)
}

/// `QueryEvents(job_id, cursor, limit)` — an ordered slice of a job's event
/// log. `cursor` is the `recorded_at` of the last event the caller has seen;
/// `None` starts from the beginning.
pub async fn list_events(
    pool: &PgPool,
    job_id: Uuid,
    cursor: Option<DateTime<Utc>>,
    limit: i64,
) -> Result<Vec<Event>> {
    let limit = if limit > 0 { limit } else { 100 };
    let events = sqlx::query_as::<_, Event>(
        "SELECT * FROM events \
         WHERE job_id = $1 AND ($2::timestamptz IS NULL OR recorded_at > $2) \
         ORDER BY recorded_at ASC \
         LIMIT $3",
    )
    .bind(job_id)
    .bind(cursor)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list events")?;

    Ok(events)
}

/// Replay the complete, unbounded event log for a job — used by "event
/// totality" verification (testable property 6) and by any component that
/// needs to rebuild derived state from scratch.
pub async fn replay_all(pool: &PgPool, job_id: Uuid) -> Result<Vec<Event>> {
    let events = sqlx::query_as::<_, Event>(
        "SELECT * FROM events WHERE job_id = $1 ORDER BY recorded_at ASC",
    )
    .bind(job_id)
    .fetch_all(pool)
    .await
    .context("failed to replay event log")?;
    Ok(events)
}

/// Count events of a given type for a job (used in tests asserting exact
/// event-sequence shapes, e.g. S1's "exactly 2 SubTaskCompleted events").
pub async fn count_by_type(pool: &PgPool, job_id: Uuid, event_type: &str) -> Result<i64> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM events WHERE job_id = $1 AND event_type = $2")
            .bind(job_id)
            .bind(event_type)
            .fetch_one(pool)
            .await
            .context("failed to count events by type")?;
    Ok(count)
}
