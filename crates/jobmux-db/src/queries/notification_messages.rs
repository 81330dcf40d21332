//! Database query functions for the `notification_messages` table — the
//! Notifier's delivery status machine:
//! `Pending -> Sending -> {Delivered | Failed | Retrying -> Pending}`.

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{DeliveryStatus, NotificationMessage};

/// Parameters for queuing a new notification.
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub job_id: Uuid,
    pub channel: String,
    pub recipient: String,
    pub priority: i32,
    pub subject: String,
    pub body: String,
    pub metadata: Value,
}

pub async fn insert_notification(
    pool: &PgPool,
    new: &NewNotification,
) -> Result<NotificationMessage> {
    let message = sqlx::query_as::<_, NotificationMessage>(
        "INSERT INTO notification_messages \
             (job_id, channel, recipient, priority, subject, body, metadata, status, attempt) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', 0) \
         RETURNING *",
    )
    .bind(new.job_id)
    .bind(&new.channel)
    .bind(&new.recipient)
    .bind(new.priority)
    .bind(&new.subject)
    .bind(&new.body)
    .bind(&new.metadata)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to queue notification for job {}", new.job_id))?;

    Ok(message)
}

pub async fn get(pool: &PgPool, id: Uuid) -> Result<Option<NotificationMessage>> {
    let message = sqlx::query_as::<_, NotificationMessage>(
        "SELECT * FROM notification_messages WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch notification")?;
    Ok(message)
}

/// Highest-priority pending (or retry-due) notifications first, oldest
/// within a priority tier first — the Notifier's dispatch queue ordering.
pub async fn list_pending(pool: &PgPool, limit: i64) -> Result<Vec<NotificationMessage>> {
    let limit = if limit > 0 { limit } else { 50 };
    let rows = sqlx::query_as::<_, NotificationMessage>(
        "SELECT * FROM notification_messages \
         WHERE status = 'pending' \
         ORDER BY priority DESC, created_at ASC \
         LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list pending notifications")?;
    Ok(rows)
}

/// Optimistic-locking CAS transition, mirroring `platform_tasks::transition`.
pub async fn transition(
    pool: &PgPool,
    id: Uuid,
    from: DeliveryStatus,
    to: DeliveryStatus,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE notification_messages SET status = $1, attempt = attempt + 1 \
         WHERE id = $2 AND status = $3",
    )
    .bind(to)
    .bind(id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition notification status")?;
    Ok(result.rows_affected())
}

/// Record a terminal successful delivery.
pub async fn mark_delivered(pool: &PgPool, id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE notification_messages SET status = 'delivered', delivered_at = NOW() \
         WHERE id = $1 AND status = 'sending'",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to mark notification delivered")?;
    Ok(result.rows_affected())
}

/// Record a failed delivery attempt and the error, leaving the caller to
/// decide whether to move the message to `Retrying` or `Failed`.
pub async fn record_error(pool: &PgPool, id: Uuid, error: &str) -> Result<()> {
    sqlx::query("UPDATE notification_messages SET last_error = $1 WHERE id = $2")
        .bind(error)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to record notification error")?;
    Ok(())
}
