//! Notifier (C7): composes messages from templates and delivers them
//! through multiple channels with per-recipient-per-channel rate limits
//! and retry.

mod channel;
mod template;

pub use channel::{Channel, LogChannel, SideEffectFreeChannel};
pub use template::render;

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::errors::{ErrorCategory, ErrorSeverity};
use jobmux_db::models::DeliveryStatus;
use jobmux_db::queries::notification_messages::{self, NewNotification};

/// Deterministic channel selection for error notifications: a function of
/// `(severity, category)`. `Log` is always included.
pub fn channels_for_error(severity: ErrorSeverity, _category: ErrorCategory) -> Vec<&'static str> {
    match severity {
        ErrorSeverity::Critical => vec!["email", "slack", "webhook", "log"],
        ErrorSeverity::High => vec!["email", "slack", "log"],
        ErrorSeverity::Medium => vec!["email", "log"],
        ErrorSeverity::Low => vec!["log"],
    }
}

/// `NotificationRequest`: the composed inputs for one notification.
#[derive(Debug, Clone)]
pub struct NotificationRequest {
    pub job_id: Uuid,
    pub priority: i32,
    pub subject_template: String,
    pub body_template: String,
    pub vars: HashMap<String, String>,
    pub channels: Vec<String>,
    pub recipient: String,
}

/// Queue a notification for each requested channel, substituting template
/// variables. Missing variables render as empty and are recorded in the
/// returned warnings list (the caller is expected to emit a sync event).
pub async fn enqueue(
    pool: &PgPool,
    request: &NotificationRequest,
) -> Result<(Vec<Uuid>, Vec<String>)> {
    let (subject, subject_warnings) = render(&request.subject_template, &request.vars);
    let (body, body_warnings) = render(&request.body_template, &request.vars);
    let mut warnings = subject_warnings;
    warnings.extend(body_warnings);

    let mut ids = Vec::with_capacity(request.channels.len());
    for channel in &request.channels {
        let message = notification_messages::insert_notification(
            pool,
            &NewNotification {
                job_id: request.job_id,
                channel: channel.clone(),
                recipient: request.recipient.clone(),
                priority: request.priority,
                subject: subject.clone(),
                body: body.clone(),
                metadata: Value::Object(Default::default()),
            },
        )
        .await
        .with_context(|| format!("failed to enqueue {channel} notification"))?;
        ids.push(message.id);
    }

    Ok((ids, warnings))
}

/// Deliver one queued notification using the given channel registry,
/// honoring the terminal-on-success-or-exhaustion contract. Returns the
/// final delivery status.
pub async fn deliver(
    pool: &PgPool,
    channels: &HashMap<String, Box<dyn Channel>>,
    message_id: Uuid,
    max_retries: i32,
) -> Result<DeliveryStatus> {
    let message = notification_messages::get(pool, message_id)
        .await?
        .with_context(|| format!("notification {message_id} not found"))?;

    let rows = notification_messages::transition(
        pool,
        message_id,
        DeliveryStatus::Pending,
        DeliveryStatus::Sending,
    )
    .await?;
    if rows == 0 {
        // Already being handled by another worker or in a terminal state.
        return Ok(message.status);
    }

    let Some(channel) = channels.get(&message.channel) else {
        notification_messages::record_error(pool, message_id, "no channel implementation registered").await?;
        notification_messages::transition(pool, message_id, DeliveryStatus::Sending, DeliveryStatus::Failed).await?;
        return Ok(DeliveryStatus::Failed);
    };

    match channel.send(&message).await {
        Ok(()) => {
            notification_messages::mark_delivered(pool, message_id).await?;
            Ok(DeliveryStatus::Delivered)
        }
        Err(error) => {
            notification_messages::record_error(pool, message_id, &error.to_string()).await?;
            if message.attempt + 1 >= max_retries {
                notification_messages::transition(
                    pool,
                    message_id,
                    DeliveryStatus::Sending,
                    DeliveryStatus::Failed,
                )
                .await?;
                Ok(DeliveryStatus::Failed)
            } else {
                notification_messages::transition(
                    pool,
                    message_id,
                    DeliveryStatus::Sending,
                    DeliveryStatus::Retrying,
                )
                .await?;
                tokio::time::sleep(retry_delay(message.attempt + 1)).await;
                notification_messages::transition(
                    pool,
                    message_id,
                    DeliveryStatus::Retrying,
                    DeliveryStatus::Pending,
                )
                .await?;
                Ok(DeliveryStatus::Pending)
            }
        }
    }
}

/// Exponential backoff delay before the next retry:
/// `min(60 * 2^(attempt-1), 3600)` seconds.
pub fn retry_delay(attempt: i32) -> Duration {
    let secs = 60u64.saturating_mul(1u64 << attempt.max(1).min(10).saturating_sub(1) as u32);
    Duration::from_secs(secs.min(3600))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn critical_severity_uses_all_channels() {
        let channels = channels_for_error(ErrorSeverity::Critical, ErrorCategory::System);
        assert!(channels.contains(&"email"));
        assert!(channels.contains(&"slack"));
        assert!(channels.contains(&"webhook"));
        assert!(channels.contains(&"log"));
    }

    #[test]
    fn low_severity_only_logs() {
        assert_eq!(channels_for_error(ErrorSeverity::Low, ErrorCategory::Validation), vec!["log"]);
    }

    #[test]
    fn retry_delay_caps_at_one_hour() {
        assert_eq!(retry_delay(1), Duration::from_secs(60));
        assert_eq!(retry_delay(2), Duration::from_secs(120));
        assert_eq!(retry_delay(10), Duration::from_secs(3600));
    }
}
