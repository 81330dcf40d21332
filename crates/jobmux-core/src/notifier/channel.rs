//! Delivery channels. Channels that have no live transport configured
//! perform a side-effect-free send: the outbound envelope is recorded via
//! `tracing` and the call reports success.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use jobmux_db::models::NotificationMessage;
use sha2::Sha256;
use tracing::{error, info, warn};

type HmacSha256 = Hmac<Sha256>;

/// A delivery channel. Implementations must be cheap to construct and
/// safe to hold behind a shared registry (`Box<dyn Channel>`), so the
/// trait is object-safe.
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;
    async fn send(&self, message: &NotificationMessage) -> anyhow::Result<()>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn Channel) {}
};

/// Logs the notification at a level mapped from its priority and always
/// succeeds. Matches the "Log — structured tracing log line" channel.
pub struct LogChannel;

#[async_trait]
impl Channel for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, message: &NotificationMessage) -> anyhow::Result<()> {
        if message.priority >= 3 {
            error!(job_id = %message.job_id, subject = %message.subject, "notification");
        } else if message.priority >= 2 {
            warn!(job_id = %message.job_id, subject = %message.subject, "notification");
        } else {
            info!(job_id = %message.job_id, subject = %message.subject, "notification");
        }
        Ok(())
    }
}

/// A channel with no live transport: records the envelope it would have
/// sent and reports success. Used for Email, Slack, Teams, Discord, SMS,
/// and Push until a real transport is configured for the deployment.
pub struct SideEffectFreeChannel {
    name: String,
}

impl SideEffectFreeChannel {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Channel for SideEffectFreeChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, message: &NotificationMessage) -> anyhow::Result<()> {
        info!(
            channel = %self.name,
            job_id = %message.job_id,
            recipient = %message.recipient,
            subject = %message.subject,
            "recorded outbound envelope (no live transport configured)"
        );
        Ok(())
    }
}

/// Webhook channel: HTTP POST JSON envelope with an HMAC-SHA256 signature
/// over the body, carried in an `X-Jobmux-Signature` header. Reuses the
/// scoped-token HMAC idiom (compute over a message, hex-encode, compare
/// constant-time on the receiving side) without a live HTTP transport: the
/// signed envelope is recorded, matching [`SideEffectFreeChannel`] until a
/// real HTTP client is wired to an endpoint.
pub struct WebhookChannel {
    secret: Vec<u8>,
}

impl WebhookChannel {
    pub fn new(secret: Vec<u8>) -> Self {
        Self { secret }
    }

    fn sign(&self, body: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(body.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

#[async_trait]
impl Channel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, message: &NotificationMessage) -> anyhow::Result<()> {
        let body = serde_json::json!({
            "job_id": message.job_id,
            "subject": message.subject,
            "body": message.body,
            "metadata": message.metadata,
        })
        .to_string();
        let signature = self.sign(&body);
        info!(
            job_id = %message.job_id,
            recipient = %message.recipient,
            signature = %signature,
            "recorded signed webhook envelope (no live transport configured)"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::Value;
    use uuid::Uuid;

    fn message() -> NotificationMessage {
        NotificationMessage {
            id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            channel: "webhook".to_string(),
            recipient: "ops@example.com".to_string(),
            priority: 3,
            subject: "job failed".to_string(),
            body: "see dashboard".to_string(),
            metadata: Value::Object(Default::default()),
            status: jobmux_db::models::DeliveryStatus::Pending,
            attempt: 0,
            last_error: None,
            delivered_at: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn log_channel_always_succeeds() {
        let channel = LogChannel;
        assert!(channel.send(&message()).await.is_ok());
    }

    #[tokio::test]
    async fn side_effect_free_channel_always_succeeds() {
        let channel = SideEffectFreeChannel::new("slack");
        assert_eq!(channel.name(), "slack");
        assert!(channel.send(&message()).await.is_ok());
    }

    #[test]
    fn webhook_signature_is_deterministic() {
        let channel = WebhookChannel::new(b"secret".to_vec());
        let a = channel.sign("body");
        let b = channel.sign("body");
        assert_eq!(a, b);
    }

    #[test]
    fn webhook_signature_changes_with_body() {
        let channel = WebhookChannel::new(b"secret".to_vec());
        assert_ne!(channel.sign("a"), channel.sign("b"));
    }

    #[tokio::test]
    async fn webhook_channel_always_succeeds() {
        let channel = WebhookChannel::new(b"secret".to_vec());
        assert!(channel.send(&message()).await.is_ok());
    }
}
