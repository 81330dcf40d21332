//! Row types and status enums for the task-tracking schema.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Overall status of a [`Job`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for JobStatus {
    type Err = JobStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(JobStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`JobStatus`] string.
#[derive(Debug, Clone)]
pub struct JobStatusParseError(pub String);

impl fmt::Display for JobStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid job status: {:?}", self.0)
    }
}

impl std::error::Error for JobStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a single [`PlatformTask`] attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PlatformTaskStatus {
    Pending,
    Assigned,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl PlatformTaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled
        )
    }
}

impl fmt::Display for PlatformTaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for PlatformTaskStatus {
    type Err = PlatformTaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "assigned" => Ok(Self::Assigned),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(PlatformTaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`PlatformTaskStatus`] string.
#[derive(Debug, Clone)]
pub struct PlatformTaskStatusParseError(pub String);

impl fmt::Display for PlatformTaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid platform task status: {:?}", self.0)
    }
}

impl std::error::Error for PlatformTaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Current health bucket of a platform, tracked by the Scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PlatformHealthStatus {
    Idle,
    Active,
    Busy,
    Error,
    Offline,
}

impl fmt::Display for PlatformHealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Active => "active",
            Self::Busy => "busy",
            Self::Error => "error",
            Self::Offline => "offline",
        };
        f.write_str(s)
    }
}

impl FromStr for PlatformHealthStatus {
    type Err = PlatformHealthStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "active" => Ok(Self::Active),
            "busy" => Ok(Self::Busy),
            "error" => Ok(Self::Error),
            "offline" => Ok(Self::Offline),
            other => Err(PlatformHealthStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`PlatformHealthStatus`] string.
#[derive(Debug, Clone)]
pub struct PlatformHealthStatusParseError(pub String);

impl fmt::Display for PlatformHealthStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid platform health status: {:?}", self.0)
    }
}

impl std::error::Error for PlatformHealthStatusParseError {}

// ---------------------------------------------------------------------------

/// Delivery status of a [`NotificationMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sending,
    Delivered,
    Failed,
    Retrying,
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Sending => "sending",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
        };
        f.write_str(s)
    }
}

impl FromStr for DeliveryStatus {
    type Err = DeliveryStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "sending" => Ok(Self::Sending),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            "retrying" => Ok(Self::Retrying),
            other => Err(DeliveryStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`DeliveryStatus`] string.
#[derive(Debug, Clone)]
pub struct DeliveryStatusParseError(pub String);

impl fmt::Display for DeliveryStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid delivery status: {:?}", self.0)
    }
}

impl std::error::Error for DeliveryStatusParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A user submission requesting search across multiple platforms.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub query: String,
    pub location: Option<String>,
    pub region: String,
    pub platforms: Vec<String>,
    pub priority: i32,
    pub status: JobStatus,
    pub user_tag: Option<String>,
    /// Set by the Error Engine when a sub-task failure is escalated to a
    /// human rather than retried or substituted.
    pub requires_manual_intervention: bool,
    pub submitted_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The per-platform unit of work spawned from a [`Job`].
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PlatformTask {
    pub id: Uuid,
    pub job_id: Uuid,
    pub platform: String,
    pub status: PlatformTaskStatus,
    pub attempt: i32,
    pub assigned_worker: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub record_count: Option<i32>,
    pub payload_hash: Option<String>,
    pub last_error: Option<Value>,
    pub hidden: bool,
    pub created_at: DateTime<Utc>,
}

/// An append-only record in a job's event log.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub job_id: Uuid,
    pub platform: Option<String>,
    pub event_type: String,
    pub from_status: Option<String>,
    pub to_status: Option<String>,
    pub payload: Value,
    pub recorded_at: DateTime<Utc>,
}

/// Rolling health snapshot for one platform, owned by the Scheduler.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PlatformHealth {
    pub platform: String,
    pub status: PlatformHealthStatus,
    pub success_rate: f64,
    pub avg_response_ms: f64,
    pub consecutive_failures: i32,
    pub current_load: i32,
    pub capacity: i32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl PlatformHealth {
    /// `is_healthy ⇔ consecutive_failures < failure_threshold ∧
    /// time_since_last_success < recovery_window`.
    pub fn is_healthy(&self, failure_threshold: i32, recovery_window_secs: i64) -> bool {
        if self.consecutive_failures >= failure_threshold {
            return false;
        }
        match self.last_success_at {
            Some(t) => (Utc::now() - t).num_seconds() < recovery_window_secs,
            None => self.last_failure_at.is_none(),
        }
    }
}

/// Persisted result of the Integrity Engine for one terminal job.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub id: Uuid,
    pub job_id: Uuid,
    pub overall_quality: f64,
    pub quality_level: String,
    pub passed: bool,
    pub platform_summaries: Value,
    pub aggregated_records: Value,
    pub issues: Value,
    pub warnings: Value,
    pub recommendations: Value,
    pub created_at: DateTime<Utc>,
}

/// A queued or delivered notification.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub id: Uuid,
    pub job_id: Uuid,
    pub channel: String,
    pub recipient: String,
    pub priority: i32,
    pub subject: String,
    pub body: String,
    pub metadata: Value,
    pub status: DeliveryStatus,
    pub attempt: i32,
    pub last_error: Option<String>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_roundtrip() {
        for s in [
            JobStatus::Pending,
            JobStatus::Queued,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            let parsed: JobStatus = s.to_string().parse().expect("should parse");
            assert_eq!(parsed, s);
        }
    }

    #[test]
    fn job_status_rejects_invalid() {
        assert!("bogus".parse::<JobStatus>().is_err());
    }

    #[test]
    fn job_status_terminal() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
    }

    #[test]
    fn platform_task_status_roundtrip() {
        for s in [
            PlatformTaskStatus::Pending,
            PlatformTaskStatus::Assigned,
            PlatformTaskStatus::Processing,
            PlatformTaskStatus::Completed,
            PlatformTaskStatus::Failed,
            PlatformTaskStatus::Cancelled,
        ] {
            let parsed: PlatformTaskStatus = s.to_string().parse().expect("should parse");
            assert_eq!(parsed, s);
        }
    }

    #[test]
    fn platform_task_status_rejects_invalid() {
        assert!("bogus".parse::<PlatformTaskStatus>().is_err());
    }

    #[test]
    fn platform_health_status_roundtrip() {
        for s in [
            PlatformHealthStatus::Idle,
            PlatformHealthStatus::Active,
            PlatformHealthStatus::Busy,
            PlatformHealthStatus::Error,
            PlatformHealthStatus::Offline,
        ] {
            let parsed: PlatformHealthStatus = s.to_string().parse().expect("should parse");
            assert_eq!(parsed, s);
        }
    }

    #[test]
    fn delivery_status_roundtrip() {
        for s in [
            DeliveryStatus::Pending,
            DeliveryStatus::Sending,
            DeliveryStatus::Delivered,
            DeliveryStatus::Failed,
            DeliveryStatus::Retrying,
        ] {
            let parsed: DeliveryStatus = s.to_string().parse().expect("should parse");
            assert_eq!(parsed, s);
        }
    }

    #[test]
    fn platform_health_is_healthy() {
        let mut h = PlatformHealth {
            platform: "linkedin".into(),
            status: PlatformHealthStatus::Active,
            success_rate: 0.95,
            avg_response_ms: 120.0,
            consecutive_failures: 0,
            current_load: 1,
            capacity: 3,
            last_success_at: Some(Utc::now()),
            last_failure_at: None,
            updated_at: Utc::now(),
        };
        assert!(h.is_healthy(5, 600));
        h.consecutive_failures = 5;
        assert!(!h.is_healthy(5, 600));
    }
}
