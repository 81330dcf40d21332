//! Sync Bus (C5): delivers typed [`SyncEvent`]s to subscribed live clients,
//! with batching, per-client rate limiting, and heartbeat eviction.
//!
//! Client records are in-process only and never persisted. A single
//! dispatch task drains the event queue and fans it out to subscribers.

mod client;
mod dispatch;

pub use client::{Client, ClientId, ClientKind};
pub use dispatch::{SyncBus, SyncBusConfig, SyncBusHandle};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One of the event types enumerated in the external interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncEventType {
    JobCreated,
    JobStarted,
    SubTaskStarted,
    SubTaskProgress,
    SubTaskCompleted,
    SubTaskFailed,
    JobCompleted,
    JobFailed,
    RetryScheduled,
    FallbackApplied,
    ErrorOccurred,
    PlatformHealth,
    IntegrityReportReady,
    NotificationSent,
    HealthAlert,
    Heartbeat,
    ClientConnect,
    ClientDisconnect,
}

/// A single event placed on the bus for fan-out to subscribed clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEvent {
    pub event_id: Uuid,
    pub event_type: SyncEventType,
    pub job_id: Option<Uuid>,
    pub platform: Option<String>,
    pub data: Value,
    /// Higher sorts first within a dispatch batch.
    pub priority: i32,
    pub timestamp: DateTime<Utc>,
    /// Events past this instant are discarded rather than delivered.
    pub ttl: DateTime<Utc>,
    /// If set, only these clients receive the event; otherwise the
    /// subscription index for `event_type` (or the `*` wildcard) decides.
    pub target_clients: Option<Vec<ClientId>>,
}

impl SyncEvent {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.ttl
    }
}
