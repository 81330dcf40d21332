//! Live client session records owned exclusively by the Sync Bus.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::SyncEvent;

pub type ClientId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    Browser,
    Cli,
    Service,
}

/// A connected subscriber. `outbox` is the per-client serialized send
/// channel; a bounded queue so a slow client cannot hold up the dispatch
/// loop (excess sends are dropped, not buffered without bound).
pub struct Client {
    pub id: ClientId,
    pub kind: ClientKind,
    pub user_tag: Option<String>,
    pub subscriptions: HashSet<String>,
    pub last_heartbeat: DateTime<Utc>,
    pub outbox: mpsc::Sender<SyncEvent>,
}

impl Client {
    pub fn subscribes_to(&self, event_type: &str) -> bool {
        self.subscriptions.contains("*") || self.subscriptions.contains(event_type)
    }

    pub fn is_stale(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
        now - self.last_heartbeat > timeout
    }
}
