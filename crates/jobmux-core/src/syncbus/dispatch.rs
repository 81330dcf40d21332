//! The Sync Bus's single dispatch task: drains the event queue in
//! batches, resolves subscription targets, and fans events out to
//! per-client outboxes under a rate limit.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use super::client::{Client, ClientId, ClientKind};
use super::SyncEvent;

#[derive(Debug, Clone)]
pub struct SyncBusConfig {
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub client_timeout: chrono::Duration,
    pub rate_limit_per_client_per_sec: u32,
}

impl Default for SyncBusConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            batch_timeout: Duration::from_millis(100),
            client_timeout: chrono::Duration::seconds(60),
            rate_limit_per_client_per_sec: 20,
        }
    }
}

struct RateWindow {
    second: i64,
    count: u32,
}

struct SharedState {
    clients: RwLock<HashMap<ClientId, Client>>,
    subscription_index: RwLock<HashMap<String, HashSet<ClientId>>>,
    rate_windows: RwLock<HashMap<ClientId, RateWindow>>,
    events_dropped: AtomicU64,
}

/// A handle callers use to connect clients and submit events; the actual
/// dispatch loop runs as a background task owning the queue receiver.
#[derive(Clone)]
pub struct SyncBusHandle {
    state: Arc<SharedState>,
    sender: mpsc::Sender<SyncEvent>,
    config: SyncBusConfig,
}

pub struct SyncBus {
    state: Arc<SharedState>,
    receiver: mpsc::Receiver<SyncEvent>,
    config: SyncBusConfig,
}

impl SyncBus {
    /// Create the bus and its handle. The caller must `tokio::spawn` the
    /// returned bus's [`SyncBus::run`] to actually drive dispatch.
    pub fn new(config: SyncBusConfig) -> (Self, SyncBusHandle) {
        let (sender, receiver) = mpsc::channel(1024);
        let state = Arc::new(SharedState {
            clients: RwLock::new(HashMap::new()),
            subscription_index: RwLock::new(HashMap::new()),
            rate_windows: RwLock::new(HashMap::new()),
            events_dropped: AtomicU64::new(0),
        });

        let handle = SyncBusHandle {
            state: Arc::clone(&state),
            sender,
            config: config.clone(),
        };
        let bus = SyncBus {
            state,
            receiver,
            config,
        };
        (bus, handle)
    }

    /// Drive the dispatch loop until the sender side is dropped. Consumes
    /// up to `batch_size` events per tick, or flushes on `batch_timeout`,
    /// sorted by priority descending.
    pub async fn run(mut self) {
        let mut batch: Vec<SyncEvent> = Vec::with_capacity(self.config.batch_size);
        loop {
            let first = match tokio::time::timeout(self.config.batch_timeout, self.receiver.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(_) => {
                    self.evict_stale_clients().await;
                    continue;
                }
            };
            batch.push(first);
            while batch.len() < self.config.batch_size {
                match self.receiver.try_recv() {
                    Ok(event) => batch.push(event),
                    Err(_) => break,
                }
            }

            batch.sort_by(|a, b| b.priority.cmp(&a.priority));
            for event in batch.drain(..) {
                self.dispatch_one(event).await;
            }
            self.evict_stale_clients().await;
        }
    }

    async fn dispatch_one(&self, event: SyncEvent) {
        let now = Utc::now();
        if event.is_expired(now) {
            debug!(event_id = %event.event_id, "dropping expired sync event");
            return;
        }

        let targets = self.resolve_targets(&event).await;
        let clients = self.state.clients.read().await;
        for client_id in targets {
            let Some(client) = clients.get(&client_id) else {
                continue;
            };
            if !self.allow_under_rate_limit(client_id, now).await {
                self.state.events_dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            // Per-client sends never block the shared dispatch loop: a
            // full outbox means a slow/stuck client, so the event is
            // dropped for it rather than serialized behind a blocking send.
            if client.outbox.try_send(event.clone()).is_err() {
                self.state.events_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn resolve_targets(&self, event: &SyncEvent) -> Vec<ClientId> {
        if let Some(targets) = &event.target_clients {
            return targets.clone();
        }

        let type_name = format!("{:?}", event.event_type);
        let index = self.state.subscription_index.read().await;
        let mut targets: HashSet<ClientId> = index.get(&type_name).cloned().unwrap_or_default();
        if let Some(wildcard) = index.get("*") {
            targets.extend(wildcard.iter().copied());
        }
        targets.into_iter().collect()
    }

    async fn allow_under_rate_limit(&self, client_id: ClientId, now: chrono::DateTime<Utc>) -> bool {
        let second = now.timestamp();
        let mut windows = self.state.rate_windows.write().await;
        let window = windows.entry(client_id).or_insert(RateWindow { second, count: 0 });
        if window.second != second {
            window.second = second;
            window.count = 0;
        }
        if window.count >= self.config.rate_limit_per_client_per_sec {
            return false;
        }
        window.count += 1;
        true
    }

    async fn evict_stale_clients(&self) {
        let now = Utc::now();
        let stale: Vec<ClientId> = {
            let clients = self.state.clients.read().await;
            clients
                .values()
                .filter(|c| c.is_stale(now, self.config.client_timeout))
                .map(|c| c.id)
                .collect()
        };
        for client_id in stale {
            self.remove_client_locked(client_id).await;
            warn!(client_id = %client_id, "evicted client for missed heartbeat");
        }
    }

    async fn remove_client_locked(&self, client_id: ClientId) {
        self.state.clients.write().await.remove(&client_id);
        let mut index = self.state.subscription_index.write().await;
        for set in index.values_mut() {
            set.remove(&client_id);
        }
    }
}

impl SyncBusHandle {
    /// Register a new client with its initial subscription set.
    pub async fn connect(
        &self,
        id: ClientId,
        kind: ClientKind,
        user_tag: Option<String>,
        subscribe: Vec<String>,
    ) -> mpsc::Receiver<SyncEvent> {
        let (outbox_tx, outbox_rx) = mpsc::channel(256);
        let client = Client {
            id,
            kind,
            user_tag,
            subscriptions: subscribe.iter().cloned().collect(),
            last_heartbeat: Utc::now(),
            outbox: outbox_tx,
        };

        self.state.clients.write().await.insert(id, client);
        let mut index = self.state.subscription_index.write().await;
        for event_type in subscribe {
            index.entry(event_type).or_default().insert(id);
        }

        outbox_rx
    }

    pub async fn disconnect(&self, client_id: ClientId) {
        self.state.clients.write().await.remove(&client_id);
        let mut index = self.state.subscription_index.write().await;
        for set in index.values_mut() {
            set.remove(&client_id);
        }
    }

    pub async fn heartbeat(&self, client_id: ClientId) {
        if let Some(client) = self.state.clients.write().await.get_mut(&client_id) {
            client.last_heartbeat = Utc::now();
        }
    }

    /// Submit an event to the bus. Never blocks the caller past the
    /// bounded queue's capacity; a full queue is a backpressure signal the
    /// producer should itself treat as fatal to the current operation.
    pub async fn publish(&self, event: SyncEvent) -> Result<(), mpsc::error::SendError<SyncEvent>> {
        self.sender.send(event).await
    }

    pub fn events_dropped(&self) -> u64 {
        self.state.events_dropped.load(Ordering::Relaxed)
    }

    pub async fn client_count(&self) -> usize {
        self.state.clients.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syncbus::SyncEventType;
    use serde_json::json;
    use uuid::Uuid;

    fn make_event(priority: i32) -> SyncEvent {
        SyncEvent {
            event_id: Uuid::new_v4(),
            event_type: SyncEventType::JobCreated,
            job_id: None,
            platform: None,
            data: json!({}),
            priority,
            timestamp: Utc::now(),
            ttl: Utc::now() + chrono::Duration::seconds(60),
            target_clients: None,
        }
    }

    #[tokio::test]
    async fn wildcard_subscriber_receives_event() {
        let (bus, handle) = SyncBus::new(SyncBusConfig::default());
        tokio::spawn(bus.run());

        let client_id = Uuid::new_v4();
        let mut outbox = handle
            .connect(client_id, ClientKind::Browser, None, vec!["*".to_string()])
            .await;

        handle.publish(make_event(1)).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), outbox.recv())
            .await
            .expect("should receive before timeout")
            .expect("channel open");
        assert_eq!(received.event_type, SyncEventType::JobCreated);
    }

    #[tokio::test]
    async fn unsubscribed_client_receives_nothing() {
        let (bus, handle) = SyncBus::new(SyncBusConfig::default());
        tokio::spawn(bus.run());

        let client_id = Uuid::new_v4();
        let mut outbox = handle
            .connect(client_id, ClientKind::Browser, None, vec!["JobFailed".to_string()])
            .await;

        handle.publish(make_event(1)).await.unwrap();

        let result = tokio::time::timeout(Duration::from_millis(200), outbox.recv()).await;
        assert!(result.is_err(), "should not have received JobCreated");
    }

    #[tokio::test]
    async fn expired_event_is_dropped() {
        let (bus, handle) = SyncBus::new(SyncBusConfig::default());
        tokio::spawn(bus.run());

        let client_id = Uuid::new_v4();
        let mut outbox = handle
            .connect(client_id, ClientKind::Browser, None, vec!["*".to_string()])
            .await;

        let mut event = make_event(1);
        event.ttl = Utc::now() - chrono::Duration::seconds(1);
        handle.publish(event).await.unwrap();

        let result = tokio::time::timeout(Duration::from_millis(200), outbox.recv()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn disconnect_removes_from_subscription_index() {
        let (bus, handle) = SyncBus::new(SyncBusConfig::default());
        tokio::spawn(bus.run());

        let client_id = Uuid::new_v4();
        let _outbox = handle
            .connect(client_id, ClientKind::Browser, None, vec!["*".to_string()])
            .await;
        assert_eq!(handle.client_count().await, 1);

        handle.disconnect(client_id).await;
        assert_eq!(handle.client_count().await, 0);
    }
}
