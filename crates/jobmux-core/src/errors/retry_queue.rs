//! The retry queue: a min-heap of sub-tasks waiting to return to `Pending`,
//! drained by a single background task rather than `tokio::time::sleep`'d
//! inline in the worker that failed.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use jobmux_db::queries::{jobs, platform_tasks};

use crate::syncbus::{SyncBusHandle, SyncEvent, SyncEventType};

/// A sub-task scheduled to come back to `Pending`, ordered by `ready_at`.
#[derive(Debug, Clone)]
struct RetryItem {
    ready_at: DateTime<Utc>,
    task_id: Uuid,
    job_id: Uuid,
    platform: String,
    /// Attempt count at the time of failure, the CAS guard for
    /// `retry_to_pending`.
    attempt: i32,
}

impl PartialEq for RetryItem {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at
    }
}
impl Eq for RetryItem {}
impl PartialOrd for RetryItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for RetryItem {
    // `BinaryHeap` is a max-heap; reverse so the earliest `ready_at` sorts
    // to the top.
    fn cmp(&self, other: &Self) -> Ordering {
        other.ready_at.cmp(&self.ready_at)
    }
}

/// Shared handle callers use to enqueue a retry; the drain loop owns the
/// other end via the same heap.
#[derive(Clone)]
pub struct RetryQueueHandle {
    items: Arc<Mutex<BinaryHeap<RetryItem>>>,
}

impl RetryQueueHandle {
    pub fn new() -> Self {
        Self {
            items: Arc::new(Mutex::new(BinaryHeap::new())),
        }
    }

    /// Schedule `task_id` to transition back to `Pending` after `delay`.
    pub async fn schedule(&self, task_id: Uuid, job_id: Uuid, platform: String, attempt: i32, delay: Duration) {
        let ready_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
        self.items.lock().await.push(RetryItem {
            ready_at,
            task_id,
            job_id,
            platform,
            attempt,
        });
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.items.lock().await.len()
    }
}

impl Default for RetryQueueHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain ready items and request the Task Store transition each sub-task
/// back to `Pending`, so the Scheduler's own dispatch loop picks it back up
/// on its next poll. Runs until `shutdown` fires.
pub async fn run_retry_loop(
    pool: PgPool,
    queue: RetryQueueHandle,
    sync_bus: Option<SyncBusHandle>,
    shutdown: CancellationToken,
) {
    loop {
        if shutdown.is_cancelled() {
            break;
        }

        let ready: Vec<RetryItem> = {
            let mut items = queue.items.lock().await;
            let now = Utc::now();
            let mut ready = Vec::new();
            while matches!(items.peek(), Some(item) if item.ready_at <= now) {
                ready.push(items.pop().expect("peek just confirmed an item"));
            }
            ready
        };

        if ready.is_empty() {
            let next_wait = {
                let items = queue.items.lock().await;
                items.peek().map(|item| item.ready_at - Utc::now())
            };
            let sleep_for = match next_wait {
                Some(remaining) => remaining.to_std().unwrap_or(Duration::from_millis(10)),
                None => Duration::from_millis(200),
            };
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = shutdown.cancelled() => break,
            }
            continue;
        }

        for item in ready {
            let transitioned = platform_tasks::retry_to_pending(&pool, item.task_id, item.attempt)
                .await
                .unwrap_or(0)
                > 0;
            if !transitioned {
                continue;
            }

            let _ = jobs::recompute_job_status(&pool, item.job_id).await;

            if let Some(bus) = &sync_bus {
                let event = SyncEvent {
                    event_id: Uuid::new_v4(),
                    event_type: SyncEventType::SubTaskStarted,
                    job_id: Some(item.job_id),
                    platform: Some(item.platform.clone()),
                    data: serde_json::json!({ "retry": true }),
                    priority: 1,
                    timestamp: Utc::now(),
                    ttl: Utc::now() + chrono::Duration::minutes(5),
                    target_clients: None,
                };
                let _ = bus.publish(event).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schedule_orders_earliest_ready_first() {
        let queue = RetryQueueHandle::new();
        let job_id = Uuid::new_v4();

        queue
            .schedule(Uuid::new_v4(), job_id, "indeed".to_string(), 1, Duration::from_secs(5))
            .await;
        queue
            .schedule(Uuid::new_v4(), job_id, "linkedin".to_string(), 1, Duration::from_secs(1))
            .await;

        assert_eq!(queue.len().await, 2);
        let items = queue.items.lock().await;
        let top = items.peek().expect("queue is non-empty");
        assert_eq!(top.platform, "linkedin");
    }
}
