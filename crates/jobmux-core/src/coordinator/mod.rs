//! Coordinator (C8): a thin façade wiring the other components together.
//! Accepts submissions (delegating to the Scheduler), exposes status/list/
//! cancel/health reads, runs a periodic health check, and drives terminal
//! jobs through the Integrity Engine and then the Notifier.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use jobmux_db::models::{Job, JobStatus, PlatformHealth, PlatformTask};
use jobmux_db::queries::{integrity_reports, jobs, notification_messages, platform_health};

use crate::adapter::AdapterRegistry;
use crate::integrity::{self, AggregationStrategy, IntegrityReport, IntegrityThresholds};
use crate::notifier::{self, Channel, NotificationRequest};
use crate::registry::Registry;
use crate::scheduler::{Scheduler, SchedulerConfig, SubmitRequest};
use crate::syncbus::{SyncBusHandle, SyncEvent, SyncEventType};

/// Tuning for the Coordinator's background loops and the thresholds it
/// hands to the Integrity Engine when a job goes terminal.
#[derive(Clone)]
pub struct CoordinatorConfig {
    pub health_check_interval: Duration,
    pub terminal_poll_interval: Duration,
    pub aggregation_strategy: AggregationStrategy,
    pub integrity_thresholds: IntegrityThresholds,
    pub max_notification_retries: i32,
    /// How often the background sweep calls `flush_pending_notifications`
    /// to redeliver notifications that came back to `Pending` after a
    /// `Retrying` backoff.
    pub notification_retry_interval: Duration,
    /// Max rows the sweep pulls from `list_pending` per tick.
    pub notification_retry_batch: i64,
    /// Consecutive-failure count past which a platform is considered down
    /// for `is_healthy` purposes.
    pub failure_threshold: i32,
    pub recovery_window_secs: i64,
    /// Fraction of unhealthy platforms that triggers a `HealthAlert` sync
    /// event (e.g. 0.5 == half or more of the catalog is unhealthy).
    pub unhealthy_fraction_alert_threshold: f64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(30),
            terminal_poll_interval: Duration::from_millis(500),
            aggregation_strategy: AggregationStrategy::DeduplicateSmart,
            integrity_thresholds: IntegrityThresholds::default(),
            max_notification_retries: 5,
            notification_retry_interval: Duration::from_secs(30),
            notification_retry_batch: 50,
            failure_threshold: 5,
            recovery_window_secs: 300,
            unhealthy_fraction_alert_threshold: 0.5,
        }
    }
}

/// A snapshot combining per-platform health with the fleet-wide verdict,
/// the Coordinator's answer to `GetHealth()`.
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub platforms: Vec<PlatformHealth>,
    pub unhealthy_count: usize,
    pub alert: bool,
}

/// Thin façade over the Scheduler plus the terminal-job pipeline
/// (Integrity Engine -> Notifier). Holds a bounded in-process cache of
/// recently-seen job rows for fast status reads, separate from the
/// Scheduler's own per-job record accumulator.
pub struct Coordinator {
    pool: PgPool,
    registry: Arc<Registry>,
    scheduler: Arc<Scheduler>,
    channels: std::collections::HashMap<String, Box<dyn Channel>>,
    sync_bus: Option<SyncBusHandle>,
    config: CoordinatorConfig,
    status_cache: RwLock<lru_map::LruMap<Uuid, Job>>,
    /// Jobs whose terminal handling (integrity + notification) has already
    /// run, so the terminal-job poll loop never double-processes one.
    handled_terminal: RwLock<HashSet<Uuid>>,
}

/// A tiny fixed-capacity cache: insertion evicts the oldest entry once
/// over capacity. Not a full LRU (no access-order bump) -- the status
/// cache is a fast-path hint, not a correctness-bearing structure, so the
/// extra bookkeeping isn't worth it.
mod lru_map {
    use std::collections::HashMap;
    use std::collections::VecDeque;
    use std::hash::Hash;

    pub struct LruMap<K, V> {
        capacity: usize,
        order: VecDeque<K>,
        map: HashMap<K, V>,
    }

    impl<K: Eq + Hash + Clone, V> LruMap<K, V> {
        pub fn new(capacity: usize) -> Self {
            Self {
                capacity: capacity.max(1),
                order: VecDeque::new(),
                map: HashMap::new(),
            }
        }

        pub fn insert(&mut self, key: K, value: V) {
            if !self.map.contains_key(&key) {
                self.order.push_back(key.clone());
                if self.order.len() > self.capacity {
                    if let Some(oldest) = self.order.pop_front() {
                        self.map.remove(&oldest);
                    }
                }
            }
            self.map.insert(key, value);
        }

        pub fn get(&self, key: &K) -> Option<&V> {
            self.map.get(key)
        }

        pub fn remove(&mut self, key: &K) {
            self.map.remove(key);
        }
    }
}

impl Coordinator {
    pub fn new(
        pool: PgPool,
        registry: Arc<Registry>,
        adapters: Arc<AdapterRegistry>,
        scheduler_config: SchedulerConfig,
        channels: std::collections::HashMap<String, Box<dyn Channel>>,
        config: CoordinatorConfig,
        sync_bus: Option<SyncBusHandle>,
        max_concurrent_jobs: usize,
    ) -> Self {
        let scheduler = Arc::new(Scheduler::new(
            pool.clone(),
            Arc::clone(&registry),
            adapters,
            scheduler_config,
            sync_bus.clone(),
        ));
        Self {
            pool,
            registry,
            scheduler,
            channels,
            sync_bus,
            config,
            status_cache: RwLock::new(lru_map::LruMap::new(max_concurrent_jobs.max(16))),
            handled_terminal: RwLock::new(HashSet::new()),
        }
    }

    /// `Submit(request) -> Job`, delegated straight to the Scheduler.
    pub async fn submit(&self, request: SubmitRequest) -> Result<Job> {
        let job = self.scheduler.submit(request).await?;
        self.status_cache.write().await.insert(job.id, job.clone());
        Ok(job)
    }

    /// Fast-path read over the in-process cache only, no DB round-trip.
    /// Trades a little staleness for latency; `status()` is the source of
    /// truth and also refreshes this cache.
    pub async fn cached_status(&self, job_id: Uuid) -> Option<Job> {
        self.status_cache.read().await.get(&job_id).cloned()
    }

    /// `GetStatus(job_id)`: the Scheduler's read path, warming the cache.
    pub async fn status(&self, job_id: Uuid) -> Result<Option<(Job, Vec<PlatformTask>)>> {
        let result = self.scheduler.status(job_id).await?;
        if let Some((job, _)) = &result {
            self.status_cache.write().await.insert(job_id, job.clone());
        }
        Ok(result)
    }

    /// `ListJobs(filter)`, a direct pass-through to the Task Store.
    pub async fn list_jobs(&self, filter: &jobs::JobFilter) -> Result<Vec<Job>> {
        jobs::list_jobs(&self.pool, filter).await
    }

    /// `Cancel(job_id)`, delegated to the Scheduler.
    pub async fn cancel(&self, job_id: Uuid) -> Result<bool> {
        let cancelled = self.scheduler.cancel(job_id).await?;
        self.status_cache.write().await.remove(&job_id);
        Ok(cancelled)
    }

    /// The integrity report for a (terminal) job, if one has been produced.
    pub async fn integrity_report(&self, job_id: Uuid) -> Result<Option<IntegrityReport>> {
        let Some(row) = integrity_reports::get_for_job(&self.pool, job_id).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_value(serde_json::json!({
            "platform_summaries": row.platform_summaries,
            "aggregated_records": row.aggregated_records,
            "overall_quality": row.overall_quality,
            "quality_level": row.quality_level,
            "passed": row.passed,
            "issues": row.issues,
            "warnings": row.warnings,
            "recommendations": row.recommendations,
        }))?))
    }

    /// The underlying connection pool, for read paths the HTTP surface
    /// drives directly against the Task Store (e.g. event history).
    pub fn pool(&self) -> PgPool {
        self.pool.clone()
    }

    /// The Platform Registry this Coordinator was built with.
    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    /// The Sync Bus handle, if this Coordinator was built with one -- the
    /// HTTP surface wires WebSocket clients to it directly.
    pub fn sync_bus(&self) -> Option<&SyncBusHandle> {
        self.sync_bus.as_ref()
    }

    /// `GetHealth()`: per-platform health plus a fleet-wide verdict.
    pub async fn health(&self) -> Result<HealthSnapshot> {
        let platforms = platform_health::list_all(&self.pool).await?;
        let unhealthy_count = platforms
            .iter()
            .filter(|p| !p.is_healthy(self.config.failure_threshold, self.config.recovery_window_secs))
            .count();
        let fraction = if platforms.is_empty() {
            0.0
        } else {
            unhealthy_count as f64 / platforms.len() as f64
        };
        Ok(HealthSnapshot {
            platforms,
            unhealthy_count,
            alert: fraction >= self.config.unhealthy_fraction_alert_threshold,
        })
    }

    async fn publish(&self, event_type: SyncEventType, job_id: Option<Uuid>, data: serde_json::Value) {
        let Some(bus) = &self.sync_bus else { return };
        let event = SyncEvent {
            event_id: Uuid::new_v4(),
            event_type,
            job_id,
            platform: None,
            data,
            priority: 2,
            timestamp: chrono::Utc::now(),
            ttl: chrono::Utc::now() + chrono::Duration::minutes(10),
            target_clients: None,
        };
        let _ = bus.publish(event).await;
    }

    /// Drive the Scheduler's dispatch loop, the periodic health check, and
    /// the terminal-job pipeline concurrently until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let scheduler = Arc::clone(&self.scheduler);
        let scheduler_shutdown = shutdown.clone();
        let dispatch = tokio::spawn(async move { scheduler.run(scheduler_shutdown).await });

        let health_coordinator = Arc::clone(&self);
        let health_shutdown = shutdown.clone();
        let health_loop = tokio::spawn(async move {
            health_coordinator.run_health_loop(health_shutdown).await;
            Ok::<(), anyhow::Error>(())
        });

        let terminal_coordinator = Arc::clone(&self);
        let terminal_shutdown = shutdown.clone();
        let terminal_loop = tokio::spawn(async move {
            terminal_coordinator.run_terminal_loop(terminal_shutdown).await;
            Ok::<(), anyhow::Error>(())
        });

        let notification_coordinator = Arc::clone(&self);
        let notification_shutdown = shutdown.clone();
        let notification_retry_loop = tokio::spawn(async move {
            notification_coordinator.run_notification_retry_loop(notification_shutdown).await;
            Ok::<(), anyhow::Error>(())
        });

        let (dispatch_result, health_result, terminal_result, notification_result) =
            tokio::join!(dispatch, health_loop, terminal_loop, notification_retry_loop);
        dispatch_result.context("dispatch loop panicked")??;
        health_result.context("health loop panicked")??;
        terminal_result.context("terminal loop panicked")??;
        notification_result.context("notification retry loop panicked")??;
        Ok(())
    }

    async fn run_health_loop(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.health_check_interval) => {}
                _ = shutdown.cancelled() => return,
            }
            match self.health().await {
                Ok(snapshot) if snapshot.alert => {
                    tracing::warn!(
                        unhealthy = snapshot.unhealthy_count,
                        total = snapshot.platforms.len(),
                        "platform fleet health degraded"
                    );
                    self.publish(
                        SyncEventType::HealthAlert,
                        None,
                        serde_json::json!({
                            "unhealthy_count": snapshot.unhealthy_count,
                            "total": snapshot.platforms.len(),
                        }),
                    )
                    .await;
                }
                Ok(_) => {}
                Err(error) => tracing::error!(%error, "health check failed"),
            }
        }
    }

    async fn run_terminal_loop(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                return;
            }
            if let Err(error) = self.process_newly_terminal_jobs().await {
                tracing::error!(%error, "terminal-job pass failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.terminal_poll_interval) => {}
                _ = shutdown.cancelled() => return,
            }
        }
    }

    /// Periodically redeliver notifications sitting `Pending` after a
    /// `Retrying` backoff, so a transient channel failure doesn't leave a
    /// message stuck forever.
    async fn run_notification_retry_loop(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.notification_retry_interval) => {}
                _ = shutdown.cancelled() => return,
            }
            match self.flush_pending_notifications(self.config.notification_retry_batch).await {
                Ok(delivered) if delivered > 0 => {
                    tracing::debug!(delivered, "notification retry sweep redelivered messages");
                }
                Ok(_) => {}
                Err(error) => tracing::error!(%error, "notification retry sweep failed"),
            }
        }
    }

    /// One pass: find jobs that reached a terminal status but haven't had
    /// their integrity/notification pipeline run yet, and run it.
    async fn process_newly_terminal_jobs(&self) -> Result<()> {
        for status in [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled] {
            let filter = jobs::JobFilter {
                status: Some(status),
                user_tag: None,
                limit: 200,
            };
            for job in jobs::list_jobs(&self.pool, &filter).await? {
                if self.handled_terminal.read().await.contains(&job.id) {
                    continue;
                }
                self.handle_terminal_job(&job).await?;
                self.handled_terminal.write().await.insert(job.id);
            }
        }
        Ok(())
    }

    /// Run the Integrity Engine (for `Completed`/`Failed` jobs that had at
    /// least one platform attempt) then the Notifier for one terminal job.
    /// `Cancelled` jobs get neither, per the cancellation scenario: no
    /// report, no completion notification.
    async fn handle_terminal_job(&self, job: &Job) -> Result<()> {
        if job.status == JobStatus::Cancelled {
            self.scheduler.take_job_records(job.id).await;
            return Ok(());
        }

        let per_platform = self.scheduler.take_job_records(job.id).await;
        let failed_platforms: Vec<String> = job
            .platforms
            .iter()
            .filter(|p| !per_platform.contains_key(*p))
            .cloned()
            .collect();

        let report = integrity::build_report(
            &self.registry,
            &job.platforms,
            &failed_platforms,
            &per_platform,
            self.config.aggregation_strategy,
            &self.config.integrity_thresholds,
        );

        integrity_reports::insert_report(
            &self.pool,
            &integrity_reports::NewIntegrityReport {
                job_id: job.id,
                overall_quality: report.overall_quality,
                quality_level: report.quality_level.clone(),
                passed: report.passed,
                platform_summaries: serde_json::to_value(&report.platform_summaries)?,
                aggregated_records: serde_json::to_value(&report.aggregated_records)?,
                issues: serde_json::to_value(&report.issues)?,
                warnings: serde_json::to_value(&report.warnings)?,
                recommendations: serde_json::to_value(&report.recommendations)?,
            },
        )
        .await
        .context("failed to persist integrity report")?;

        self.publish(
            SyncEventType::IntegrityReportReady,
            Some(job.id),
            serde_json::json!({ "overall_quality": report.overall_quality, "passed": report.passed }),
        )
        .await;

        self.notify_completion(job, &report).await?;
        Ok(())
    }

    async fn notify_completion(&self, job: &Job, report: &IntegrityReport) -> Result<()> {
        let (subject_template, body_template, priority) = if job.status == JobStatus::Failed {
            (
                "Job {{job_id}} failed".to_string(),
                "All requested platforms failed for query \"{{query}}\". Issues: {{issues}}.".to_string(),
                3,
            )
        } else {
            (
                "Job {{job_id}} completed".to_string(),
                "Query \"{{query}}\" finished with quality {{quality}} ({{quality_level}}).".to_string(),
                1,
            )
        };

        let mut vars = std::collections::HashMap::new();
        vars.insert("job_id".to_string(), job.id.to_string());
        vars.insert("query".to_string(), job.query.clone());
        vars.insert("quality".to_string(), format!("{:.2}", report.overall_quality));
        vars.insert("quality_level".to_string(), report.quality_level.clone());
        vars.insert("issues".to_string(), report.issues.join("; "));

        let severity = if job.status == JobStatus::Failed {
            crate::errors::ErrorSeverity::High
        } else {
            crate::errors::ErrorSeverity::Low
        };
        let channels: Vec<String> = notifier::channels_for_error(severity, crate::errors::ErrorCategory::Unknown)
            .into_iter()
            .map(str::to_string)
            .collect();

        let request = NotificationRequest {
            job_id: job.id,
            priority,
            subject_template,
            body_template,
            vars,
            channels,
            recipient: job.user_tag.clone().unwrap_or_else(|| "default".to_string()),
        };

        let (message_ids, warnings) = notifier::enqueue(&self.pool, &request).await?;
        for warning in warnings {
            tracing::warn!(job_id = %job.id, warning, "notification template had a missing variable");
        }
        for message_id in message_ids {
            let status = notifier::deliver(&self.pool, &self.channels, message_id, self.config.max_notification_retries).await?;
            self.publish(
                SyncEventType::NotificationSent,
                Some(job.id),
                serde_json::json!({ "message_id": message_id, "status": format!("{status:?}") }),
            )
            .await;
        }
        Ok(())
    }

    /// Flush pending retry-scheduled notifications (status `Pending` after
    /// a prior `Retrying` backoff). Intended to be driven by the same
    /// caller that owns the retry-delay timers; kept separate from
    /// `notify_completion` so a retry sweep doesn't re-enqueue a message.
    pub async fn flush_pending_notifications(&self, limit: i64) -> Result<usize> {
        let pending = notification_messages::list_pending(&self.pool, limit).await?;
        let mut delivered = 0usize;
        for message in pending {
            let status = notifier::deliver(&self.pool, &self.channels, message.id, self.config.max_notification_retries).await?;
            if status == jobmux_db::models::DeliveryStatus::Delivered {
                delivered += 1;
            }
        }
        Ok(delivered)
    }
}
