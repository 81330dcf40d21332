//! Scheduler (C3): the intake -> dispatch -> worker pipeline. Accepts
//! submissions, resolves a region and platform set via the [`Registry`],
//! persists the job and its sub-tasks, then polls the Task Store for
//! dispatchable work and runs each sub-task under a bounded worker pool.
//!
//! A single dispatch loop, a semaphore bounding total concurrency, an
//! `mpsc` channel funneling worker results back, and cooperative
//! cancellation via `tokio_util::sync::CancellationToken`. Ready work comes
//! from the database rather than an in-memory DAG, since sub-tasks have no
//! dependencies on one another.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::{mpsc, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use jobmux_db::models::Job;
use jobmux_db::queries::{events, jobs, platform_health, platform_tasks};

use crate::adapter::{AdapterRegistry, JobRecord};
use crate::errors::{self, ErrorCategory, ErrorContext, RetryQueueHandle};
use crate::registry::Registry;
use crate::state;
use crate::syncbus::{SyncBusHandle, SyncEvent, SyncEventType};

/// Per-job, per-platform records handed off by a completed worker. The
/// Task Store only persists a count and a payload hash per sub-task, not
/// the records themselves, so a terminal-job consumer (the Coordinator's
/// integrity pass) reads them from here before they're evicted.
pub type JobRecordCache = Arc<RwLock<HashMap<Uuid, HashMap<String, Vec<JobRecord>>>>>;

/// Tuning for the dispatch loop and per-sub-task worker behavior.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Upper bound on sub-tasks processing across all platforms at once.
    pub max_global_concurrency: usize,
    /// How long the dispatch loop sleeps when nothing is ready to run.
    pub poll_interval: Duration,
    /// Max rows pulled from `list_pending` per dispatch tick.
    pub dispatch_batch: i64,
    /// Fallback per-sub-task deadline when the job carries none.
    pub default_task_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_global_concurrency: 20,
            poll_interval: Duration::from_millis(200),
            dispatch_batch: 50,
            default_task_timeout: Duration::from_secs(60),
        }
    }
}

/// Inputs for a new job submission, the Scheduler's `Submit` contract.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub query: String,
    pub location: Option<String>,
    pub region: Option<String>,
    pub platforms: Option<Vec<String>>,
    pub priority: i32,
    pub user_tag: Option<String>,
    pub deadline: Option<DateTime<Utc>>,
}

struct WorkerDone {
    task_id: Uuid,
    job_id: Uuid,
    platform: String,
}

/// Runs the intake pipeline and the dispatch/worker loop.
pub struct Scheduler {
    pool: PgPool,
    registry: Arc<Registry>,
    adapters: Arc<AdapterRegistry>,
    config: SchedulerConfig,
    global_semaphore: Arc<Semaphore>,
    platform_semaphores: RwLock<HashMap<String, Arc<Semaphore>>>,
    job_cancellations: RwLock<HashMap<Uuid, CancellationToken>>,
    sync_bus: Option<SyncBusHandle>,
    job_records: JobRecordCache,
    retry_queue: RetryQueueHandle,
}

impl Scheduler {
    pub fn new(
        pool: PgPool,
        registry: Arc<Registry>,
        adapters: Arc<AdapterRegistry>,
        config: SchedulerConfig,
        sync_bus: Option<SyncBusHandle>,
    ) -> Self {
        Self {
            global_semaphore: Arc::new(Semaphore::new(config.max_global_concurrency)),
            pool,
            registry,
            adapters,
            config,
            platform_semaphores: RwLock::new(HashMap::new()),
            job_cancellations: RwLock::new(HashMap::new()),
            sync_bus,
            job_records: Arc::new(RwLock::new(HashMap::new())),
            retry_queue: RetryQueueHandle::new(),
        }
    }

    /// A clone of the shared handle to per-job accumulated records, so a
    /// terminal-job consumer can read (and drain) them once the job
    /// completes. Sub-tasks that never succeed contribute nothing.
    pub fn job_records(&self) -> JobRecordCache {
        Arc::clone(&self.job_records)
    }

    /// Remove and return a job's accumulated records, if any. Call once a
    /// job reaches a terminal state; left-over entries for jobs that never
    /// get drained (e.g. cancelled before any success) are harmless but
    /// should be cleaned up by the caller driving terminal-job handling.
    pub async fn take_job_records(&self, job_id: Uuid) -> HashMap<String, Vec<JobRecord>> {
        self.job_records.write().await.remove(&job_id).unwrap_or_default()
    }

    async fn platform_semaphore(&self, platform: &str) -> Arc<Semaphore> {
        if let Some(sem) = self.platform_semaphores.read().await.get(platform) {
            return Arc::clone(sem);
        }
        let permits = self
            .registry
            .platform(platform)
            .map(|p| p.max_concurrent_requests as usize)
            .unwrap_or(1)
            .max(1);
        let sem = Arc::new(Semaphore::new(permits));
        self.platform_semaphores
            .write()
            .await
            .insert(platform.to_string(), Arc::clone(&sem));
        sem
    }

    async fn publish(&self, event_type: SyncEventType, job_id: Option<Uuid>, platform: Option<String>, data: serde_json::Value) {
        let Some(bus) = &self.sync_bus else { return };
        let event = SyncEvent {
            event_id: Uuid::new_v4(),
            event_type,
            job_id,
            platform,
            data,
            priority: 1,
            timestamp: Utc::now(),
            ttl: Utc::now() + chrono::Duration::minutes(5),
            target_clients: None,
        };
        let _ = bus.publish(event).await;
    }

    /// `Submit(request) -> Job`: resolves a region (if not given) and a
    /// platform set (if not given) via the [`Registry`], then delegates to
    /// the Task Store's `CreateJob`.
    pub async fn submit(&self, request: SubmitRequest) -> Result<Job> {
        let region = request
            .region
            .unwrap_or_else(|| self.registry.resolve_region(request.location.as_deref().unwrap_or("")));

        let platforms = match request.platforms {
            Some(p) if !p.is_empty() => p,
            _ => self.registry.candidate_platforms(&region),
        };
        anyhow::ensure!(
            !platforms.is_empty(),
            "no dispatchable platforms resolved for region {region}"
        );

        for platform in &platforms {
            platform_health::ensure_row(
                &self.pool,
                platform,
                self.registry.platform(platform).map(|p| p.max_concurrent_requests as i32).unwrap_or(1),
            )
            .await?;
        }

        let job = jobs::create_job(
            &self.pool,
            &jobs::NewJobSpec {
                query: request.query,
                location: request.location,
                region,
                platforms,
                priority: request.priority,
                user_tag: request.user_tag,
                deadline: request.deadline,
            },
        )
        .await
        .context("failed to create job")?;

        self.job_cancellations
            .write()
            .await
            .insert(job.id, CancellationToken::new());

        self.publish(SyncEventType::JobCreated, Some(job.id), None, serde_json::json!({ "query": job.query })).await;

        Ok(job)
    }

    /// `Cancel(job_id)`: flips the job and its non-terminal sub-tasks to
    /// `Cancelled` in the Task Store, then signals any in-flight worker for
    /// this job to stop via its scoped [`CancellationToken`].
    pub async fn cancel(&self, job_id: Uuid) -> Result<bool> {
        let cancelled = jobs::cancel_job(&self.pool, job_id).await?;
        if let Some(token) = self.job_cancellations.write().await.remove(&job_id) {
            token.cancel();
        }
        if cancelled {
            self.publish(SyncEventType::JobFailed, Some(job_id), None, serde_json::json!({ "reason": "cancelled" })).await;
        }
        Ok(cancelled)
    }

    /// `Status(job_id)`: the job row plus its sub-tasks, the Scheduler's
    /// read path for callers who don't want the Task Store directly.
    pub async fn status(&self, job_id: Uuid) -> Result<Option<(Job, Vec<jobmux_db::models::PlatformTask>)>> {
        let Some(job) = jobs::get_job(&self.pool, job_id).await? else {
            return Ok(None);
        };
        let tasks = platform_tasks::list_for_job(&self.pool, job_id).await?;
        Ok(Some((job, tasks)))
    }

    /// Drive the dispatch loop until `shutdown` is cancelled. Polls the
    /// Task Store for pending sub-tasks, acquires global and per-platform
    /// permits (skipping a task for this tick if none are free -- it stays
    /// `pending` for the next poll), and spawns one worker per accepted
    /// sub-task.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let retry_loop = tokio::spawn(errors::run_retry_loop(
            self.pool.clone(),
            self.retry_queue.clone(),
            self.sync_bus.clone(),
            shutdown.clone(),
        ));

        self.run_dispatch_loop(shutdown).await?;
        retry_loop.await.context("retry queue loop panicked")?;
        Ok(())
    }

    async fn run_dispatch_loop(&self, shutdown: CancellationToken) -> Result<()> {
        let (tx, mut rx) = mpsc::channel::<WorkerDone>(self.config.max_global_concurrency * 2);
        let mut in_flight: usize = 0;

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            while let Ok(done) = rx.try_recv() {
                in_flight = in_flight.saturating_sub(1);
                tracing::debug!(
                    task_id = %done.task_id,
                    job_id = %done.job_id,
                    platform = %done.platform,
                    "sub-task worker finished"
                );
            }

            let ready = platform_tasks::list_pending(&self.pool, self.config.dispatch_batch)
                .await
                .context("failed to list pending platform tasks")?;

            let mut dispatched = 0usize;
            for task in ready {
                let Ok(global_permit) = Arc::clone(&self.global_semaphore).try_acquire_owned() else {
                    break;
                };
                let platform_sem = self.platform_semaphore(&task.platform).await;
                let Ok(platform_permit) = platform_sem.try_acquire_owned() else {
                    drop(global_permit);
                    continue;
                };

                if state::assign(&self.pool, task.id).await.is_err() {
                    // Lost the race to another dispatcher or the job went
                    // terminal between listing and assigning; skip it.
                    continue;
                }

                let cancel = self
                    .job_cancellations
                    .read()
                    .await
                    .get(&task.job_id)
                    .cloned()
                    .unwrap_or_default();

                let pool = self.pool.clone();
                let registry = Arc::clone(&self.registry);
                let adapters = Arc::clone(&self.adapters);
                let config = self.config.clone();
                let sync_bus = self.sync_bus.clone();
                let job_records = Arc::clone(&self.job_records);
                let retry_queue = self.retry_queue.clone();
                let tx = tx.clone();
                let task_id = task.id;
                let job_id = task.job_id;
                let platform = task.platform.clone();

                in_flight += 1;
                dispatched += 1;

                tokio::spawn(async move {
                    let _global_permit = global_permit;
                    let _platform_permit = platform_permit;
                    run_worker(
                        &pool,
                        &registry,
                        &adapters,
                        &config,
                        sync_bus.as_ref(),
                        &job_records,
                        &retry_queue,
                        task_id,
                        job_id,
                        &platform,
                        cancel,
                    )
                    .await;
                    let _ = tx
                        .send(WorkerDone {
                            task_id,
                            job_id,
                            platform,
                        })
                        .await;
                });
            }

            if dispatched == 0 {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    _ = shutdown.cancelled() => break,
                }
            }
        }

        // Drain outstanding workers before returning.
        while in_flight > 0 {
            match rx.recv().await {
                Some(done) => {
                    in_flight -= 1;
                    tracing::debug!(task_id = %done.task_id, "sub-task worker finished during shutdown drain");
                }
                None => break,
            }
        }
        Ok(())
    }
}

/// Run one sub-task to completion: mark it `Processing`, invoke the
/// adapter under a deadline, and record the outcome -- success updates
/// platform health and the job's aggregated status; failure hands off to
/// the Error Engine for classification and recovery.
async fn run_worker(
    pool: &PgPool,
    registry: &Registry,
    adapters: &AdapterRegistry,
    config: &SchedulerConfig,
    sync_bus: Option<&SyncBusHandle>,
    job_records: &JobRecordCache,
    retry_queue: &RetryQueueHandle,
    task_id: Uuid,
    job_id: Uuid,
    platform: &str,
    cancel: CancellationToken,
) {
    if state::start(pool, task_id).await.is_err() {
        return;
    }

    let _ = events::insert_event(
        pool,
        &events::NewEvent {
            job_id,
            platform: Some(platform.to_string()),
            event_type: "SubTaskStarted".to_string(),
            from_status: Some("assigned".to_string()),
            to_status: Some("processing".to_string()),
            payload: serde_json::json!({}),
        },
    )
    .await;

    let publish = |event_type: SyncEventType, data: serde_json::Value| async move {
        if let Some(bus) = sync_bus {
            let event = SyncEvent {
                event_id: Uuid::new_v4(),
                event_type,
                job_id: Some(job_id),
                platform: Some(platform.to_string()),
                data,
                priority: 1,
                timestamp: Utc::now(),
                ttl: Utc::now() + chrono::Duration::minutes(5),
                target_clients: None,
            };
            let _ = bus.publish(event).await;
        }
    };
    publish(SyncEventType::SubTaskStarted, serde_json::json!({})).await;

    let Ok(Some(job)) = jobs::get_job(pool, job_id).await else {
        return;
    };
    let deadline = job.deadline.unwrap_or_else(|| Utc::now() + chrono::Duration::from_std(config.default_task_timeout).unwrap());

    let Some(adapter) = adapters.get(platform) else {
        handle_worker_failure(
            pool,
            registry,
            retry_queue,
            task_id,
            job_id,
            platform,
            ErrorCategory::Platform,
            "no adapter registered for platform",
        )
        .await;
        return;
    };

    let search = adapter.search(&job.query, job.location.as_deref().unwrap_or(""), 100, deadline);

    let outcome = tokio::select! {
        result = search => Ok(result),
        _ = cancel.cancelled() => Err(()),
    };

    match outcome {
        Err(()) => {
            let _ = state::cancel(pool, task_id).await;
        }
        Ok(Ok(result)) => {
            let payload_hash = {
                use sha2::{Digest, Sha256};
                let mut hasher = Sha256::new();
                hasher.update(serde_json::to_vec(&result.records).unwrap_or_default());
                hex::encode(hasher.finalize())
            };
            let _ = platform_tasks::complete(
                pool,
                task_id,
                jobmux_db::models::PlatformTaskStatus::Processing,
                result.records.len() as i32,
                &payload_hash,
            )
            .await;
            let _ = events::insert_event(
                pool,
                &events::NewEvent {
                    job_id,
                    platform: Some(platform.to_string()),
                    event_type: "SubTaskCompleted".to_string(),
                    from_status: Some("processing".to_string()),
                    to_status: Some("completed".to_string()),
                    payload: serde_json::json!({ "record_count": result.records.len() }),
                },
            )
            .await;
            let _ = platform_health::record_success(pool, platform, result.latency_ms as f64).await;
            job_records
                .write()
                .await
                .entry(job_id)
                .or_default()
                .insert(platform.to_string(), result.records.clone());
            let _ = jobs::recompute_job_status(pool, job_id).await;
            publish(SyncEventType::SubTaskCompleted, serde_json::json!({ "record_count": result.records.len() })).await;
        }
        Ok(Err(error)) => {
            let category = adapter_category_to_error_category(error.category);
            handle_worker_failure(pool, registry, retry_queue, task_id, job_id, platform, category, &error.message).await;
        }
    }
}

fn adapter_category_to_error_category(category: crate::adapter::AdapterErrorCategory) -> ErrorCategory {
    use crate::adapter::AdapterErrorCategory as A;
    use ErrorCategory as E;
    match category {
        A::Network => E::Network,
        A::Authentication => E::Authentication,
        A::RateLimit => E::RateLimit,
        A::Parsing => E::Parsing,
        A::Validation => E::Validation,
        A::Timeout => E::Timeout,
        A::Resource => E::Resource,
        A::Platform => E::Platform,
        A::System => E::System,
        A::Unknown => E::Unknown,
    }
}

async fn handle_worker_failure(
    pool: &PgPool,
    registry: &Registry,
    retry_queue: &RetryQueueHandle,
    task_id: Uuid,
    job_id: Uuid,
    platform: &str,
    category: ErrorCategory,
    message: &str,
) {
    if state::fail(pool, task_id).await.is_ok() {
        let _ = events::insert_event(
            pool,
            &events::NewEvent {
                job_id,
                platform: Some(platform.to_string()),
                event_type: "SubTaskFailed".to_string(),
                from_status: Some("processing".to_string()),
                to_status: Some("failed".to_string()),
                payload: serde_json::json!({ "category": format!("{category:?}"), "message": message }),
            },
        )
        .await;
    }

    let task = platform_tasks::get_platform_task(pool, task_id).await.ok().flatten();
    let attempt = task.map(|t| t.attempt).unwrap_or(0);

    let Ok(Some(job)) = jobs::get_job(pool, job_id).await else {
        return;
    };
    let used: Vec<String> = platform_tasks::list_for_job(pool, job_id)
        .await
        .unwrap_or_default()
        .into_iter()
        .map(|t| t.platform)
        .collect();
    let fallback_platforms: Vec<String> = registry
        .candidate_platforms(&job.region)
        .into_iter()
        .filter(|p| !used.contains(p))
        .collect();

    let context = ErrorContext {
        critical_job: job.priority >= 3,
        fallback_platforms,
    };

    let _ = errors::handle_failure(pool, task_id, job_id, platform, category, message, attempt, &context, retry_queue).await;
    let _ = platform_health::record_failure(pool, platform).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_bounds_are_sane() {
        let config = SchedulerConfig::default();
        assert!(config.max_global_concurrency > 0);
        assert!(config.dispatch_batch > 0);
    }

    #[test]
    fn adapter_error_categories_map_onto_error_categories() {
        use crate::adapter::AdapterErrorCategory as A;
        use ErrorCategory as E;
        assert_eq!(adapter_category_to_error_category(A::Network), E::Network);
        assert_eq!(adapter_category_to_error_category(A::Authentication), E::Authentication);
        assert_eq!(adapter_category_to_error_category(A::System), E::System);
    }
}
