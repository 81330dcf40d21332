//! Integration tests for the Scheduler's submit/dispatch/cancel pipeline
//! against a real database.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use jobmux_db::models::{JobStatus, PlatformTaskStatus};
use jobmux_db::queries::platform_tasks;
use jobmux_test_utils::{create_test_db, drop_test_db};

use jobmux_core::adapter::{Adapter, AdapterError, AdapterErrorCategory, AdapterResult, JobRecord};
use jobmux_core::adapter::AdapterRegistry;
use jobmux_core::registry::Registry;
use jobmux_core::scheduler::{Scheduler, SchedulerConfig, SubmitRequest};

struct AlwaysSucceeds;

#[async_trait]
impl Adapter for AlwaysSucceeds {
    fn name(&self) -> &str {
        "linkedin"
    }

    async fn search(
        &self,
        query: &str,
        _location: &str,
        _limit: u32,
        _deadline: DateTime<Utc>,
    ) -> Result<AdapterResult, AdapterError> {
        Ok(AdapterResult {
            records: vec![JobRecord {
                title: query.to_string(),
                company: "Acme".to_string(),
                location: "NYC".to_string(),
                date_posted: Some(Utc::now()),
                description: None,
                salary: None,
                job_url: None,
                source_platform: "linkedin".to_string(),
            }],
            latency_ms: 5,
            cursor: None,
        })
    }
}

struct AlwaysFails;

#[async_trait]
impl Adapter for AlwaysFails {
    fn name(&self) -> &str {
        "indeed"
    }

    async fn search(
        &self,
        _query: &str,
        _location: &str,
        _limit: u32,
        _deadline: DateTime<Utc>,
    ) -> Result<AdapterResult, AdapterError> {
        Err(AdapterError {
            category: AdapterErrorCategory::Authentication,
            message: "401 unauthorized".to_string(),
            retryable: false,
        })
    }
}

fn test_registry() -> Arc<Registry> {
    Arc::new(Registry::default_catalog())
}

#[tokio::test]
async fn submit_creates_job_with_resolved_platforms() {
    let (pool, db_name) = create_test_db().await;

    let mut adapters = AdapterRegistry::new();
    adapters.register(AlwaysSucceeds);
    let scheduler = Scheduler::new(pool.clone(), test_registry(), Arc::new(adapters), SchedulerConfig::default(), None);

    let job = scheduler
        .submit(SubmitRequest {
            query: "rust engineer".to_string(),
            location: Some("San Francisco, California".to_string()),
            region: None,
            platforms: None,
            priority: 1,
            user_tag: None,
            deadline: None,
        })
        .await
        .expect("submit should succeed");

    assert_eq!(job.region, "us");
    assert!(job.platforms.contains(&"linkedin".to_string()));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn dispatch_loop_completes_a_successful_sub_task() {
    let (pool, db_name) = create_test_db().await;

    let mut adapters = AdapterRegistry::new();
    adapters.register(AlwaysSucceeds);
    let scheduler = Arc::new(Scheduler::new(
        pool.clone(),
        test_registry(),
        Arc::new(adapters),
        SchedulerConfig {
            poll_interval: Duration::from_millis(20),
            ..SchedulerConfig::default()
        },
        None,
    ));

    let job = scheduler
        .submit(SubmitRequest {
            query: "rust engineer".to_string(),
            location: None,
            region: None,
            platforms: Some(vec!["linkedin".to_string()]),
            priority: 1,
            user_tag: None,
            deadline: None,
        })
        .await
        .expect("submit should succeed");

    let shutdown = CancellationToken::new();
    let shutdown_clone = shutdown.clone();
    let scheduler_clone = Arc::clone(&scheduler);
    let handle = tokio::spawn(async move { scheduler_clone.run(shutdown_clone).await });

    let mut completed = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let (job_row, tasks) = scheduler.status(job.id).await.unwrap().expect("job exists");
        if job_row.status == JobStatus::Completed {
            assert!(tasks.iter().all(|t| t.status == PlatformTaskStatus::Completed));
            completed = true;
            break;
        }
    }
    assert!(completed, "job should reach Completed within the polling window");

    shutdown.cancel();
    let _ = handle.await;

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn dispatch_loop_escalates_an_authentication_failure() {
    let (pool, db_name) = create_test_db().await;

    let mut adapters = AdapterRegistry::new();
    adapters.register(AlwaysFails);
    let scheduler = Arc::new(Scheduler::new(
        pool.clone(),
        test_registry(),
        Arc::new(adapters),
        SchedulerConfig {
            poll_interval: Duration::from_millis(20),
            ..SchedulerConfig::default()
        },
        None,
    ));

    let job = scheduler
        .submit(SubmitRequest {
            query: "rust engineer".to_string(),
            location: None,
            region: None,
            platforms: Some(vec!["indeed".to_string()]),
            priority: 1,
            user_tag: None,
            deadline: None,
        })
        .await
        .expect("submit should succeed");

    let shutdown = CancellationToken::new();
    let shutdown_clone = shutdown.clone();
    let scheduler_clone = Arc::clone(&scheduler);
    let handle = tokio::spawn(async move { scheduler_clone.run(shutdown_clone).await });

    let mut escalated = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let (job_row, _tasks) = scheduler.status(job.id).await.unwrap().expect("job exists");
        if job_row.requires_manual_intervention {
            escalated = true;
            break;
        }
    }
    assert!(escalated, "authentication failure should escalate for manual review");

    shutdown.cancel();
    let _ = handle.await;

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn cancel_before_dispatch_leaves_no_pending_tasks() {
    let (pool, db_name) = create_test_db().await;

    let adapters = Arc::new(AdapterRegistry::new());
    let scheduler = Scheduler::new(pool.clone(), test_registry(), adapters, SchedulerConfig::default(), None);

    let job = scheduler
        .submit(SubmitRequest {
            query: "rust engineer".to_string(),
            location: None,
            region: None,
            platforms: Some(vec!["linkedin".to_string()]),
            priority: 1,
            user_tag: None,
            deadline: None,
        })
        .await
        .expect("submit should succeed");

    let cancelled = scheduler.cancel(job.id).await.expect("cancel should succeed");
    assert!(cancelled);

    let pending = platform_tasks::list_pending(&pool, 100).await.unwrap();
    assert!(pending.iter().all(|t| t.job_id != job.id));

    pool.close().await;
    drop_test_db(&db_name).await;
}
