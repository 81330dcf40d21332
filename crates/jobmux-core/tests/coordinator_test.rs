//! Integration tests for the Coordinator's submit -> dispatch -> terminal
//! pipeline (Integrity Engine + Notifier) against a real database.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use jobmux_db::models::JobStatus;
use jobmux_db::queries::jobs::JobFilter;
use jobmux_test_utils::{create_test_db, drop_test_db};

use jobmux_core::adapter::{Adapter, AdapterError, AdapterErrorCategory, AdapterRegistry, AdapterResult, JobRecord};
use jobmux_core::coordinator::{Coordinator, CoordinatorConfig};
use jobmux_core::notifier::LogChannel;
use jobmux_core::registry::Registry;
use jobmux_core::scheduler::{SchedulerConfig, SubmitRequest};

struct AlwaysSucceeds {
    platform: &'static str,
    count: usize,
}

#[async_trait]
impl Adapter for AlwaysSucceeds {
    fn name(&self) -> &str {
        self.platform
    }

    async fn search(
        &self,
        query: &str,
        _location: &str,
        _limit: u32,
        _deadline: DateTime<Utc>,
    ) -> Result<AdapterResult, AdapterError> {
        Ok(AdapterResult {
            records: (0..self.count)
                .map(|i| JobRecord {
                    title: format!("{query} #{i}"),
                    company: "Acme".to_string(),
                    location: "NYC".to_string(),
                    date_posted: Some(Utc::now()),
                    description: None,
                    salary: None,
                    job_url: None,
                    source_platform: self.platform.to_string(),
                })
                .collect(),
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

/// Fails with a retryable `Network` error on its first two calls, then
/// succeeds -- exercises the retry queue's Retry -> Pending -> re-dispatch
/// path end to end.
struct FailsTwiceThenSucceeds {
    attempts: AtomicUsize,
}

#[async_trait]
impl Adapter for FailsTwiceThenSucceeds {
    fn name(&self) -> &str {
        "indeed"
    }

    async fn search(
        &self,
        query: &str,
        _location: &str,
        _limit: u32,
        _deadline: DateTime<Utc>,
    ) -> Result<AdapterResult, AdapterError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt < 3 {
            return Err(AdapterError {
                category: AdapterErrorCategory::Network,
                message: format!("connection reset (attempt {attempt})"),
                retryable: true,
            });
        }
        Ok(AdapterResult {
            records: vec![JobRecord {
                title: format!("{query} #0"),
                company: "Acme".to_string(),
                location: "NYC".to_string(),
                date_posted: Some(Utc::now()),
                description: None,
                salary: None,
                job_url: None,
                source_platform: "indeed".to_string(),
            }],
            latency_ms: 5,
            cursor: None,
        })
    }
}

fn test_registry() -> Arc<Registry> {
    Arc::new(Registry::default_catalog())
}

fn test_channels() -> HashMap<String, Box<dyn jobmux_core::notifier::Channel>> {
    let mut channels: HashMap<String, Box<dyn jobmux_core::notifier::Channel>> = HashMap::new();
    channels.insert("log".to_string(), Box::new(LogChannel));
    channels
}

#[tokio::test]
async fn completed_job_gets_an_integrity_report_and_notification() {
    let (pool, db_name) = create_test_db().await;

    let mut adapters = AdapterRegistry::new();
    adapters.register(AlwaysSucceeds {
        platform: "linkedin",
        count: 3,
    });

    let coordinator = Arc::new(Coordinator::new(
        pool.clone(),
        test_registry(),
        Arc::new(adapters),
        SchedulerConfig {
            poll_interval: Duration::from_millis(20),
            ..SchedulerConfig::default()
        },
        test_channels(),
        CoordinatorConfig {
            terminal_poll_interval: Duration::from_millis(20),
            health_check_interval: Duration::from_secs(3600),
            ..CoordinatorConfig::default()
        },
        None,
        16,
    ));

    let job = coordinator
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
    let coordinator_clone = Arc::clone(&coordinator);
    let handle = tokio::spawn(async move { coordinator_clone.run(shutdown_clone).await });

    let mut report = None;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if let Some(found) = coordinator.integrity_report(job.id).await.unwrap() {
            report = Some(found);
            break;
        }
    }
    let report = report.expect("integrity report should be produced once the job completes");
    assert!(report.overall_quality > 0.0);
    assert_eq!(report.platform_summaries.len(), 1);

    let (job_row, _) = coordinator.status(job.id).await.unwrap().expect("job exists");
    assert_eq!(job_row.status, JobStatus::Completed);

    shutdown.cancel();
    let _ = handle.await;

    pool.close().await;
    drop_test_db(&db_name).await;
}

/// Scenario S2: a platform fails twice with a retryable error, gets
/// requeued by the retry queue both times, and succeeds on the third
/// attempt -- the job still completes and the sub-task's event log reads
/// `[Started, Failed, RetryScheduled, Started, Failed, RetryScheduled,
/// Started, Completed]`.
#[tokio::test]
async fn platform_recovers_after_two_retries_and_job_completes() {
    let (pool, db_name) = create_test_db().await;

    let mut adapters = AdapterRegistry::new();
    adapters.register(AlwaysSucceeds {
        platform: "linkedin",
        count: 2,
    });
    adapters.register(FailsTwiceThenSucceeds {
        attempts: AtomicUsize::new(0),
    });

    let coordinator = Arc::new(Coordinator::new(
        pool.clone(),
        test_registry(),
        Arc::new(adapters),
        SchedulerConfig {
            poll_interval: Duration::from_millis(20),
            ..SchedulerConfig::default()
        },
        test_channels(),
        CoordinatorConfig {
            terminal_poll_interval: Duration::from_millis(20),
            health_check_interval: Duration::from_secs(3600),
            ..CoordinatorConfig::default()
        },
        None,
        16,
    ));

    let job = coordinator
        .submit(SubmitRequest {
            query: "rust engineer".to_string(),
            location: None,
            region: None,
            platforms: Some(vec!["linkedin".to_string(), "indeed".to_string()]),
            priority: 1,
            user_tag: None,
            deadline: None,
        })
        .await
        .expect("submit should succeed");

    let shutdown = CancellationToken::new();
    let shutdown_clone = shutdown.clone();
    let coordinator_clone = Arc::clone(&coordinator);
    let handle = tokio::spawn(async move { coordinator_clone.run(shutdown_clone).await });

    let mut reached_completed = false;
    for _ in 0..200 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let (job_row, _) = coordinator.status(job.id).await.unwrap().expect("job exists");
        if job_row.status == JobStatus::Completed {
            reached_completed = true;
            break;
        }
    }
    assert!(reached_completed, "job should complete once indeed recovers on its third attempt");

    let events = jobmux_db::queries::events::replay_all(&pool, job.id)
        .await
        .unwrap();
    let sequence: Vec<&str> = events
        .iter()
        .filter(|e| e.platform.as_deref() == Some("indeed"))
        .filter(|e| {
            matches!(
                e.event_type.as_str(),
                "SubTaskStarted" | "SubTaskFailed" | "RetryScheduled" | "SubTaskCompleted"
            )
        })
        .map(|e| e.event_type.as_str())
        .collect();

    assert_eq!(
        sequence,
        vec![
            "SubTaskStarted",
            "SubTaskFailed",
            "RetryScheduled",
            "SubTaskStarted",
            "SubTaskFailed",
            "RetryScheduled",
            "SubTaskStarted",
            "SubTaskCompleted",
        ]
    );

    shutdown.cancel();
    let _ = handle.await;

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn failed_job_skips_notification_channel_but_still_gets_a_report() {
    let (pool, db_name) = create_test_db().await;

    let mut adapters = AdapterRegistry::new();
    adapters.register(AlwaysFails);

    let coordinator = Arc::new(Coordinator::new(
        pool.clone(),
        test_registry(),
        Arc::new(adapters),
        SchedulerConfig {
            poll_interval: Duration::from_millis(20),
            ..SchedulerConfig::default()
        },
        test_channels(),
        CoordinatorConfig {
            terminal_poll_interval: Duration::from_millis(20),
            health_check_interval: Duration::from_secs(3600),
            ..CoordinatorConfig::default()
        },
        None,
        16,
    ));

    let job = coordinator
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
    let coordinator_clone = Arc::clone(&coordinator);
    let handle = tokio::spawn(async move { coordinator_clone.run(shutdown_clone).await });

    let mut reached_failed = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let (job_row, _) = coordinator.status(job.id).await.unwrap().expect("job exists");
        if job_row.status == JobStatus::Failed {
            reached_failed = true;
            break;
        }
    }
    assert!(reached_failed, "job should reach Failed once its only platform is exhausted");

    let filter = JobFilter {
        status: Some(JobStatus::Failed),
        user_tag: None,
        limit: 10,
    };
    let failed_jobs = coordinator.list_jobs(&filter).await.unwrap();
    assert!(failed_jobs.iter().any(|j| j.id == job.id));

    shutdown.cancel();
    let _ = handle.await;

    pool.close().await;
    drop_test_db(&db_name).await;
}

/// A notification left `Pending` (e.g. by a prior `Retrying -> Pending`
/// transition) gets redelivered by the Coordinator's background sweep
/// without any caller invoking `flush_pending_notifications` directly.
#[tokio::test]
async fn pending_notification_is_redelivered_by_the_background_sweep() {
    let (pool, db_name) = create_test_db().await;

    let coordinator = Arc::new(Coordinator::new(
        pool.clone(),
        test_registry(),
        Arc::new(AdapterRegistry::new()),
        SchedulerConfig::default(),
        test_channels(),
        CoordinatorConfig {
            terminal_poll_interval: Duration::from_secs(3600),
            health_check_interval: Duration::from_secs(3600),
            notification_retry_interval: Duration::from_millis(30),
            ..CoordinatorConfig::default()
        },
        None,
        16,
    ));

    let message = jobmux_db::queries::notification_messages::insert_notification(
        &pool,
        &jobmux_db::queries::notification_messages::NewNotification {
            job_id: uuid::Uuid::new_v4(),
            channel: "log".to_string(),
            recipient: "ops@example.com".to_string(),
            priority: 1,
            subject: "stuck notification".to_string(),
            body: "should be redelivered by the sweep".to_string(),
            metadata: serde_json::json!({}),
        },
    )
    .await
    .expect("insert should succeed");

    let shutdown = CancellationToken::new();
    let shutdown_clone = shutdown.clone();
    let coordinator_clone = Arc::clone(&coordinator);
    let handle = tokio::spawn(async move { coordinator_clone.run(shutdown_clone).await });

    let mut delivered = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(30)).await;
        let row = jobmux_db::queries::notification_messages::get(&pool, message.id)
            .await
            .unwrap()
            .expect("notification row exists");
        if row.status == jobmux_db::models::DeliveryStatus::Delivered {
            delivered = true;
            break;
        }
    }
    assert!(delivered, "pending notification should be redelivered by the background sweep");

    shutdown.cancel();
    let _ = handle.await;

    pool.close().await;
    drop_test_db(&db_name).await;
}
