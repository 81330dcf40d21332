//! Error Engine (C4): classifies sub-task failures and decides the
//! recovery action -- retry with backoff, rollback, fallback, escalate, or
//! abort.

mod backoff;
mod classify;
mod retry_queue;

pub use backoff::{retry_delay, DelayPolicy};
pub use classify::{classify, ErrorCategory, ErrorSeverity};
pub use retry_queue::{run_retry_loop, RetryQueueHandle};

use anyhow::Result;
use rand::Rng;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use jobmux_db::queries::{events, jobs, platform_tasks};

/// Context accompanying a raw adapter failure, carried alongside the
/// classified category so the decision table can be consulted.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub critical_job: bool,
    pub fallback_platforms: Vec<String>,
}

/// What the Error Engine decided to do about a sub-task failure.
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    Retry { delay: std::time::Duration },
    Fallback { platform: String },
    Escalate,
    Abort,
    Skip,
}

/// Maximum attempts for a category.
pub fn max_attempts(category: ErrorCategory) -> i32 {
    match category {
        ErrorCategory::Network => 3,
        ErrorCategory::RateLimit => 5,
        ErrorCategory::Timeout => 3,
        ErrorCategory::Platform => 3,
        ErrorCategory::Parsing => 2,
        ErrorCategory::Resource => 2,
        ErrorCategory::Authentication => 1,
        ErrorCategory::Validation => 1,
        ErrorCategory::System => 1,
        ErrorCategory::Unknown => 2,
    }
}

/// Default recovery action for a category, before context overrides and
/// severity promotion are applied.
fn default_action(category: ErrorCategory, attempt: i32) -> RecoveryAction {
    let exhausted = attempt >= max_attempts(category);
    match category {
        ErrorCategory::Network | ErrorCategory::Timeout | ErrorCategory::Parsing | ErrorCategory::Unknown => {
            if exhausted {
                RecoveryAction::Escalate
            } else {
                RecoveryAction::Retry {
                    delay: retry_delay(DelayPolicy::for_category(category), attempt),
                }
            }
        }
        ErrorCategory::RateLimit => {
            if exhausted {
                RecoveryAction::Escalate
            } else {
                RecoveryAction::Retry {
                    delay: retry_delay(DelayPolicy::for_category(category), attempt),
                }
            }
        }
        ErrorCategory::Platform => {
            if exhausted {
                RecoveryAction::Fallback {
                    platform: String::new(),
                }
            } else {
                RecoveryAction::Retry {
                    delay: retry_delay(DelayPolicy::for_category(category), attempt),
                }
            }
        }
        ErrorCategory::Resource | ErrorCategory::Authentication => RecoveryAction::Escalate,
        ErrorCategory::Validation => RecoveryAction::Skip,
        ErrorCategory::System => RecoveryAction::Abort,
    }
}

/// Decide the recovery action for a sub-task failure, honoring context
/// overrides (fallback platforms available for an exhausted `Platform`
/// failure) and severity promotion is left to [`promote_severity`] for the
/// caller to apply to the persisted error record.
pub fn decide(category: ErrorCategory, attempt: i32, context: &ErrorContext) -> RecoveryAction {
    let action = default_action(category, attempt);
    match action {
        RecoveryAction::Fallback { .. } => {
            if let Some(platform) = context.fallback_platforms.first() {
                RecoveryAction::Fallback {
                    platform: platform.clone(),
                }
            } else {
                RecoveryAction::Escalate
            }
        }
        other => other,
    }
}

/// Severity is promoted one level after every two accumulated failures on
/// the same sub-task, capped at `Critical`.
pub fn promote_severity(base: ErrorSeverity, attempt: i32) -> ErrorSeverity {
    let promotions = (attempt / 2).max(0) as u8;
    let mut severity = base;
    for _ in 0..promotions {
        severity = severity.promote();
    }
    severity
}

/// Jittered sleep duration for a random backoff delay (`[0.8, 1.2]`
/// multiplicative jitter).
pub fn jitter(base: std::time::Duration) -> std::time::Duration {
    let factor = rand::thread_rng().gen_range(0.8..=1.2);
    std::time::Duration::from_secs_f64(base.as_secs_f64() * factor)
}

/// Handle a sub-task failure end to end: record the error, transition the
/// sub-task to `Failed`, decide the recovery action, and apply it --
/// scheduling a retry-to-pending on `retry_queue`, a fallback substitution,
/// or escalating the job. Returns the decided action so the caller
/// (Scheduler) can observe it.
pub async fn handle_failure(
    pool: &PgPool,
    task_id: Uuid,
    job_id: Uuid,
    platform: &str,
    category: ErrorCategory,
    message: &str,
    attempt: i32,
    context: &ErrorContext,
    retry_queue: &RetryQueueHandle,
) -> Result<RecoveryAction> {
    let severity = promote_severity(ErrorSeverity::default_for(category), attempt);

    platform_tasks::record_error(
        pool,
        task_id,
        &json!({ "category": format!("{category:?}"), "message": message, "severity": format!("{severity:?}") }),
    )
    .await?;

    events::insert_event(
        pool,
        &events::NewEvent {
            job_id,
            platform: Some(platform.to_string()),
            event_type: "ErrorOccurred".to_string(),
            from_status: None,
            to_status: None,
            payload: json!({ "category": format!("{category:?}"), "severity": format!("{severity:?}"), "message": message }),
        },
    )
    .await?;

    let action = decide(category, attempt, context);

    match &action {
        RecoveryAction::Retry { delay } => {
            events::insert_event(
                pool,
                &events::NewEvent {
                    job_id,
                    platform: Some(platform.to_string()),
                    event_type: "RetryScheduled".to_string(),
                    from_status: None,
                    to_status: None,
                    payload: json!({ "attempt": attempt + 1, "delay_ms": delay.as_millis() as u64 }),
                },
            )
            .await?;
            retry_queue
                .schedule(task_id, job_id, platform.to_string(), attempt, *delay)
                .await;
        }
        RecoveryAction::Fallback { platform: new_platform } => {
            let old_task = platform_tasks::get_platform_task(pool, task_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("platform task {task_id} not found"))?;
            platform_tasks::substitute_fallback(pool, job_id, old_task.id, new_platform).await?;
            events::insert_event(
                pool,
                &events::NewEvent {
                    job_id,
                    platform: Some(platform.to_string()),
                    event_type: "FallbackApplied".to_string(),
                    from_status: None,
                    to_status: None,
                    payload: json!({ "from": platform, "to": new_platform }),
                },
            )
            .await?;
        }
        RecoveryAction::Escalate => {
            jobs::mark_requires_manual_intervention(pool, job_id).await?;
            events::insert_event(
                pool,
                &events::NewEvent {
                    job_id,
                    platform: Some(platform.to_string()),
                    event_type: "NeedsAttention".to_string(),
                    from_status: None,
                    to_status: None,
                    payload: json!({ "severity": format!("{severity:?}") }),
                },
            )
            .await?;
        }
        RecoveryAction::Abort | RecoveryAction::Skip => {}
    }

    jobs::recompute_job_status(pool, job_id).await?;

    Ok(action)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_retries_until_exhausted_then_escalates() {
        let ctx = ErrorContext::default();
        assert!(matches!(
            decide(ErrorCategory::Network, 1, &ctx),
            RecoveryAction::Retry { .. }
        ));
        assert!(matches!(
            decide(ErrorCategory::Network, 3, &ctx),
            RecoveryAction::Escalate
        ));
    }

    #[test]
    fn authentication_never_retries() {
        let ctx = ErrorContext::default();
        assert_eq!(decide(ErrorCategory::Authentication, 1, &ctx), RecoveryAction::Escalate);
    }

    #[test]
    fn validation_is_skipped_not_retried() {
        let ctx = ErrorContext::default();
        assert_eq!(decide(ErrorCategory::Validation, 1, &ctx), RecoveryAction::Skip);
    }

    #[test]
    fn system_aborts() {
        let ctx = ErrorContext::default();
        assert_eq!(decide(ErrorCategory::System, 1, &ctx), RecoveryAction::Abort);
    }

    #[test]
    fn platform_falls_back_when_exhausted_and_fallback_available() {
        let ctx = ErrorContext {
            critical_job: false,
            fallback_platforms: vec!["glassdoor".to_string()],
        };
        let action = decide(ErrorCategory::Platform, 3, &ctx);
        assert_eq!(
            action,
            RecoveryAction::Fallback {
                platform: "glassdoor".to_string()
            }
        );
    }

    #[test]
    fn platform_escalates_when_exhausted_and_no_fallback() {
        let ctx = ErrorContext::default();
        assert_eq!(decide(ErrorCategory::Platform, 3, &ctx), RecoveryAction::Escalate);
    }

    #[test]
    fn severity_promotes_every_two_attempts_capped_at_critical() {
        assert_eq!(promote_severity(ErrorSeverity::Low, 0), ErrorSeverity::Low);
        assert_eq!(promote_severity(ErrorSeverity::Low, 2), ErrorSeverity::Medium);
        assert_eq!(promote_severity(ErrorSeverity::Low, 4), ErrorSeverity::High);
        assert_eq!(promote_severity(ErrorSeverity::Low, 100), ErrorSeverity::Critical);
    }
}
