//! `jobmux status` command: show a single job's progress and per-platform
//! task status.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use jobmux_db::models::JobStatus;
use jobmux_db::queries::{jobs, platform_tasks};

/// Outcome used by the caller to pick a process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusOutcome {
    /// Job reached `Completed`.
    Completed,
    /// Job reached `Failed` (all requested platforms exhausted retries).
    Failed,
    /// Still in flight, or `Cancelled`.
    InProgress,
}

/// Print a job's status and return an outcome the caller maps to an exit
/// code.
pub async fn run_status(pool: &PgPool, job_id: Uuid) -> Result<StatusOutcome> {
    let job = jobs::get_job(pool, job_id)
        .await?
        .with_context(|| format!("job {job_id} not found"))?;

    println!("Job: {} ({})", job.query, job.id);
    println!("Status: {}", job.status);
    println!("Region: {}", job.region);
    println!("Platforms: {}", job.platforms.join(", "));
    if job.requires_manual_intervention {
        println!("Requires manual intervention: yes");
    }
    println!(
        "Submitted: {}",
        job.submitted_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!();

    let tasks = platform_tasks::list_for_job(pool, job_id).await?;
    println!("Platform tasks:");
    for task in &tasks {
        if task.hidden {
            continue;
        }
        let status_icon = match task.status.to_string().as_str() {
            "pending" => ".",
            "assigned" => ">",
            "processing" => "*",
            "completed" => "+",
            "failed" => "!",
            "cancelled" => "x",
            _ => " ",
        };
        println!(
            "  [{}] {} (attempt {}, {}, {} records)",
            status_icon,
            task.platform,
            task.attempt,
            task.status,
            task.record_count.unwrap_or(0),
        );
    }

    Ok(match job.status {
        JobStatus::Completed => StatusOutcome::Completed,
        JobStatus::Failed => StatusOutcome::Failed,
        _ => StatusOutcome::InProgress,
    })
}
