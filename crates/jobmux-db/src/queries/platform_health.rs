//! Database query functions for the `platform_health` table.

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::PlatformHealth;

/// Ensure a health row exists for a platform, seeding `Idle` defaults.
pub async fn ensure_row(pool: &PgPool, platform: &str, capacity: i32) -> Result<()> {
    sqlx::query(
        "INSERT INTO platform_health (platform, status, success_rate, avg_response_ms, \
                                       consecutive_failures, current_load, capacity) \
         VALUES ($1, 'idle', 1.0, 0.0, 0, 0, $2) \
         ON CONFLICT (platform) DO NOTHING",
    )
    .bind(platform)
    .bind(capacity)
    .execute(pool)
    .await
    .with_context(|| format!("failed to seed platform health row for {platform}"))?;
    Ok(())
}

pub async fn get(pool: &PgPool, platform: &str) -> Result<Option<PlatformHealth>> {
    let health = sqlx::query_as::<_, PlatformHealth>(
        "SELECT * FROM platform_health WHERE platform = $1",
    )
    .bind(platform)
    .fetch_optional(pool)
    .await
    .context("failed to fetch platform health")?;
    Ok(health)
}

pub async fn list_all(pool: &PgPool) -> Result<Vec<PlatformHealth>> {
    let rows = sqlx::query_as::<_, PlatformHealth>(
        "SELECT * FROM platform_health ORDER BY platform",
    )
    .fetch_all(pool)
    .await
    .context("failed to list platform health")?;
    Ok(rows)
}

/// Update health after a sub-task success: reset consecutive failures,
/// fold the observed latency into the rolling average (exponential
/// smoothing, alpha = 0.2), and bump the success rate toward 1.0.
pub async fn record_success(pool: &PgPool, platform: &str, latency_ms: f64) -> Result<()> {
    sqlx::query(
        "UPDATE platform_health \
         SET status = 'active', \
             consecutive_failures = 0, \
             success_rate = success_rate * 0.8 + 0.2, \
             avg_response_ms = avg_response_ms * 0.8 + $1 * 0.2, \
             last_success_at = NOW(), \
             updated_at = NOW() \
         WHERE platform = $2",
    )
    .bind(latency_ms)
    .bind(platform)
    .execute(pool)
    .await
    .context("failed to record platform success")?;
    Ok(())
}

/// Update health after a sub-task failure.
pub async fn record_failure(pool: &PgPool, platform: &str) -> Result<()> {
    sqlx::query(
        "UPDATE platform_health \
         SET status = 'error', \
             consecutive_failures = consecutive_failures + 1, \
             success_rate = success_rate * 0.8, \
             last_failure_at = NOW(), \
             updated_at = NOW() \
         WHERE platform = $1",
    )
    .bind(platform)
    .execute(pool)
    .await
    .context("failed to record platform failure")?;
    Ok(())
}

/// Adjust the current in-flight load counter. Called by the Scheduler on
/// dispatch (`delta = 1`) and on sub-task completion (`delta = -1`).
pub async fn adjust_load(pool: &PgPool, platform: &str, delta: i32) -> Result<()> {
    sqlx::query("UPDATE platform_health SET current_load = current_load + $1 WHERE platform = $2")
        .bind(delta)
        .bind(platform)
        .execute(pool)
        .await
        .context("failed to adjust platform load")?;
    Ok(())
}

/// Flip a platform to `Offline` when it has exceeded the configured
/// consecutive-failure threshold.
pub async fn mark_offline_if_unhealthy(pool: &PgPool, platform: &str, threshold: i32) -> Result<()> {
    sqlx::query(
        "UPDATE platform_health SET status = 'offline' \
         WHERE platform = $1 AND consecutive_failures >= $2",
    )
    .bind(platform)
    .bind(threshold)
    .execute(pool)
    .await
    .context("failed to mark platform offline")?;
    Ok(())
}
