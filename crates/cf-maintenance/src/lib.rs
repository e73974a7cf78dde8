//! Scheduled maintenance (C10, §4.10): four independent periodic sweeps,
//! each its own spawned ticker loop in the shape of the queue bridge's
//! (`tokio::time::interval` + `tokio::select!` against a shutdown signal).

use anyhow::{Context, Result};
use sqlx::PgPool;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

/// Row-count threshold past which `applications` should be converted to a
/// range-partitioned table (§4.10). Conversion itself is an operator-run
/// migration, not an automated DDL step — see [`check_partition_headroom`].
pub const DEFAULT_PARTITION_THRESHOLD: i64 = 1_000_000;

#[derive(Clone)]
pub struct MaintenanceConfig {
    pub partition_check_interval: Duration,
    pub webhook_ttl_sweep_interval: Duration,
    pub webhook_event_ttl_days: i64,
    pub dlq_retry_interval: Duration,
    pub dlq_retry_batch_size: i64,
    pub orphan_sweep_interval: Duration,
    pub orphan_sweep_threshold: Duration,
    /// §9 open question: disabled (`None`) unless explicitly configured.
    pub stale_pending_sweep: Option<(Duration, Duration)>,
    pub partition_threshold: i64,
    pub partition_months_ahead: u32,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            partition_check_interval: Duration::from_secs(24 * 60 * 60),
            webhook_ttl_sweep_interval: Duration::from_secs(24 * 60 * 60),
            webhook_event_ttl_days: 30,
            dlq_retry_interval: Duration::from_secs(60 * 60),
            dlq_retry_batch_size: 100,
            orphan_sweep_interval: Duration::from_secs(5 * 60),
            orphan_sweep_threshold: Duration::from_secs(10 * 60),
            stale_pending_sweep: None,
            partition_threshold: DEFAULT_PARTITION_THRESHOLD,
            partition_months_ahead: 3,
        }
    }
}

/// Spawn every configured sweep as an independent ticker task, all sharing
/// one shutdown signal. Returns immediately; sweeps run until `shutdown`
/// fires.
pub fn spawn_all(pool: PgPool, cfg: MaintenanceConfig, shutdown: watch::Receiver<bool>) {
    spawn_loop("partition_check", pool.clone(), cfg.partition_check_interval, shutdown.clone(), {
        let threshold = cfg.partition_threshold;
        let months_ahead = cfg.partition_months_ahead;
        move |pool| {
            let threshold = threshold;
            Box::pin(async move {
                ensure_future_partitions(&pool, months_ahead).await?;
                check_partition_headroom(&pool, threshold).await?;
                Ok(())
            })
        }
    });

    spawn_loop("webhook_ttl_sweep", pool.clone(), cfg.webhook_ttl_sweep_interval, shutdown.clone(), {
        let ttl_days = cfg.webhook_event_ttl_days;
        move |pool| Box::pin(async move {
            let deleted = cf_db::delete_expired_webhook_events(&pool, ttl_days).await?;
            if deleted > 0 {
                info!(deleted, "expired webhook_events purged");
            }
            Ok(())
        })
    });

    spawn_loop("dlq_retry", pool.clone(), cfg.dlq_retry_interval, shutdown.clone(), {
        let batch_size = cfg.dlq_retry_batch_size;
        move |pool| Box::pin(async move { dlq_auto_retry(&pool, batch_size).await })
    });

    spawn_loop("orphan_sweep", pool.clone(), cfg.orphan_sweep_interval, shutdown.clone(), {
        let threshold = cfg.orphan_sweep_threshold;
        move |pool| Box::pin(async move {
            let reclaimed = cf_db::reclaim_orphan_processing_jobs(&pool, threshold).await?;
            if !reclaimed.is_empty() {
                warn!(count = reclaimed.len(), "reclaimed orphaned processing jobs");
            }
            Ok(())
        })
    });

    if let Some((interval, older_than)) = cfg.stale_pending_sweep {
        spawn_loop("stale_pending_sweep", pool, interval, shutdown, move |pool| {
            let older_than = older_than;
            Box::pin(async move {
                let cancelled = cf_db::cancel_stale_pending_applications(&pool, older_than).await?;
                if !cancelled.is_empty() {
                    info!(count = cancelled.len(), "auto-cancelled stale pending applications");
                }
                Ok(())
            })
        });
    }
}

type SweepFuture = std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send>>;

fn spawn_loop<F>(name: &'static str, pool: PgPool, interval: Duration, mut shutdown: watch::Receiver<bool>, sweep: F)
where
    F: Fn(PgPool) -> SweepFuture + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = sweep(pool.clone()).await {
                        warn!(sweep = name, error = %e, "maintenance sweep failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(sweep = name, "maintenance sweep shutting down");
                        return;
                    }
                }
            }
        }
    });
}

/// Re-enqueue `failed_jobs` rows marked retryable (§4.10 DLQ auto-retry):
/// create a fresh `pending_jobs` row and mark the original `retried`.
async fn dlq_auto_retry(pool: &PgPool, batch_size: i64) -> Result<()> {
    let retryable = cf_db::list_retryable_failed_jobs(pool, batch_size).await?;
    for job in retryable {
        let application_id = match job.job_args.get("application_id").and_then(|v| v.as_str()) {
            Some(s) => match s.parse::<Uuid>() {
                Ok(id) => id,
                Err(_) => {
                    warn!(job_id = %job.job_id, "failed_jobs.job_args.application_id is not a valid uuid; skipping retry");
                    cf_db::mark_failed_job_ignored(pool, job.job_id).await?;
                    continue;
                }
            },
            None => {
                warn!(job_id = %job.job_id, "failed_jobs row has no application_id in job_args; skipping retry");
                cf_db::mark_failed_job_ignored(pool, job.job_id).await?;
                continue;
            }
        };

        cf_db::insert_pending_job(pool, application_id, &job.task_name, job.job_args.clone())
            .await
            .context("dlq retry: insert_pending_job failed")?;
        cf_db::mark_failed_job_retried(pool, job.job_id).await?;
        info!(job_id = %job.job_id, %application_id, "re-enqueued failed job from the dead letter queue");
    }
    Ok(())
}

/// Pre-create the monthly shell tables `applications` will need for the
/// next `months_ahead` months. Actual conversion of `applications` to a
/// range-partitioned table (§4.10) is a one-way schema migration run by an
/// operator, not an automated DDL step; this only keeps the shells ready.
async fn ensure_future_partitions(pool: &PgPool, months_ahead: u32) -> Result<Vec<String>> {
    let mut created = Vec::new();
    let now = chrono::Utc::now();
    for offset in 0..months_ahead {
        let target = add_months(now, offset);
        let name = format!("applications_y{:04}m{:02}", target.0, target.1);
        sqlx::query(&format!(
            "create table if not exists {name} (like applications including all)"
        ))
        .execute(pool)
        .await
        .with_context(|| format!("failed to ensure partition shell {name}"))?;
        created.push(name);
    }
    Ok(created)
}

fn add_months(from: chrono::DateTime<chrono::Utc>, months: u32) -> (i32, u32) {
    use chrono::Datelike;
    let total = from.year() as i64 * 12 + (from.month() as i64 - 1) + months as i64;
    let year = (total / 12) as i32;
    let month = (total % 12) as u32 + 1;
    (year, month)
}

/// Report whether `applications` has crossed the row-count threshold that
/// calls for partitioning. Logs a warning for an operator to act on; does
/// not alter schema.
async fn check_partition_headroom(pool: &PgPool, threshold: i64) -> Result<bool> {
    let (count,): (i64,) = sqlx::query_as("select count(*)::bigint from applications")
        .fetch_one(pool)
        .await
        .context("check_partition_headroom count failed")?;

    let over = count >= threshold;
    if over {
        warn!(count, threshold, "applications row count exceeds partition threshold; manual conversion to range-partitioning recommended");
    }
    Ok(over)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_months_rolls_over_year_boundary() {
        let dec = chrono::DateTime::parse_from_rfc3339("2026-12-15T00:00:00Z")
            .unwrap()
            .with_timezone(&chrono::Utc);
        assert_eq!(add_months(dec, 0), (2026, 12));
        assert_eq!(add_months(dec, 1), (2027, 1));
        assert_eq!(add_months(dec, 2), (2027, 2));
    }

    #[test]
    fn add_months_within_year() {
        let mar = chrono::DateTime::parse_from_rfc3339("2026-03-01T00:00:00Z")
            .unwrap()
            .with_timezone(&chrono::Utc);
        assert_eq!(add_months(mar, 3), (2026, 6));
    }
}
