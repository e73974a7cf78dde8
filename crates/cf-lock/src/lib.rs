//! Distributed lock service (§4.4), backed by a Postgres lease table.
//!
//! Generalizes the outbox claim/release pattern (`FOR UPDATE SKIP LOCKED`
//! plus an explicit release) from a one-shot job claim into a renewable,
//! fencing-tokened lease any process can `acquire`/`release` by an arbitrary
//! string key. One worker holding the lease for `application_id` is what
//! makes concurrent claim-and-process of the same application safe (§5.2).

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::time::Duration;
use uuid::Uuid;

/// A held lease. Dropping this value does not release the lease — callers
/// MUST call [`release`] explicitly on every exit path, mirroring the
/// claim/release discipline of the outbox pattern this generalizes.
#[derive(Debug, Clone)]
pub struct Lease {
    pub key: String,
    pub holder_id: String,
    /// Monotonically increasing per key; safe to use as a fencing token to
    /// reject writes from a holder whose lease has since expired.
    pub fencing_token: i64,
    pub expires_at: DateTime<Utc>,
}

pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("cf-lock migrate failed")?;
    Ok(())
}

/// Attempt to acquire the lease named `key` for `ttl`, identifying the
/// holder as `holder_id` (typically a worker's task id).
///
/// Succeeds if no row exists for `key`, or the existing row's lease has
/// expired. An unexpired lease held by someone else returns `Ok(None)`
/// rather than an error — callers treat lock contention as an expected
/// outcome (§7: retryable, not a failure).
pub async fn acquire(pool: &PgPool, key: &str, holder_id: &str, ttl: Duration) -> Result<Option<Lease>> {
    let ttl_secs = ttl.as_secs() as i64;

    let row = sqlx::query(
        r#"
        insert into distributed_locks (lock_key, holder_id, fencing_token, acquired_at, expires_at)
        values ($1, $2, 1, now(), now() + make_interval(secs => $3))
        on conflict (lock_key) do update
           set holder_id     = excluded.holder_id,
               fencing_token = distributed_locks.fencing_token + 1,
               acquired_at   = now(),
               expires_at    = now() + make_interval(secs => $3)
         where distributed_locks.expires_at < now()
        returning lock_key, holder_id, fencing_token, expires_at
        "#,
    )
    .bind(key)
    .bind(holder_id)
    .bind(ttl_secs)
    .fetch_optional(pool)
    .await
    .context("acquire lock failed")?;

    Ok(match row {
        Some(r) => Some(Lease {
            key: r.try_get("lock_key")?,
            holder_id: r.try_get("holder_id")?,
            fencing_token: r.try_get("fencing_token")?,
            expires_at: r.try_get("expires_at")?,
        }),
        None => None,
    })
}

/// Extend an already-held lease's expiry, e.g. from a long task's heartbeat.
/// Returns `false` if `holder_id` no longer holds the lease (lost to
/// expiry and re-acquisition by another holder).
pub async fn renew(pool: &PgPool, key: &str, holder_id: &str, ttl: Duration) -> Result<bool> {
    let ttl_secs = ttl.as_secs() as i64;
    let row: Option<(String,)> = sqlx::query_as(
        r#"
        update distributed_locks
           set expires_at = now() + make_interval(secs => $3)
         where lock_key = $1 and holder_id = $2 and expires_at >= now()
        returning lock_key
        "#,
    )
    .bind(key)
    .bind(holder_id)
    .bind(ttl_secs)
    .fetch_optional(pool)
    .await
    .context("renew lock failed")?;

    Ok(row.is_some())
}

/// Release a held lease. Idempotent: releasing a lease that has already
/// expired or was never held by `holder_id` is a no-op, never an error —
/// release must be safe to call unconditionally on every exit path.
pub async fn release(pool: &PgPool, key: &str, holder_id: &str) -> Result<()> {
    sqlx::query(
        r#"
        delete from distributed_locks
         where lock_key = $1 and holder_id = $2
        "#,
    )
    .bind(key)
    .bind(holder_id)
    .execute(pool)
    .await
    .context("release lock failed")?;
    Ok(())
}

/// Reclaim leases past their expiry, for diagnostics/metrics (§4.10 sweeps
/// rely on expiry alone; this just reports what is currently expired).
pub async fn count_expired(pool: &PgPool) -> Result<i64> {
    let (n,): (i64,) = sqlx::query_as(
        r#"select count(*)::bigint from distributed_locks where expires_at < now()"#,
    )
    .fetch_one(pool)
    .await
    .context("count_expired failed")?;
    Ok(n)
}

/// Build a stable holder id for a worker task, following the same
/// `host:pid:task-id` shape the outbox dispatcher uses for `claimed_by`.
pub fn holder_id(worker_task_id: Uuid) -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_string());
    format!("{host}:{}:{worker_task_id}", std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn holder_id_embeds_pid_and_task_id() {
        let task_id = Uuid::nil();
        let id = holder_id(task_id);
        assert!(id.contains(&std::process::id().to_string()));
        assert!(id.ends_with(&task_id.to_string()));
    }
}
