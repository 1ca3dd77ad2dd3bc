use super::{now_ms, Pool};
use crate::model::WorkerKind;
use anyhow::Result;
use std::time::Duration;
use tracing::{debug, instrument};

/// Take the `(source_id, kind)` lease for `holder` unless someone else holds an
/// unexpired one. Expired leases are taken over. Returns whether the lease is ours.
#[instrument(skip_all, fields(source_id = source_id, kind = kind.as_str()))]
pub async fn try_acquire_lease(
    pool: &Pool,
    source_id: i64,
    kind: WorkerKind,
    holder: &str,
    ttl: Duration,
) -> Result<bool> {
    let now = now_ms();
    let expires = now.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX));
    // Single statement, so two racing acquirers cannot both win.
    let result = sqlx::query(
        "INSERT INTO worker_leases (source_id, worker_kind, holder, acquired_at_ms, expires_at_ms) \
         VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT(source_id, worker_kind) DO UPDATE SET \
         holder = excluded.holder, acquired_at_ms = excluded.acquired_at_ms, \
         expires_at_ms = excluded.expires_at_ms \
         WHERE worker_leases.expires_at_ms <= ? OR worker_leases.holder = excluded.holder",
    )
    .bind(source_id)
    .bind(kind.as_str())
    .bind(holder)
    .bind(now)
    .bind(expires)
    .bind(now)
    .execute(pool)
    .await?;
    let acquired = result.rows_affected() > 0;
    debug!(acquired, "lease attempt");
    Ok(acquired)
}

/// Release a lease held by `holder`. Someone else's lease is left alone.
#[instrument(skip_all, fields(source_id = source_id, kind = kind.as_str()))]
pub async fn release_lease(
    pool: &Pool,
    source_id: i64,
    kind: WorkerKind,
    holder: &str,
) -> Result<bool> {
    let result = sqlx::query(
        "DELETE FROM worker_leases WHERE source_id = ? AND worker_kind = ? AND holder = ?",
    )
    .bind(source_id)
    .bind(kind.as_str())
    .bind(holder)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}
