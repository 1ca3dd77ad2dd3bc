use super::Pool;
use crate::model::{IngestionRun, ReconciliationRun, RunStatus};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::instrument;
use uuid::Uuid;

fn status_from_row(row: &SqliteRow) -> Result<RunStatus> {
    let raw: String = row.try_get("status")?;
    RunStatus::parse(&raw).ok_or_else(|| anyhow!("unknown run status '{raw}'"))
}

fn ingestion_from_row(row: &SqliteRow) -> Result<IngestionRun> {
    Ok(IngestionRun {
        id: row.try_get("id")?,
        source_id: row.try_get("source_id")?,
        started_at: row.try_get("started_at")?,
        page: row.try_get("page")?,
        items_fetched: row.try_get("items_fetched")?,
        status: status_from_row(row)?,
        error_message: row.try_get("error_message")?,
        duration_ms: row.try_get("duration_ms")?,
    })
}

fn reconciliation_from_row(row: &SqliteRow) -> Result<ReconciliationRun> {
    Ok(ReconciliationRun {
        id: row.try_get("id")?,
        source_id: row.try_get("source_id")?,
        started_at: row.try_get("started_at")?,
        items_checked: row.try_get("items_checked")?,
        items_archived: row.try_get("items_archived")?,
        last_cursor: row.try_get("last_cursor")?,
        status: status_from_row(row)?,
        error_message: row.try_get("error_message")?,
        duration_ms: row.try_get("duration_ms")?,
    })
}

/// Append the log row for one ingestion page, successful or not.
#[instrument(skip_all, fields(source_id = run.source_id, page = run.page))]
pub async fn record_ingestion_page(pool: &Pool, run: &IngestionRun) -> Result<()> {
    sqlx::query(
        "INSERT INTO ingestion_runs \
         (id, source_id, started_at, page, items_fetched, status, error_message, duration_ms) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&run.id)
    .bind(run.source_id)
    .bind(run.started_at)
    .bind(run.page)
    .bind(run.items_fetched)
    .bind(run.status.as_str())
    .bind(&run.error_message)
    .bind(run.duration_ms)
    .execute(pool)
    .await?;
    Ok(())
}

/// Create the single in-progress row a reconciliation run updates as it goes.
#[instrument(skip_all, fields(source_id = source_id))]
pub async fn start_reconciliation_run(
    pool: &Pool,
    source_id: i64,
    started_at: DateTime<Utc>,
    start_cursor: i64,
) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO reconciliation_runs (id, source_id, started_at, last_cursor, status) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(source_id)
    .bind(started_at)
    .bind(start_cursor)
    .bind(RunStatus::InProgress.as_str())
    .execute(pool)
    .await?;
    Ok(id)
}

/// Store cumulative counts and the cursor reached after a batch.
#[instrument(skip_all)]
pub async fn update_reconciliation_progress(
    pool: &Pool,
    run_id: &str,
    items_checked: i64,
    items_archived: i64,
    last_cursor: i64,
) -> Result<()> {
    sqlx::query(
        "UPDATE reconciliation_runs SET items_checked = ?, items_archived = ?, last_cursor = ? \
         WHERE id = ?",
    )
    .bind(items_checked)
    .bind(items_archived)
    .bind(last_cursor)
    .bind(run_id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn finish_reconciliation_run(
    pool: &Pool,
    run_id: &str,
    status: RunStatus,
    error_message: Option<&str>,
    duration_ms: i64,
) -> Result<()> {
    sqlx::query(
        "UPDATE reconciliation_runs SET status = ?, error_message = ?, duration_ms = ? \
         WHERE id = ?",
    )
    .bind(status.as_str())
    .bind(error_message)
    .bind(duration_ms)
    .bind(run_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Close reconciliation rows left `in_progress` by a run that never finished.
#[instrument(skip_all, fields(source_id = source_id))]
pub async fn abandon_in_progress_runs(
    pool: &Pool,
    source_id: i64,
    message: &str,
    duration_ms: i64,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE reconciliation_runs SET status = ?, error_message = ?, duration_ms = ? \
         WHERE source_id = ? AND status = ?",
    )
    .bind(RunStatus::Error.as_str())
    .bind(message)
    .bind(duration_ms)
    .bind(source_id)
    .bind(RunStatus::InProgress.as_str())
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

#[instrument(skip_all, fields(source_id = source_id))]
pub async fn latest_ingestion_runs(
    pool: &Pool,
    source_id: i64,
    limit: u32,
) -> Result<Vec<IngestionRun>> {
    let rows = sqlx::query(
        "SELECT id, source_id, started_at, page, items_fetched, status, error_message, duration_ms \
         FROM ingestion_runs WHERE source_id = ? ORDER BY started_at DESC, rowid DESC LIMIT ?",
    )
    .bind(source_id)
    .bind(i64::from(limit))
    .fetch_all(pool)
    .await?;
    rows.iter().map(ingestion_from_row).collect()
}

#[instrument(skip_all, fields(source_id = source_id))]
pub async fn latest_reconciliation_runs(
    pool: &Pool,
    source_id: i64,
    limit: u32,
) -> Result<Vec<ReconciliationRun>> {
    let rows = sqlx::query(
        "SELECT id, source_id, started_at, items_checked, items_archived, last_cursor, status, \
         error_message, duration_ms \
         FROM reconciliation_runs WHERE source_id = ? ORDER BY started_at DESC, rowid DESC LIMIT ?",
    )
    .bind(source_id)
    .bind(i64::from(limit))
    .fetch_all(pool)
    .await?;
    rows.iter().map(reconciliation_from_row).collect()
}

/// Cursor to resume from when the newest reconciliation run for the source
/// ended in error after making progress.
#[instrument(skip_all, fields(source_id = source_id))]
pub async fn resumable_reconciliation_cursor(pool: &Pool, source_id: i64) -> Result<Option<i64>> {
    let latest = latest_reconciliation_runs(pool, source_id, 1).await?;
    Ok(latest
        .into_iter()
        .next()
        .filter(|run| run.status == RunStatus::Error && run.last_cursor > 0)
        .map(|run| run.last_cursor))
}
