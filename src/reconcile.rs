//! Reconciliation worker: re-check stored listings against the marketplace and
//! archive the ones that are gone.
//!
//! Listings are scanned in `item_id` order with a keyset cursor, one batch at a
//! time. Checks inside a batch run concurrently (bounded by
//! `max_concurrency`) and are all joined before the batch is applied. A single
//! run log row is created up front and updated after every batch.
use crate::config::Config;
use crate::db::{self, ListingPatch, Pool};
use crate::model::{RunStatus, RunSummary, SourceConfig, WorkerKind};
use crate::upstream::{self, BackoffPolicy, ItemStatus, MarketApi};
use anyhow::Result;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, Copy)]
pub struct ReconcileOptions {
    pub batch_size: u32,
    pub max_concurrency: usize,
    pub backoff: BackoffPolicy,
    /// Continue from the cursor of the previous run when it ended in error.
    pub resume: bool,
}

impl ReconcileOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            batch_size: cfg.reconciliation.batch_size,
            max_concurrency: cfg.reconciliation.max_concurrency,
            backoff: BackoffPolicy::from_config(cfg),
            resume: cfg.reconciliation.resume_interrupted,
        }
    }
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_concurrency: 8,
            backoff: BackoffPolicy::default(),
            resume: false,
        }
    }
}

#[instrument(skip_all, fields(source = %source.slug))]
pub async fn run(
    pool: &Pool,
    api: &dyn MarketApi,
    source: &SourceConfig,
    opts: &ReconcileOptions,
) -> Result<RunSummary> {
    let source_id = source.require_id()?;
    let clock = Instant::now();

    let start_cursor = if opts.resume {
        db::resumable_reconciliation_cursor(pool, source_id)
            .await?
            .unwrap_or(0)
    } else {
        0
    };
    if start_cursor > 0 {
        info!(cursor = start_cursor, "resuming interrupted reconciliation");
    }
    let run_id = db::start_reconciliation_run(pool, source_id, Utc::now(), start_cursor).await?;

    let mut summary = RunSummary::new(WorkerKind::Reconciliation, source_id);
    let result = scan(pool, api, source, opts, &run_id, start_cursor, &mut summary).await;
    summary.duration_ms = clock.elapsed().as_millis() as i64;

    match result {
        Ok(()) => {
            summary.status = RunStatus::Success;
            db::finish_reconciliation_run(
                pool,
                &run_id,
                RunStatus::Success,
                None,
                summary.duration_ms,
            )
            .await?;
        }
        Err(err) => {
            let message = format!("{err:#}");
            warn!(error = %message, checked = summary.items_checked, "reconciliation failed");
            summary.status = RunStatus::Error;
            db::finish_reconciliation_run(
                pool,
                &run_id,
                RunStatus::Error,
                Some(&message),
                summary.duration_ms,
            )
            .await?;
            summary.error = Some(message);
        }
    }
    info!(
        checked = summary.items_checked,
        archived = summary.items_archived,
        status = summary.status.as_str(),
        "reconciliation finished"
    );
    Ok(summary)
}

async fn scan(
    pool: &Pool,
    api: &dyn MarketApi,
    source: &SourceConfig,
    opts: &ReconcileOptions,
    run_id: &str,
    start_cursor: i64,
    summary: &mut RunSummary,
) -> Result<()> {
    let source_id = source.require_id()?;
    let backoff = &opts.backoff;
    let mut cursor = start_cursor;

    loop {
        let batch = db::scan_active_after(pool, source_id, cursor, opts.batch_size).await?;
        let Some(last) = batch.last() else {
            break;
        };
        let last_id = last.item_id;

        let verdicts: Vec<(i64, ItemStatus)> = stream::iter(batch.iter().map(|l| l.item_id))
            .map(|item_id| async move { (item_id, check_one(api, source, item_id, backoff).await) })
            .buffer_unordered(opts.max_concurrency.max(1))
            .collect()
            .await;

        let mut stale: BTreeMap<String, Vec<i64>> = BTreeMap::new();
        for (item_id, verdict) in verdicts {
            if let ItemStatus::Stale { reason } = verdict {
                info!(item_id, reason = %reason, "archiving stale listing");
                stale.entry(reason).or_default().push(item_id);
            }
        }

        let now = Utc::now();
        let mut archived = 0;
        for (reason, ids) in stale {
            archived += db::bulk_update(pool, source_id, &ids, &ListingPatch::archive(reason, now))
                .await?;
        }

        summary.items_checked += batch.len() as u64;
        summary.items_archived += archived;
        cursor = last_id;
        db::update_reconciliation_progress(
            pool,
            run_id,
            summary.items_checked as i64,
            summary.items_archived as i64,
            cursor,
        )
        .await?;
        info!(
            cursor,
            batch = batch.len(),
            checked = summary.items_checked,
            archived = summary.items_archived,
            "reconciled batch"
        );
    }
    Ok(())
}

/// Check one item. Anything that is not a clear "gone" answer keeps it live.
async fn check_one(
    api: &dyn MarketApi,
    source: &SourceConfig,
    item_id: i64,
    backoff: &BackoffPolicy,
) -> ItemStatus {
    match upstream::retry_rate_limited(backoff, || api.check_item(source, item_id)).await {
        Ok(response) => {
            let verdict = upstream::classify_check(&response);
            if let ItemStatus::Live { reason } = &verdict {
                if response.status != 200 {
                    warn!(
                        item_id,
                        status = response.status,
                        reason = %reason,
                        "unexpected status check answer; assuming live"
                    );
                }
            }
            verdict
        }
        Err(err) => {
            warn!(item_id, error = %err, "status check failed; assuming live");
            ItemStatus::Live {
                reason: format!("Check failed: {err}"),
            }
        }
    }
}
