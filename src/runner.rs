//! Run triggers: resolve a source, enforce one in-flight run per
//! `(source, worker kind)` and bound each run with a timeout.
use crate::config::Config;
use crate::db::{self, Pool};
use crate::ingest::{self, IngestOptions};
use crate::model::{FilterState, IngestionRun, RunStatus, RunSummary, SourceConfig, WorkerKind};
use crate::reconcile::{self, ReconcileOptions};
use crate::scoring::Scorer;
use crate::upstream::MarketApi;
use anyhow::{anyhow, Result};
use chrono::Utc;
use serde::Serialize;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed(RunSummary),
    Skipped { reason: String },
}

/// Everything a trigger needs, borrowed from the caller.
pub struct RunContext<'a> {
    pub pool: &'a Pool,
    pub api: &'a dyn MarketApi,
    pub scorer: &'a dyn Scorer,
    pub config: &'a Config,
}

async fn load_source(pool: &Pool, slug: &str) -> Result<SourceConfig> {
    db::get_source_by_slug(pool, slug)
        .await?
        .ok_or_else(|| anyhow!("unknown source '{slug}'"))
}

/// Time between lease renewals while a run is in flight.
fn renew_interval(ttl: Duration) -> Duration {
    (ttl / 3).max(Duration::from_millis(10))
}

/// Keep extending `holder`'s lease until dropped.
async fn renew_lease(
    pool: &Pool,
    source_id: i64,
    kind: WorkerKind,
    holder: &str,
    ttl: Duration,
) {
    let mut ticks = tokio::time::interval(renew_interval(ttl));
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; the lease was just taken.
    ticks.tick().await;
    loop {
        ticks.tick().await;
        let kind_name = kind.as_str();
        match db::try_acquire_lease(pool, source_id, kind, holder, ttl).await {
            Ok(true) => debug!(source_id, kind = kind_name, "lease renewed"),
            Ok(false) => warn!(source_id, kind = kind_name, "lease lost to another holder"),
            Err(err) => warn!(source_id, kind = kind_name, error = %err, "failed to renew lease"),
        }
    }
}

/// Run `work` while holding the `(source_id, kind)` lease, renewing it every
/// third of `ttl` until the work finishes. `None` means another holder has it.
async fn with_lease<T, Fut>(
    pool: &Pool,
    source_id: i64,
    kind: WorkerKind,
    ttl: Duration,
    work: Fut,
) -> Result<Option<T>>
where
    Fut: Future<Output = Result<T>>,
{
    let holder = Uuid::new_v4().to_string();
    if !db::try_acquire_lease(pool, source_id, kind, &holder, ttl).await? {
        warn!(source_id, kind = kind.as_str(), "run already in flight; skipping");
        return Ok(None);
    }
    // Both futures are polled together so renewal never waits on a paused run.
    let result = tokio::select! {
        biased;
        result = work => result,
        () = renew_lease(pool, source_id, kind, &holder, ttl) => {
            Err(anyhow!("lease renewal stopped"))
        }
    };
    if let Err(err) = db::release_lease(pool, source_id, kind, &holder).await {
        warn!(source_id, kind = kind.as_str(), error = %err, "failed to release lease");
    }
    result.map(Some)
}

#[instrument(skip_all, fields(slug = slug))]
pub async fn trigger_ingestion(
    ctx: &RunContext<'_>,
    slug: &str,
    filters: &FilterState,
) -> Result<RunOutcome> {
    let source = load_source(ctx.pool, slug).await?;
    let source_id = source.require_id()?;
    if !source.ingestion_enabled {
        info!("ingestion disabled for source");
        return Ok(RunOutcome::Skipped {
            reason: format!("ingestion is disabled for '{slug}'"),
        });
    }

    let opts = IngestOptions::from_config(ctx.config);
    let limit = Duration::from_secs(ctx.config.ingestion.run_timeout_secs);
    let work = async {
        let clock = Instant::now();
        match tokio::time::timeout(
            limit,
            ingest::run(ctx.pool, ctx.api, ctx.scorer, &source, filters, &opts),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                let message = format!("ingestion timed out after {}s", limit.as_secs());
                warn!(source_id, "{message}");
                let duration_ms = clock.elapsed().as_millis() as i64;
                // The interrupted page never logged itself; page 0 marks the run-level failure.
                db::record_ingestion_page(
                    ctx.pool,
                    &IngestionRun {
                        id: Uuid::new_v4().to_string(),
                        source_id,
                        started_at: Utc::now(),
                        page: 0,
                        items_fetched: 0,
                        status: RunStatus::Error,
                        error_message: Some(message.clone()),
                        duration_ms,
                    },
                )
                .await?;
                let mut summary = RunSummary::new(WorkerKind::Ingestion, source_id);
                summary.status = RunStatus::Error;
                summary.error = Some(message);
                summary.duration_ms = duration_ms;
                Ok(summary)
            }
        }
    };

    Ok(
        match with_lease(ctx.pool, source_id, WorkerKind::Ingestion, ctx.config.lease_ttl(), work)
            .await?
        {
            Some(summary) => RunOutcome::Completed(summary),
            None => RunOutcome::Skipped {
                reason: format!("an ingestion run for '{slug}' is already in progress"),
            },
        },
    )
}

/// Start a reconciliation run. `fresh` ignores any resumable cursor.
#[instrument(skip_all, fields(slug = slug))]
pub async fn trigger_reconciliation(
    ctx: &RunContext<'_>,
    slug: &str,
    fresh: bool,
) -> Result<RunOutcome> {
    let source = load_source(ctx.pool, slug).await?;
    let source_id = source.require_id()?;
    if !source.reconciliation_enabled {
        info!("reconciliation disabled for source");
        return Ok(RunOutcome::Skipped {
            reason: format!("reconciliation is disabled for '{slug}'"),
        });
    }

    let mut opts = ReconcileOptions::from_config(ctx.config);
    opts.resume = opts.resume && !fresh;
    let limit = Duration::from_secs(ctx.config.reconciliation.run_timeout_secs);
    let work = async {
        // Holding the lease means any in-progress row is left over from a crash.
        let stale = db::abandon_in_progress_runs(
            ctx.pool,
            source_id,
            "interrupted before completion",
            0,
        )
        .await?;
        if stale > 0 {
            warn!(source_id, stale, "closed reconciliation runs left in progress");
        }

        let clock = Instant::now();
        let run = reconcile::run(ctx.pool, ctx.api, &source, &opts);
        match tokio::time::timeout(limit, run).await {
            Ok(result) => result,
            Err(_) => {
                let message = format!("reconciliation timed out after {}s", limit.as_secs());
                warn!(source_id, "{message}");
                let duration_ms = clock.elapsed().as_millis() as i64;
                db::abandon_in_progress_runs(ctx.pool, source_id, &message, duration_ms).await?;
                let mut summary = RunSummary::new(WorkerKind::Reconciliation, source_id);
                if let Some(run) = db::latest_reconciliation_runs(ctx.pool, source_id, 1)
                    .await?
                    .into_iter()
                    .next()
                {
                    summary.items_checked = run.items_checked.max(0) as u64;
                    summary.items_archived = run.items_archived.max(0) as u64;
                }
                summary.status = RunStatus::Error;
                summary.error = Some(message);
                summary.duration_ms = duration_ms;
                Ok(summary)
            }
        }
    };

    Ok(
        match with_lease(
            ctx.pool,
            source_id,
            WorkerKind::Reconciliation,
            ctx.config.lease_ttl(),
            work,
        )
        .await?
        {
            Some(summary) => RunOutcome::Completed(summary),
            None => RunOutcome::Skipped {
                reason: format!("a reconciliation run for '{slug}' is already in progress"),
            },
        },
    )
}
