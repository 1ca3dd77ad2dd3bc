use anyhow::{anyhow, bail, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use listing_sync::config::{self, Config};
use listing_sync::db::{self, ListingPatch};
use listing_sync::model::{FilterState, FilterValue, View};
use listing_sync::runner::{self, RunContext};
use listing_sync::scoring::DisabledScorer;
use listing_sync::upstream::HttpMarketApi;
use listing_sync::{query, schema};
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, global = true, default_value = "config.yaml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Write an example config file
    InitConfig {
        #[arg(long)]
        force: bool,
    },
    /// Apply database migrations
    Migrate,
    /// Insert the bundled source presets into an empty store
    Seed,
    /// List configured sources
    Sources,
    /// Insert or update sources from a YAML file with a top-level `sources:` list
    ImportSources { file: PathBuf },
    /// Delete a source together with its listings and run log
    DeleteSource { slug: String },
    /// Run the ingestion worker once
    Ingest {
        slug: String,
        /// Filter as key=value, e.g. price_min=10
        #[arg(long = "filter", value_parser = parse_filter)]
        filters: Vec<(String, String)>,
    },
    /// Run the reconciliation worker once
    Reconcile {
        slug: String,
        /// Start from the first listing even if the last run was interrupted
        #[arg(long)]
        fresh: bool,
    },
    /// Query stored listings
    Listings {
        slug: String,
        #[arg(long, default_value = "active", value_parser = parse_view)]
        view: View,
        #[arg(long)]
        sort: Option<String>,
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = 50)]
        per_page: u32,
        #[arg(long = "filter", value_parser = parse_filter)]
        filters: Vec<(String, String)>,
    },
    /// Active / hidden / archived counts
    Counts { slug: String },
    /// Latest run log rows
    Logs {
        slug: String,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Hide listings from the active view
    Hide(BulkArgs),
    /// Return hidden listings to the active view
    Unhide(BulkArgs),
    /// Archive listings with a reason
    Archive {
        #[command(flatten)]
        target: BulkArgs,
        /// Reason stored on each archived listing
        #[arg(long, default_value = "Archived manually.")]
        reason: String,
    },
    /// Restore archived listings and clear their archive reason
    Unarchive(BulkArgs),
}

#[derive(Debug, ClapArgs)]
struct BulkArgs {
    slug: String,
    /// Item ids to update
    ids: Vec<i64>,
    /// Update every listing in --view matching --filter instead of explicit ids
    #[arg(long, conflicts_with = "ids")]
    all: bool,
    #[arg(long, default_value = "active", value_parser = parse_view)]
    view: View,
    #[arg(long = "filter", value_parser = parse_filter)]
    filters: Vec<(String, String)>,
}

fn parse_filter(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))
}

fn parse_view(raw: &str) -> Result<View, String> {
    View::parse(raw).ok_or_else(|| format!("unknown view '{raw}' (active, hidden, archived)"))
}

fn filter_state(pairs: &[(String, String)]) -> FilterState {
    pairs
        .iter()
        .map(|(k, v)| (k.clone(), FilterValue::Text(v.clone())))
        .collect()
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{level},sqlx=warn")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn open_store(cfg: &Config) -> Result<db::Pool> {
    cfg.ensure_dirs()?;
    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;
    Ok(pool)
}

async fn source_id(pool: &db::Pool, slug: &str) -> Result<i64> {
    db::get_source_by_slug(pool, slug)
        .await?
        .and_then(|s| s.id)
        .ok_or_else(|| anyhow!("unknown source '{slug}'"))
}

async fn bulk(pool: &db::Pool, args: &BulkArgs, patch: ListingPatch) -> Result<()> {
    let source = db::get_source_by_slug(pool, &args.slug)
        .await?
        .ok_or_else(|| anyhow!("unknown source '{}'", args.slug))?;
    let source_id = source.require_id()?;
    let ids = if args.all {
        let predicate = query::translate(&source, &filter_state(&args.filters));
        db::listing_ids_matching(pool, source_id, args.view, &predicate).await?
    } else {
        if args.ids.is_empty() {
            bail!("pass item ids or --all");
        }
        args.ids.clone()
    };
    let updated = db::bulk_update(pool, source_id, &ids, &patch).await?;
    info!(slug = %args.slug, requested = ids.len(), updated, "bulk update");
    print_json(&json!({ "requested": ids.len(), "updated": updated }))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Command::InitConfig { force } = &args.command {
        init_logging("info");
        if args.config.exists() && !force {
            bail!("{} already exists (use --force)", args.config.display());
        }
        std::fs::write(&args.config, config::example())
            .with_context(|| format!("writing {}", args.config.display()))?;
        info!(path = %args.config.display(), "wrote example config");
        return Ok(());
    }

    let cfg = config::load(Some(&args.config))?;
    init_logging(&cfg.app.log_level);
    let pool = open_store(&cfg).await?;

    match args.command {
        Command::InitConfig { .. } => {}
        Command::Migrate => info!("migrations applied"),
        Command::Seed => {
            let added = db::seed_presets(&pool).await?;
            print_json(&json!({ "seeded": added }))?;
        }
        Command::Sources => print_json(&db::list_sources(&pool).await?)?,
        Command::ImportSources { file } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let sources = schema::parse_sources_yaml(&content)?;
            let saved = db::import_sources(&pool, &sources).await?;
            print_json(&saved)?;
        }
        Command::DeleteSource { slug } => {
            let id = source_id(&pool, &slug).await?;
            let deleted = db::delete_source(&pool, id).await?;
            print_json(&json!({ "deleted": deleted, "slug": slug }))?;
        }
        Command::Ingest { slug, filters } => {
            let api = HttpMarketApi::from_config(&cfg)?;
            if cfg.scoring.enabled {
                warn!("scoring is enabled but no scorer is wired; scores stay empty");
            }
            let ctx = RunContext {
                pool: &pool,
                api: &api,
                scorer: &DisabledScorer,
                config: &cfg,
            };
            let outcome = runner::trigger_ingestion(&ctx, &slug, &filter_state(&filters)).await?;
            print_json(&outcome)?;
        }
        Command::Reconcile { slug, fresh } => {
            let api = HttpMarketApi::from_config(&cfg)?;
            let ctx = RunContext {
                pool: &pool,
                api: &api,
                scorer: &DisabledScorer,
                config: &cfg,
            };
            let outcome = runner::trigger_reconciliation(&ctx, &slug, fresh).await?;
            print_json(&outcome)?;
        }
        Command::Listings {
            slug,
            view,
            sort,
            page,
            per_page,
            filters,
        } => {
            let source = db::get_source_by_slug(&pool, &slug)
                .await?
                .ok_or_else(|| anyhow!("unknown source '{slug}'"))?;
            let predicate = query::translate(&source, &filter_state(&filters));
            let order = query::resolve_sort(&source, sort.as_deref());
            let result = db::query_listings(
                &pool,
                source.require_id()?,
                view,
                &predicate,
                &order,
                page,
                per_page,
            )
            .await?;
            print_json(&result)?;
        }
        Command::Counts { slug } => {
            let id = source_id(&pool, &slug).await?;
            print_json(&db::counts(&pool, id).await?)?;
        }
        Command::Logs { slug, limit } => {
            let id = source_id(&pool, &slug).await?;
            print_json(&json!({
                "ingestion": db::latest_ingestion_runs(&pool, id, limit).await?,
                "reconciliation": db::latest_reconciliation_runs(&pool, id, limit).await?,
            }))?;
        }
        Command::Hide(target) => bulk(&pool, &target, ListingPatch::hide()).await?,
        Command::Unhide(target) => bulk(&pool, &target, ListingPatch::unhide()).await?,
        Command::Archive { target, reason } => {
            bulk(&pool, &target, ListingPatch::archive(reason, chrono::Utc::now())).await?
        }
        Command::Unarchive(target) => bulk(&pool, &target, ListingPatch::unarchive()).await?,
    }

    Ok(())
}
