use super::Pool;
use crate::model::SourceConfig;
use crate::schema::{self, SchemaError};
use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use thiserror::Error;
use tracing::{info, instrument};

/// Why a source could not be saved. Duplicate slugs are reported apart from
/// store failures so callers can answer with a conflict.
#[derive(Debug, Error)]
pub enum SaveSourceError {
    #[error("invalid source: {0}")]
    Invalid(#[from] SchemaError),
    #[error("a source with slug '{0}' already exists")]
    DuplicateSlug(String),
    #[error("source {0} not found")]
    NotFound(i64),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

const SOURCE_COLUMNS: &str = "id, slug, name, category, description, base_url, list_path, \
     check_path_template, default_filters, columns, filters, sorts, ingestion_enabled, \
     reconciliation_enabled, fetch_interval_minutes, fetch_page_limit";

fn json_column<T: DeserializeOwned>(row: &SqliteRow, slug: &str, column: &str) -> Result<T> {
    let raw: String = row.try_get(column)?;
    serde_json::from_str(&raw).with_context(|| format!("source '{slug}': malformed {column}"))
}

fn optional_u32(row: &SqliteRow, column: &str) -> Result<Option<u32>> {
    let value: Option<i64> = row.try_get(column)?;
    Ok(value.and_then(|v| u32::try_from(v).ok()))
}

fn source_from_row(row: &SqliteRow) -> Result<SourceConfig> {
    let slug: String = row.try_get("slug")?;
    Ok(SourceConfig {
        id: Some(row.try_get("id")?),
        name: row.try_get("name")?,
        category: row.try_get("category")?,
        description: row.try_get("description")?,
        base_url: row.try_get("base_url")?,
        list_path: row.try_get("list_path")?,
        check_path_template: row.try_get("check_path_template")?,
        default_filters: json_column(row, &slug, "default_filters")?,
        columns: json_column(row, &slug, "columns")?,
        filters: json_column(row, &slug, "filters")?,
        sorts: json_column(row, &slug, "sorts")?,
        ingestion_enabled: row.try_get("ingestion_enabled")?,
        reconciliation_enabled: row.try_get("reconciliation_enabled")?,
        fetch_interval_minutes: optional_u32(row, "fetch_interval_minutes")?,
        fetch_page_limit: optional_u32(row, "fetch_page_limit")?,
        slug,
    })
}

#[instrument(skip_all)]
pub async fn list_sources(pool: &Pool) -> Result<Vec<SourceConfig>> {
    let rows = sqlx::query(&format!("SELECT {SOURCE_COLUMNS} FROM sources ORDER BY id"))
        .fetch_all(pool)
        .await?;
    rows.iter().map(source_from_row).collect()
}

#[instrument(skip_all)]
pub async fn get_source(pool: &Pool, id: i64) -> Result<Option<SourceConfig>> {
    let row = sqlx::query(&format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(source_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn get_source_by_slug(pool: &Pool, slug: &str) -> Result<Option<SourceConfig>> {
    let row = sqlx::query(&format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE slug = ?"))
        .bind(slug)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(source_from_row).transpose()
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn map_write_error(err: sqlx::Error, slug: &str) -> SaveSourceError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            SaveSourceError::DuplicateSlug(slug.to_string())
        }
        _ => SaveSourceError::Store(err.into()),
    }
}

/// Insert (no id) or update (with id) a source. The config is validated first;
/// nothing malformed reaches the table.
#[instrument(skip_all, fields(slug = %source.slug))]
pub async fn save_source(
    pool: &Pool,
    source: &SourceConfig,
) -> Result<SourceConfig, SaveSourceError> {
    schema::validate(source)?;

    let default_filters = to_json(&source.default_filters)?;
    let columns = to_json(&source.columns)?;
    let filters = to_json(&source.filters)?;
    let sorts = to_json(&source.sorts)?;

    let id = match source.id {
        Some(id) => {
            let result = sqlx::query(
                "UPDATE sources SET slug = ?, name = ?, category = ?, description = ?, \
                 base_url = ?, list_path = ?, check_path_template = ?, default_filters = ?, \
                 columns = ?, filters = ?, sorts = ?, ingestion_enabled = ?, \
                 reconciliation_enabled = ?, fetch_interval_minutes = ?, fetch_page_limit = ? \
                 WHERE id = ?",
            )
            .bind(&source.slug)
            .bind(&source.name)
            .bind(&source.category)
            .bind(&source.description)
            .bind(&source.base_url)
            .bind(&source.list_path)
            .bind(&source.check_path_template)
            .bind(&default_filters)
            .bind(&columns)
            .bind(&filters)
            .bind(&sorts)
            .bind(source.ingestion_enabled)
            .bind(source.reconciliation_enabled)
            .bind(source.fetch_interval_minutes.map(i64::from))
            .bind(source.fetch_page_limit.map(i64::from))
            .bind(id)
            .execute(pool)
            .await
            .map_err(|e| map_write_error(e, &source.slug))?;
            if result.rows_affected() == 0 {
                return Err(SaveSourceError::NotFound(id));
            }
            id
        }
        None => sqlx::query_scalar::<_, i64>(
            "INSERT INTO sources (slug, name, category, description, base_url, list_path, \
             check_path_template, default_filters, columns, filters, sorts, ingestion_enabled, \
             reconciliation_enabled, fetch_interval_minutes, fetch_page_limit) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(&source.slug)
        .bind(&source.name)
        .bind(&source.category)
        .bind(&source.description)
        .bind(&source.base_url)
        .bind(&source.list_path)
        .bind(&source.check_path_template)
        .bind(&default_filters)
        .bind(&columns)
        .bind(&filters)
        .bind(&sorts)
        .bind(source.ingestion_enabled)
        .bind(source.reconciliation_enabled)
        .bind(source.fetch_interval_minutes.map(i64::from))
        .bind(source.fetch_page_limit.map(i64::from))
        .fetch_one(pool)
        .await
        .map_err(|e| map_write_error(e, &source.slug))?,
    };

    let mut saved = source.clone();
    saved.id = Some(id);
    Ok(saved)
}

/// Delete a source; its listings, run log rows and leases go with it.
#[instrument(skip_all)]
pub async fn delete_source(pool: &Pool, id: i64) -> Result<bool> {
    let result = sqlx::query("DELETE FROM sources WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Insert or update sources by slug, e.g. from an imported YAML file.
#[instrument(skip_all)]
pub async fn import_sources(
    pool: &Pool,
    sources: &[SourceConfig],
) -> Result<Vec<SourceConfig>, SaveSourceError> {
    let mut saved = Vec::with_capacity(sources.len());
    for source in sources {
        let mut source = source.clone();
        source.id = get_source_by_slug(pool, &source.slug)
            .await?
            .and_then(|existing| existing.id);
        saved.push(save_source(pool, &source).await?);
    }
    Ok(saved)
}

/// Insert the bundled presets when no source exists yet. Returns how many were added.
#[instrument(skip_all)]
pub async fn seed_presets(pool: &Pool) -> Result<usize> {
    let existing: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sources")
        .fetch_one(pool)
        .await?;
    if existing > 0 {
        return Ok(0);
    }
    let presets = schema::presets()?;
    for preset in &presets {
        save_source(pool, preset)
            .await
            .map_err(|e| anyhow!("seeding '{}': {e}", preset.slug))?;
    }
    info!(count = presets.len(), "seeded source presets");
    Ok(presets.len())
}
