//! Per-source field, filter and sort schema.
//!
//! A [`SourceConfig`] describes which attributes a listing carries and how
//! users may filter and sort on them. This module owns the closed set of core
//! listing attributes that configuration may address, validation of configs
//! before they are persisted, and the bundled presets.
use crate::model::{ColumnKind, FilterKind, SourceConfig};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use thiserror::Error;

static SLUG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9-]*$").unwrap());
static FIELD_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap());

const PRESETS_YAML: &str = include_str!("presets.yaml");

/// First-class listing attributes addressable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoreField {
    ItemId,
    Title,
    Url,
    Price,
    Currency,
    Score,
    FirstSeenAt,
    LastSeenAt,
    ArchivedAt,
}

impl CoreField {
    pub fn parse(id: &str) -> Option<Self> {
        match id {
            "item_id" => Some(CoreField::ItemId),
            "title" => Some(CoreField::Title),
            "url" => Some(CoreField::Url),
            "price" => Some(CoreField::Price),
            "currency" => Some(CoreField::Currency),
            "score" | "deal_score" => Some(CoreField::Score),
            "first_seen_at" => Some(CoreField::FirstSeenAt),
            "last_seen_at" => Some(CoreField::LastSeenAt),
            "archived_at" => Some(CoreField::ArchivedAt),
            _ => None,
        }
    }

    /// Column name in the `listings` table.
    pub fn column(&self) -> &'static str {
        match self {
            CoreField::ItemId => "item_id",
            CoreField::Title => "title",
            CoreField::Url => "url",
            CoreField::Price => "price",
            CoreField::Currency => "currency",
            CoreField::Score => "score",
            CoreField::FirstSeenAt => "first_seen_at",
            CoreField::LastSeenAt => "last_seen_at",
            CoreField::ArchivedAt => "archived_at",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("invalid slug '{0}': use lowercase letters, digits and dashes")]
    InvalidSlug(String),
    #[error("{0} must be non-empty")]
    Missing(&'static str),
    #[error("base_url '{0}' must start with http:// or https://")]
    InvalidBaseUrl(String),
    #[error("{field} '{value}' must start with '/'")]
    InvalidPath { field: &'static str, value: String },
    #[error("check_path_template '{0}' must contain the {{id}} placeholder")]
    MissingIdPlaceholder(String),
    #[error("invalid {kind} id '{id}'")]
    InvalidId { kind: &'static str, id: String },
    #[error("duplicate {kind} id '{id}'")]
    DuplicateId { kind: &'static str, id: String },
    #[error("core column '{0}' is not a listing attribute")]
    UnknownCoreColumn(String),
    #[error("number range filter '{0}' needs param_name_min and param_name_max")]
    RangeWithoutParams(String),
    #[error("select filter '{0}' needs at least one option")]
    SelectWithoutOptions(String),
    #[error("sort '{sort}' targets '{column}', which is not a core or extension column")]
    UnresolvableSortColumn { sort: String, column: String },
    #[error("default filter keys must be non-empty")]
    EmptyDefaultFilterKey,
}

/// Validate a source before it is persisted. Malformed configs never reach the store.
pub fn validate(source: &SourceConfig) -> Result<(), SchemaError> {
    if !SLUG_RE.is_match(&source.slug) {
        return Err(SchemaError::InvalidSlug(source.slug.clone()));
    }
    if source.name.trim().is_empty() {
        return Err(SchemaError::Missing("name"));
    }
    if !(source.base_url.starts_with("http://") || source.base_url.starts_with("https://")) {
        return Err(SchemaError::InvalidBaseUrl(source.base_url.clone()));
    }
    if !source.list_path.starts_with('/') {
        return Err(SchemaError::InvalidPath {
            field: "list_path",
            value: source.list_path.clone(),
        });
    }
    if !source.check_path_template.starts_with('/') {
        return Err(SchemaError::InvalidPath {
            field: "check_path_template",
            value: source.check_path_template.clone(),
        });
    }
    if !source.check_path_template.contains("{id}") {
        return Err(SchemaError::MissingIdPlaceholder(
            source.check_path_template.clone(),
        ));
    }
    if source.default_filters.keys().any(|k| k.trim().is_empty()) {
        return Err(SchemaError::EmptyDefaultFilterKey);
    }

    check_ids("column", source.columns.iter().map(|c| c.id.as_str()))?;
    check_ids("filter", source.filters.iter().map(|f| f.id.as_str()))?;
    check_ids("sort", source.sorts.iter().map(|s| s.id.as_str()))?;

    for column in &source.columns {
        if column.kind == ColumnKind::Core && CoreField::parse(&column.id).is_none() {
            return Err(SchemaError::UnknownCoreColumn(column.id.clone()));
        }
    }

    for filter in &source.filters {
        match filter.kind {
            FilterKind::Select if filter.options.is_empty() => {
                return Err(SchemaError::SelectWithoutOptions(filter.id.clone()));
            }
            FilterKind::NumberRange
                if filter.param_name_min.is_none() || filter.param_name_max.is_none() =>
            {
                return Err(SchemaError::RangeWithoutParams(filter.id.clone()));
            }
            _ => {}
        }
    }

    for sort in &source.sorts {
        let resolvable = CoreField::parse(&sort.column).is_some()
            || source
                .extension_columns()
                .any(|c| c.id == sort.column);
        if !resolvable {
            return Err(SchemaError::UnresolvableSortColumn {
                sort: sort.id.clone(),
                column: sort.column.clone(),
            });
        }
    }

    Ok(())
}

fn check_ids<'a>(
    kind: &'static str,
    ids: impl Iterator<Item = &'a str>,
) -> Result<(), SchemaError> {
    let mut seen = HashSet::new();
    for id in ids {
        if !FIELD_ID_RE.is_match(id) {
            return Err(SchemaError::InvalidId {
                kind,
                id: id.to_string(),
            });
        }
        if !seen.insert(id) {
            return Err(SchemaError::DuplicateId {
                kind,
                id: id.to_string(),
            });
        }
    }
    Ok(())
}

#[derive(serde::Deserialize)]
struct SourceFile {
    sources: Vec<SourceConfig>,
}

/// Parse a YAML document with a top-level `sources:` list and validate each entry.
pub fn parse_sources_yaml(content: &str) -> anyhow::Result<Vec<SourceConfig>> {
    let file: SourceFile = serde_yaml::from_str(content)?;
    for source in &file.sources {
        validate(source).map_err(|e| anyhow::anyhow!("source '{}': {}", source.slug, e))?;
    }
    Ok(file.sources)
}

/// Bundled marketplace presets used to seed an empty store.
pub fn presets() -> anyhow::Result<Vec<SourceConfig>> {
    parse_sources_yaml(PRESETS_YAML)
}
