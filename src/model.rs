use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Where a column's value lives on a stored listing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    /// First-class listing attribute (`price`, `title`, ...).
    Core,
    /// Stored in the listing's extension map under the column id.
    #[serde(alias = "game_specific")]
    Extension,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnSpec {
    pub id: String,
    pub label: String,
    pub kind: ColumnKind,
    #[serde(default)]
    pub is_numeric: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_hint: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FilterKind {
    Text,
    NumberRange,
    Select,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FilterSpec {
    pub id: String,
    pub label: String,
    pub kind: FilterKind,
    #[serde(default)]
    pub is_advanced: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param_name_min: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param_name_max: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SortSpec {
    pub id: String,
    pub label: String,
    pub column: String,
    pub ascending: bool,
}

/// One monitored marketplace category.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub description: String,
    pub base_url: String,
    pub list_path: String,
    pub check_path_template: String,
    #[serde(default)]
    pub default_filters: BTreeMap<String, String>,
    #[serde(default)]
    pub columns: Vec<ColumnSpec>,
    #[serde(default)]
    pub filters: Vec<FilterSpec>,
    #[serde(default)]
    pub sorts: Vec<SortSpec>,
    #[serde(default = "default_true")]
    pub ingestion_enabled: bool,
    #[serde(default = "default_true")]
    pub reconciliation_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetch_interval_minutes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetch_page_limit: Option<u32>,
}

fn default_true() -> bool {
    true
}

impl SourceConfig {
    pub fn column(&self, id: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.id == id)
    }

    pub fn filter(&self, id: &str) -> Option<&FilterSpec> {
        self.filters.iter().find(|f| f.id == id)
    }

    pub fn sort(&self, id: &str) -> Option<&SortSpec> {
        self.sorts.iter().find(|s| s.id == id)
    }

    pub fn extension_columns(&self) -> impl Iterator<Item = &ColumnSpec> {
        self.columns
            .iter()
            .filter(|c| c.kind == ColumnKind::Extension)
    }

    /// Persisted id; sources are only handed to workers after being saved.
    pub fn require_id(&self) -> anyhow::Result<i64> {
        self.id
            .ok_or_else(|| anyhow::anyhow!("source '{}' has not been saved", self.slug))
    }
}

/// A stored listing, keyed by `(source_id, item_id)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Listing {
    pub source_id: i64,
    pub item_id: i64,
    pub url: String,
    pub title: String,
    pub price: Option<f64>,
    pub currency: Option<String>,
    pub extension: Map<String, Value>,
    pub score: Option<i64>,
    pub is_hidden: bool,
    pub is_archived: bool,
    pub archived_reason: Option<String>,
    pub archived_at: Option<DateTime<Utc>>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub raw_payload: Value,
}

/// Candidate listing built by ingestion. Carries only the fields an upsert
/// may write; visibility and archival state stay with the store.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ListingDraft {
    pub source_id: i64,
    pub item_id: i64,
    pub url: String,
    pub title: String,
    pub price: Option<f64>,
    pub currency: Option<String>,
    pub extension: Map<String, Value>,
    pub score: Option<i64>,
    pub raw_payload: Value,
    pub seen_at: DateTime<Utc>,
}

/// Partition of a source's listings used by the read path.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum View {
    #[default]
    Active,
    Hidden,
    Archived,
}

impl View {
    pub fn as_str(&self) -> &'static str {
        match self {
            View::Active => "active",
            View::Hidden => "hidden",
            View::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(View::Active),
            "hidden" => Some(View::Hidden),
            "archived" => Some(View::Archived),
            _ => None,
        }
    }

    pub fn contains(&self, is_hidden: bool, is_archived: bool) -> bool {
        match self {
            View::Active => !is_hidden && !is_archived,
            View::Hidden => is_hidden && !is_archived,
            View::Archived => is_archived,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ViewCounts {
    pub active: i64,
    pub hidden: i64,
    pub archived: i64,
}

/// A single value from the UI filter state. Numbers may arrive as strings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum FilterValue {
    Number(f64),
    Text(String),
}

impl FilterValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            FilterValue::Number(n) => Some(*n),
            FilterValue::Text(s) => s.trim().parse().ok(),
        }
    }

    pub fn is_blank(&self) -> bool {
        matches!(self, FilterValue::Text(s) if s.trim().is_empty())
    }

    pub fn to_param(&self) -> String {
        match self {
            FilterValue::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => {
                format!("{}", *n as i64)
            }
            FilterValue::Number(n) => n.to_string(),
            FilterValue::Text(s) => s.trim().to_string(),
        }
    }
}

impl From<&str> for FilterValue {
    fn from(value: &str) -> Self {
        FilterValue::Text(value.to_string())
    }
}

impl From<f64> for FilterValue {
    fn from(value: f64) -> Self {
        FilterValue::Number(value)
    }
}

/// Generic filter state keyed by filter id, with `_min`/`_max` suffixes for ranges.
pub type FilterState = BTreeMap<String, FilterValue>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Error,
    InProgress,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Error => "error",
            RunStatus::InProgress => "in_progress",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(RunStatus::Success),
            "error" => Some(RunStatus::Error),
            "in_progress" => Some(RunStatus::InProgress),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    Ingestion,
    Reconciliation,
}

impl WorkerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerKind::Ingestion => "ingestion",
            WorkerKind::Reconciliation => "reconciliation",
        }
    }
}

/// Run log row for one ingestion page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestionRun {
    pub id: String,
    pub source_id: i64,
    pub started_at: DateTime<Utc>,
    pub page: i64,
    pub items_fetched: i64,
    pub status: RunStatus,
    pub error_message: Option<String>,
    pub duration_ms: i64,
}

/// Run log row for one reconciliation run, updated as batches complete.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconciliationRun {
    pub id: String,
    pub source_id: i64,
    pub started_at: DateTime<Utc>,
    pub items_checked: i64,
    pub items_archived: i64,
    pub last_cursor: i64,
    pub status: RunStatus,
    pub error_message: Option<String>,
    pub duration_ms: i64,
}

/// What a worker invocation reports back to its trigger.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RunSummary {
    pub kind: WorkerKind,
    pub source_id: i64,
    pub status: RunStatus,
    pub pages: u32,
    pub items_fetched: u64,
    pub items_checked: u64,
    pub items_archived: u64,
    pub duration_ms: i64,
    pub error: Option<String>,
}

impl RunSummary {
    pub fn new(kind: WorkerKind, source_id: i64) -> Self {
        Self {
            kind,
            source_id,
            status: RunStatus::InProgress,
            pages: 0,
            items_fetched: 0,
            items_checked: 0,
            items_archived: 0,
            duration_ms: 0,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn views_partition_every_state() {
        for hidden in [false, true] {
            for archived in [false, true] {
                let hits = [View::Active, View::Hidden, View::Archived]
                    .iter()
                    .filter(|v| v.contains(hidden, archived))
                    .count();
                assert_eq!(hits, 1, "hidden={hidden} archived={archived}");
            }
        }
    }

    #[test]
    fn filter_value_parses_numbers_from_text() {
        assert_eq!(FilterValue::from(" 12.5 ").as_number(), Some(12.5));
        assert_eq!(FilterValue::from("abc").as_number(), None);
        assert_eq!(FilterValue::from(10.0).to_param(), "10");
        assert!(FilterValue::from("  ").is_blank());
    }

    #[test]
    fn column_kind_accepts_legacy_name() {
        let col: ColumnSpec = serde_json::from_str(
            r#"{"id":"steam_level","label":"Level","kind":"game_specific","is_numeric":true}"#,
        )
        .unwrap();
        assert_eq!(col.kind, ColumnKind::Extension);
    }
}
