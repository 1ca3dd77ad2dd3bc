//! Translation of generic filter/sort state into store predicates and
//! upstream query parameters.
//!
//! Nothing here knows a field name ahead of time: every key is resolved
//! through the source's [`FilterSpec`]s and [`ColumnSpec`](crate::model::ColumnSpec)s.
//! Keys that resolve to nothing are dropped, so stale UI state never breaks a
//! query.
use crate::model::{ColumnKind, FilterKind, FilterSpec, FilterState, FilterValue, SourceConfig};
use crate::schema::CoreField;
use tracing::debug;

/// A listing attribute the store can filter or order on.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldRef {
    Core(CoreField),
    /// Key inside the listing's extension map.
    Extension(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Case-insensitive substring match.
    Contains(String),
    AtLeast(f64),
    AtMost(f64),
    EqualsText(String),
    EqualsNumber(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    pub field: FieldRef,
    pub condition: Condition,
}

/// Conjunction of clauses; empty means "match everything".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StorePredicate {
    pub clauses: Vec<Clause>,
}

impl StorePredicate {
    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortOrder {
    pub field: FieldRef,
    pub ascending: bool,
}

impl Default for SortOrder {
    /// Most recently seen first.
    fn default() -> Self {
        Self {
            field: FieldRef::Core(CoreField::LastSeenAt),
            ascending: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bound {
    Min,
    Max,
    Exact,
}

/// Find the filter a state key refers to. Range bounds arrive as `<id>_min` / `<id>_max`.
fn resolve_filter<'a>(source: &'a SourceConfig, key: &str) -> Option<(&'a FilterSpec, Bound)> {
    for (suffix, bound) in [("_min", Bound::Min), ("_max", Bound::Max)] {
        if let Some(base) = key.strip_suffix(suffix) {
            if let Some(spec) = source.filter(base) {
                if spec.kind == FilterKind::NumberRange {
                    return Some((spec, bound));
                }
            }
        }
    }
    source.filter(key).map(|spec| (spec, Bound::Exact))
}

/// Map an attribute id to where it lives. A declared column decides by its
/// kind; undeclared ids are looked up in the extension map.
fn resolve_field(source: &SourceConfig, id: &str) -> Option<FieldRef> {
    match source.column(id).map(|c| c.kind) {
        Some(ColumnKind::Core) => CoreField::parse(id).map(FieldRef::Core),
        Some(ColumnKind::Extension) => Some(FieldRef::Extension(id.to_string())),
        None => match CoreField::parse(id) {
            Some(core) => Some(FieldRef::Core(core)),
            None => Some(FieldRef::Extension(id.to_string())),
        },
    }
}

fn condition_for(spec: &FilterSpec, bound: Bound, value: &FilterValue) -> Option<Condition> {
    match (spec.kind, bound) {
        (FilterKind::Text, Bound::Exact) => match value {
            FilterValue::Text(s) => Some(Condition::Contains(s.trim().to_string())),
            FilterValue::Number(_) => Some(Condition::Contains(value.to_param())),
        },
        (FilterKind::NumberRange, Bound::Min) => value.as_number().map(Condition::AtLeast),
        (FilterKind::NumberRange, Bound::Max) => value.as_number().map(Condition::AtMost),
        (FilterKind::Select, Bound::Exact) => match value {
            FilterValue::Number(n) => Some(Condition::EqualsNumber(*n)),
            FilterValue::Text(s) => Some(Condition::EqualsText(s.trim().to_string())),
        },
        _ => None,
    }
}

/// Turn a filter-state map into a store predicate for `source`.
pub fn translate(source: &SourceConfig, filters: &FilterState) -> StorePredicate {
    let mut predicate = StorePredicate::default();
    for (key, value) in filters {
        if value.is_blank() {
            continue;
        }
        let Some((spec, bound)) = resolve_filter(source, key) else {
            debug!(source = %source.slug, key, "ignoring unknown filter key");
            continue;
        };
        let Some(field) = resolve_field(source, &spec.id) else {
            debug!(source = %source.slug, key, "filter target is not addressable");
            continue;
        };
        let Some(condition) = condition_for(spec, bound, value) else {
            debug!(source = %source.slug, key, "filter value does not fit filter kind");
            continue;
        };
        predicate.clauses.push(Clause { field, condition });
    }
    predicate
}

/// Pick the sort for a requested id, falling back to the source's first sort
/// and then to most recently seen first.
pub fn resolve_sort(source: &SourceConfig, requested: Option<&str>) -> SortOrder {
    let spec = requested
        .and_then(|id| source.sort(id))
        .or_else(|| source.sorts.first());
    let Some(spec) = spec else {
        return SortOrder::default();
    };
    match resolve_field(source, &spec.column) {
        Some(field) => SortOrder {
            field,
            ascending: spec.ascending,
        },
        None => SortOrder::default(),
    }
}

/// Upstream query parameters for the caller-supplied filters, using each
/// filter's `param_name*` mapping. `[]`-suffixed params repeat once per
/// comma-separated value.
pub fn upstream_params(source: &SourceConfig, filters: &FilterState) -> Vec<(String, String)> {
    let mut params = Vec::new();
    for (key, value) in filters {
        if value.is_blank() {
            continue;
        }
        let Some((spec, bound)) = resolve_filter(source, key) else {
            continue;
        };
        let name = match (spec.kind, bound) {
            (FilterKind::NumberRange, Bound::Min) => spec.param_name_min.as_deref(),
            (FilterKind::NumberRange, Bound::Max) => spec.param_name_max.as_deref(),
            (FilterKind::NumberRange, Bound::Exact) => None,
            (_, Bound::Exact) => spec.param_name.as_deref(),
            _ => None,
        };
        let Some(name) = name else {
            continue;
        };
        let rendered = value.to_param();
        if name.ends_with("[]") {
            for part in rendered.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                params.push((name.to_string(), part.to_string()));
            }
        } else {
            params.push((name.to_string(), rendered));
        }
    }
    params
}
