//! Search parameters and everything derived from them.
//!
//! Three pure derivations hang off [`SearchParams`]:
//! - a cache key that identifies repeat queries regardless of field order
//! - a human-readable description for cache introspection
//! - a [`Predicate`] handed to the remote protocol and evaluated locally
//!
//! ### Cache key format
//! Field names sorted lexicographically, empty values dropped, values trimmed and
//! lower-cased, joined as `field:value` pairs with `|`. No fields yields `"empty"`.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{CollectionSpec, Error, Record};

/// Sentinel key for a search with no filter fields.
pub const EMPTY_CACHE_KEY: &str = "empty";

/// Filters accepted by an on-demand search.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchParams {
    /// Free-text term matched against the collection's text fields.
    #[serde(default)]
    pub search_term: Option<String>,
    /// Category/type filter.
    #[serde(default)]
    pub record_type: Option<String>,
    /// Agency/source identifier.
    #[serde(default)]
    pub agency_id: Option<String>,
    /// Inclusive lower date bound (YYYY-MM-DD).
    #[serde(default)]
    pub date_from: Option<String>,
    /// Inclusive upper date bound (YYYY-MM-DD).
    #[serde(default)]
    pub date_to: Option<String>,
}

impl SearchParams {
    pub fn term(term: &str) -> Self {
        Self { search_term: Some(term.to_string()), ..Default::default() }
    }

    /// All recognized filter fields with their raw values.
    pub fn fields(&self) -> [(&'static str, Option<&str>); 5] {
        [
            ("search_term", self.search_term.as_deref()),
            ("record_type", self.record_type.as_deref()),
            ("agency_id", self.agency_id.as_deref()),
            ("date_from", self.date_from.as_deref()),
            ("date_to", self.date_to.as_deref()),
        ]
    }

    pub fn cache_key(&self) -> String {
        generate_cache_key(self.fields())
    }

    pub fn description(&self) -> String {
        generate_search_description(self)
    }

    /// Reject malformed date bounds before any subscription is opened.
    pub fn validate(&self) -> Result<(), Error> {
        let from = parse_date_param("date_from", self.date_from.as_deref())?;
        let to = parse_date_param("date_to", self.date_to.as_deref())?;
        match (from, to) {
            (Some(from), Some(to)) if from > to => {
                Err(Error::InvalidInput(format!("date_from {from} is after date_to {to}")))
            }
            _ => Ok(()),
        }
    }
}

fn parse_date_param(field: &str, value: Option<&str>) -> Result<Option<NaiveDate>, Error> {
    match non_empty(value) {
        None => Ok(None),
        Some(raw) => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .map(Some)
            .map_err(|_| Error::InvalidInput(format!("{field} must be YYYY-MM-DD, got {raw:?}"))),
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Build a deterministic cache key from `(field, value)` pairs.
///
/// Input order does not matter.
pub fn generate_cache_key<'a, I>(fields: I) -> String
where
    I: IntoIterator<Item = (&'a str, Option<&'a str>)>,
{
    let mut pairs: Vec<(&str, String)> = fields
        .into_iter()
        .filter_map(|(name, value)| non_empty(value).map(|v| (name, v.to_lowercase())))
        .collect();

    if pairs.is_empty() {
        return EMPTY_CACHE_KEY.to_string();
    }

    pairs.sort();
    pairs
        .iter()
        .map(|(name, value)| format!("{name}:{value}"))
        .collect::<Vec<_>>()
        .join("|")
}

/// Short display string for a search, e.g.
/// `Search: "acme" • Type: improvement • Dates: 2024-01-01 to 2024-06-01`.
pub fn generate_search_description(params: &SearchParams) -> String {
    let mut parts = Vec::new();

    if let Some(term) = non_empty(params.search_term.as_deref()) {
        parts.push(format!("Search: \"{term}\""));
    }
    if let Some(kind) = non_empty(params.record_type.as_deref()) {
        parts.push(format!("Type: {kind}"));
    }
    if let Some(agency) = non_empty(params.agency_id.as_deref()) {
        parts.push(format!("Agency: {agency}"));
    }
    match (non_empty(params.date_from.as_deref()), non_empty(params.date_to.as_deref())) {
        (Some(from), Some(to)) => parts.push(format!("Dates: {from} to {to}")),
        (Some(from), None) => parts.push(format!("From: {from}")),
        (None, Some(to)) => parts.push(format!("Until: {to}")),
        (None, None) => {}
    }

    if parts.is_empty() { "All records".to_string() } else { parts.join(" • ") }
}

/// One AND-ed term of a [`Predicate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conjunct {
    /// Case-insensitive substring match against any of `fields`. `term` is lower-case.
    TextMatch { fields: Vec<String>, term: String },
    /// Case-insensitive equality.
    Equals { field: String, value: String },
    OnOrAfter { field: String, date: String },
    OnOrBefore { field: String, date: String },
    /// Strictly before `date`; records without the field match when `include_missing`.
    Before { field: String, date: String, include_missing: bool },
}

/// Conjunction of filter terms over one collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Predicate {
    conjuncts: Vec<Conjunct>,
}

impl Predicate {
    pub fn new(conjuncts: Vec<Conjunct>) -> Self {
        Self { conjuncts }
    }

    /// Derive the search predicate: one conjunct per present, non-empty filter field.
    pub fn for_search(params: &SearchParams, spec: &CollectionSpec) -> Self {
        let mut conjuncts = Vec::new();

        if let Some(term) = non_empty(params.search_term.as_deref()) {
            conjuncts.push(Conjunct::TextMatch { fields: spec.text_fields.clone(), term: term.to_lowercase() });
        }
        if let Some(kind) = non_empty(params.record_type.as_deref()) {
            conjuncts.push(Conjunct::Equals { field: spec.type_field.clone(), value: kind.to_lowercase() });
        }
        if let Some(agency) = non_empty(params.agency_id.as_deref()) {
            conjuncts.push(Conjunct::Equals { field: spec.agency_field.clone(), value: agency.to_lowercase() });
        }
        if let Some(from) = non_empty(params.date_from.as_deref()) {
            conjuncts.push(Conjunct::OnOrAfter { field: spec.date_field.clone(), date: from.to_string() });
        }
        if let Some(to) = non_empty(params.date_to.as_deref()) {
            conjuncts.push(Conjunct::OnOrBefore { field: spec.date_field.clone(), date: to.to_string() });
        }

        Self { conjuncts }
    }

    /// Records dated on or after `cutoff`.
    pub fn recent(spec: &CollectionSpec, cutoff: NaiveDate) -> Self {
        Self::new(vec![Conjunct::OnOrAfter { field: spec.date_field.clone(), date: cutoff.to_string() }])
    }

    /// Complement of [`Predicate::recent`], undated records included.
    pub fn historical(spec: &CollectionSpec, cutoff: NaiveDate) -> Self {
        Self::new(vec![Conjunct::Before {
            field: spec.date_field.clone(),
            date: cutoff.to_string(),
            include_missing: true,
        }])
    }

    pub fn is_empty(&self) -> bool {
        self.conjuncts.is_empty()
    }

    pub fn conjuncts(&self) -> &[Conjunct] {
        &self.conjuncts
    }

    /// Evaluate the predicate against a record held locally.
    pub fn matches(&self, record: &Record) -> bool {
        self.conjuncts.iter().all(|c| c.matches(record))
    }
}

impl Conjunct {
    fn matches(&self, record: &Record) -> bool {
        match self {
            Conjunct::TextMatch { fields, term } => fields
                .iter()
                .filter_map(|field| field_text(record, field))
                .any(|text| text.to_lowercase().contains(term.as_str())),
            Conjunct::Equals { field, value } => {
                field_text(record, field).is_some_and(|text| text.trim().to_lowercase() == *value)
            }
            Conjunct::OnOrAfter { field, date } => {
                record.text(field).is_some_and(|d| date_key(d) >= date_key(date))
            }
            Conjunct::OnOrBefore { field, date } => {
                record.text(field).is_some_and(|d| date_key(d) <= date_key(date))
            }
            Conjunct::Before { field, date, include_missing } => match record.text(field) {
                Some(d) => date_key(d) < date_key(date),
                None => *include_missing,
            },
        }
    }
}

fn field_text(record: &Record, field: &str) -> Option<String> {
    match record.get(field)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Compare timestamps by their calendar-date prefix.
fn date_key(value: &str) -> &str {
    value.get(..10).unwrap_or(value)
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn like_pattern(term: &str) -> String {
    let escaped = term.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_");
    quote(&format!("%{escaped}%"))
}

impl fmt::Display for Conjunct {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Conjunct::TextMatch { fields, term } => {
                let pattern = like_pattern(term);
                let alternatives: Vec<String> = fields.iter().map(|field| format!("{field} ILIKE {pattern}")).collect();
                write!(f, "({})", alternatives.join(" OR "))
            }
            Conjunct::Equals { field, value } => write!(f, "LOWER({field}) = {}", quote(value)),
            Conjunct::OnOrAfter { field, date } => write!(f, "{field} >= {}", quote(date)),
            Conjunct::OnOrBefore { field, date } => write!(f, "{field} <= {}", quote(date)),
            Conjunct::Before { field, date, include_missing: true } => {
                write!(f, "({field} < {} OR {field} IS NULL)", quote(date))
            }
            Conjunct::Before { field, date, include_missing: false } => write!(f, "{field} < {}", quote(date)),
        }
    }
}

/// Renders the where-clause string sent to the remote protocol.
impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.conjuncts.iter().map(ToString::to_string).collect();
        f.write_str(&rendered.join(" AND "))
    }
}
