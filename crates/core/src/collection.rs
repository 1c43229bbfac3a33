//! Per-resource descriptions of the synced collections.

use serde::{Deserialize, Serialize};

/// Describes which fields of a remote resource the sync layer relies on.
///
/// Everything else in a record is carried through untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSpec {
    /// Remote resource (table) name.
    pub resource: String,
    /// ISO-8601 date field used to partition recent vs historical and for date filters.
    pub date_field: String,
    /// Fields matched case-insensitively by the free-text search term.
    pub text_fields: Vec<String>,
    /// Field matched by the category/type filter.
    pub type_field: String,
    /// Field matched by the agency/source filter.
    pub agency_field: String,
    /// Fields that arrive as text but must be stored as numbers.
    pub numeric_fields: Vec<String>,
}

impl CollectionSpec {
    /// Court cases brought by enforcement agencies.
    pub fn cases() -> Self {
        Self {
            resource: "cases".into(),
            date_field: "offence_action_date".into(),
            text_fields: vec!["offender_name".into(), "regulator_id".into(), "offence_breaches".into()],
            type_field: "offence_result".into(),
            agency_field: "agency_id".into(),
            numeric_fields: vec!["offence_fine".into(), "offence_costs".into(), "offence_compensation".into()],
        }
    }

    /// Enforcement notices served on offenders.
    pub fn notices() -> Self {
        Self {
            resource: "notices".into(),
            date_field: "notice_date".into(),
            text_fields: vec!["offender_name".into(), "regulator_id".into(), "notice_body".into()],
            type_field: "notice_type".into(),
            agency_field: "agency_id".into(),
            numeric_fields: Vec::new(),
        }
    }
}
