//! Incident report model

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::Platform;

/// A unique identifier for a report, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReportId(Uuid);

impl ReportId {
    /// Create a new unique report ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for ReportId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ReportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ReportId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Named field values of a report, keyed by schema field name
pub type FieldMap = BTreeMap<String, Value>;

/// A disaster incident report under concurrent edit
///
/// Mutated only through the record store; `version` goes up by exactly
/// one on every successful write and no write happens outside an
/// exclusive transaction on the row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    /// Unique identifier
    pub id: ReportId,
    /// Optimistic-concurrency version counter, 1 on creation
    pub version: i64,
    /// Current field values
    pub fields: FieldMap,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    /// Last successful write timestamp (Unix ms)
    pub last_modified_at: i64,
    /// Actor id of the last successful write
    pub last_modified_by: String,
    /// Platform of the last successful write
    pub last_modified_platform: Platform,
}

impl Report {
    /// Current value of a field, if set
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

/// The report field schema: which fields exist and how concurrent
/// edits to them are classified.
pub mod schema {
    use super::{Error, FieldMap, Result};

    /// Identity-defining fields; concurrent edits always escalate to
    /// manual review.
    pub const CRITICAL_FIELDS: &[&str] = &["title", "category", "severity", "status", "location"];

    /// Fields whose concurrent values can be combined programmatically
    /// (free text concatenates, scalars take the newer value).
    pub const MERGEABLE_FIELDS: &[&str] = &[
        "description",
        "situation_notes",
        "estimated_affected",
        "weather_conditions",
        "access_conditions",
    ];

    /// Remaining known fields, neither critical nor mergeable
    pub const OTHER_FIELDS: &[&str] = &["contact_number", "assigned_team", "archived"];

    /// Whether `name` is part of the report schema
    #[must_use]
    pub fn is_known_field(name: &str) -> bool {
        CRITICAL_FIELDS.contains(&name)
            || MERGEABLE_FIELDS.contains(&name)
            || OTHER_FIELDS.contains(&name)
    }

    /// Validate a proposed field map: non-empty and restricted to the
    /// known field set. Value typing is guaranteed upstream.
    pub fn validate_fields(fields: &FieldMap) -> Result<()> {
        if fields.is_empty() {
            return Err(Error::InvalidInput(
                "proposed update contains no fields".into(),
            ));
        }
        for name in fields.keys() {
            if !is_known_field(name) {
                return Err(Error::InvalidInput(format!("unknown field: {name}")));
            }
        }
        Ok(())
    }
}
