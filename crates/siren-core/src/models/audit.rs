//! Audit trail models

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::models::Platform;

/// Before/after values of one field in one write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    /// Value before the write (None when the field was unset)
    pub old: Option<Value>,
    /// Value after the write
    pub new: Value,
}

/// Where a request came from, for forensics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    /// Origin network address, if known
    pub origin_addr: Option<String>,
    /// Client identification string, if known
    pub client_info: Option<String>,
}

/// One immutable audit entry: a single successful field-level change
/// to a report. Exactly one exists per successful write, including
/// writes produced by conflict resolution. Never updated or deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Row id
    pub id: i64,
    /// Report the write touched
    pub report_id: String,
    /// Actor who wrote
    pub actor_id: String,
    /// Platform the write came from
    pub actor_platform: Platform,
    /// Commit timestamp (Unix ms)
    pub timestamp: i64,
    /// Report version the write produced
    pub version: i64,
    /// Names of the fields the write changed
    pub modified_fields: BTreeSet<String>,
    /// Before/after values per changed field
    pub field_changes: BTreeMap<String, FieldChange>,
    /// Optional free-text reason supplied by the caller
    pub reason: Option<String>,
    /// Request provenance
    pub provenance: Provenance,
}

/// An audit entry about to be appended, before it has a row id
#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    /// Report the write touched
    pub report_id: String,
    /// Actor who wrote
    pub actor_id: String,
    /// Platform the write came from
    pub actor_platform: Platform,
    /// Commit timestamp (Unix ms)
    pub timestamp: i64,
    /// Report version the write produced
    pub version: i64,
    /// Names of the fields the write changed
    pub modified_fields: BTreeSet<String>,
    /// Before/after values per changed field
    pub field_changes: BTreeMap<String, FieldChange>,
    /// Optional free-text reason
    pub reason: Option<String>,
    /// Request provenance
    pub provenance: Provenance,
}
