//! Shared locked-write path
//!
//! Both the record store and the review queue end their critical
//! sections here: compute the before/after diff, bump the version by
//! exactly one, stamp the row, and append the single audit entry — all
//! against the transaction the caller already holds.

use rusqlite::Connection;
use std::collections::{BTreeMap, BTreeSet};

use crate::audit::AuditLog;
use crate::db::{ReportRepository, SqliteReportRepository};
use crate::error::Result;
use crate::models::{FieldChange, FieldMap, NewAuditEntry, Platform, Provenance, Report};

/// Result of one committed-to-be write
pub(crate) struct WriteOutcome {
    /// The report as persisted
    pub report: Report,
    /// Fields whose values actually changed
    pub modified_fields: BTreeSet<String>,
}

/// Apply `changes` to `report` inside the caller's transaction.
///
/// Only fields whose value actually differs end up in the audit entry,
/// so a merge's entry reflects the final merged write, not the raw
/// proposal. An empty change set still bumps the version and appends
/// an entry; the trail is never silent about a decision.
#[allow(clippy::too_many_arguments)]
pub(crate) fn apply_write(
    conn: &Connection,
    report: &Report,
    changes: &FieldMap,
    actor_id: &str,
    platform: Platform,
    reason: Option<String>,
    provenance: &Provenance,
    now: i64,
) -> Result<WriteOutcome> {
    let mut fields = report.fields.clone();
    let mut field_changes: BTreeMap<String, FieldChange> = BTreeMap::new();

    for (name, value) in changes {
        let old = report.field(name);
        if old != Some(value) {
            field_changes.insert(
                name.clone(),
                FieldChange {
                    old: old.cloned(),
                    new: value.clone(),
                },
            );
            fields.insert(name.clone(), value.clone());
        }
    }

    let updated = Report {
        id: report.id,
        version: report.version + 1,
        fields,
        created_at: report.created_at,
        last_modified_at: now,
        last_modified_by: actor_id.to_string(),
        last_modified_platform: platform,
    };

    let repo = SqliteReportRepository::new(conn);
    repo.update_state(&updated)?;

    let modified_fields: BTreeSet<String> = field_changes.keys().cloned().collect();
    let entry = NewAuditEntry {
        report_id: updated.id.as_str(),
        actor_id: actor_id.to_string(),
        actor_platform: platform,
        timestamp: now,
        version: updated.version,
        modified_fields: modified_fields.clone(),
        field_changes,
        reason,
        provenance: provenance.clone(),
    };
    AuditLog::new(conn).append(&entry)?;

    Ok(WriteOutcome {
        report: updated,
        modified_fields,
    })
}
