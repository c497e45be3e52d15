//! Append-only audit trail
//!
//! Every successful field-level change to a report lands here exactly
//! once, including writes produced by conflict resolution. The trail is
//! the sole input to conflict detection and the system's forensic
//! record; no update or delete operation exists (and the schema's
//! triggers abort any attempt made around this API).

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::Result;
use crate::models::{AuditEntry, FieldChange, NewAuditEntry, Platform};

/// Insert-and-query handle over the `audit_entries` table.
///
/// `append` is only called from inside the record store's or review
/// queue's transaction, so an entry commits atomically with the write
/// it describes.
pub struct AuditLog<'a> {
    conn: &'a Connection,
}

impl<'a> AuditLog<'a> {
    /// Create a log handle over the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Append one entry; returns its row id
    pub fn append(&self, entry: &NewAuditEntry) -> Result<i64> {
        let modified_fields = serde_json::to_string(&entry.modified_fields)?;
        let field_changes = serde_json::to_string(&entry.field_changes)?;

        self.conn.execute(
            "INSERT INTO audit_entries (report_id, actor_id, actor_platform, timestamp,
             version, modified_fields, field_changes, reason, origin_addr, client_info)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                entry.report_id,
                entry.actor_id,
                entry.actor_platform.as_str(),
                entry.timestamp,
                entry.version,
                modified_fields,
                field_changes,
                entry.reason,
                entry.provenance.origin_addr,
                entry.provenance.client_info,
            ],
        )?;

        Ok(self.conn.last_insert_rowid())
    }

    /// Most recent entry for a report at or after `since`, excluding
    /// entries written by `exclude_actor`.
    ///
    /// This is the conflict detector's window query; excluding the
    /// current actor at the query level is what makes a client's retry
    /// of its own update conflict-free.
    pub fn recent_for(
        &self,
        report_id: &str,
        since: i64,
        exclude_actor: &str,
    ) -> Result<Option<AuditEntry>> {
        let entry = self
            .conn
            .query_row(
                "SELECT id, report_id, actor_id, actor_platform, timestamp, version,
                        modified_fields, field_changes, reason, origin_addr, client_info
                 FROM audit_entries
                 WHERE report_id = ? AND timestamp >= ? AND actor_id != ?
                 ORDER BY timestamp DESC, id DESC
                 LIMIT 1",
                params![report_id, since, exclude_actor],
                Self::parse_entry,
            )
            .optional()?;

        Ok(entry)
    }

    /// All entries for a report in commit order
    pub fn for_report(&self, report_id: &str) -> Result<Vec<AuditEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, report_id, actor_id, actor_platform, timestamp, version,
                    modified_fields, field_changes, reason, origin_addr, client_info
             FROM audit_entries
             WHERE report_id = ?
             ORDER BY id ASC",
        )?;

        let entries = stmt
            .query_map(params![report_id], Self::parse_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(entries)
    }

    /// Parse an audit entry from a database row
    fn parse_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEntry> {
        let platform: String = row.get(3)?;
        let modified_fields: String = row.get(6)?;
        let field_changes: String = row.get(7)?;

        let actor_platform = platform
            .parse::<Platform>()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;
        let modified_fields: BTreeSet<String> = serde_json::from_str(&modified_fields)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?;
        let field_changes: BTreeMap<String, FieldChange> = serde_json::from_str(&field_changes)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(7, Type::Text, Box::new(e)))?;

        Ok(AuditEntry {
            id: row.get(0)?,
            report_id: row.get(1)?,
            actor_id: row.get(2)?,
            actor_platform,
            timestamp: row.get(4)?,
            version: row.get(5)?,
            modified_fields,
            field_changes,
            reason: row.get(8)?,
            provenance: crate::models::Provenance {
                origin_addr: row.get(9)?,
                client_info: row.get(10)?,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::Provenance;
    use serde_json::json;

    fn insert_report(conn: &Connection, id: &str) {
        conn.execute(
            "INSERT INTO reports (id, version, fields, created_at, last_modified_at,
             last_modified_by, last_modified_platform)
             VALUES (?, 1, '{}', 0, 0, 'seed', 'mobile')",
            params![id],
        )
        .unwrap();
    }

    fn entry(report_id: &str, actor_id: &str, timestamp: i64, fields: &[&str]) -> NewAuditEntry {
        let modified_fields: BTreeSet<String> = fields.iter().map(|f| (*f).to_string()).collect();
        let field_changes = fields
            .iter()
            .map(|f| {
                (
                    (*f).to_string(),
                    FieldChange {
                        old: None,
                        new: json!("x"),
                    },
                )
            })
            .collect();
        NewAuditEntry {
            report_id: report_id.into(),
            actor_id: actor_id.into(),
            actor_platform: Platform::Mobile,
            timestamp,
            version: 2,
            modified_fields,
            field_changes,
            reason: None,
            provenance: Provenance::default(),
        }
    }

    #[test]
    fn test_append_and_read_back() {
        let db = Database::open_in_memory().unwrap();
        insert_report(db.connection(), "r1");
        let log = AuditLog::new(db.connection());

        let id = log.append(&entry("r1", "a1", 100, &["status"])).unwrap();
        assert!(id > 0);

        let entries = log.for_report("r1").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].actor_id, "a1");
        assert!(entries[0].modified_fields.contains("status"));
    }

    #[test]
    fn test_recent_for_excludes_actor() {
        let db = Database::open_in_memory().unwrap();
        insert_report(db.connection(), "r1");
        let log = AuditLog::new(db.connection());

        log.append(&entry("r1", "a1", 100, &["status"])).unwrap();

        // The writer's own entry must not count against them
        assert!(log.recent_for("r1", 0, "a1").unwrap().is_none());
        assert!(log.recent_for("r1", 0, "a2").unwrap().is_some());
    }

    #[test]
    fn test_recent_for_respects_window() {
        let db = Database::open_in_memory().unwrap();
        insert_report(db.connection(), "r1");
        let log = AuditLog::new(db.connection());

        log.append(&entry("r1", "a1", 100, &["status"])).unwrap();

        assert!(log.recent_for("r1", 101, "a2").unwrap().is_none());
        assert!(log.recent_for("r1", 100, "a2").unwrap().is_some());
    }

    #[test]
    fn test_recent_for_returns_latest() {
        let db = Database::open_in_memory().unwrap();
        insert_report(db.connection(), "r1");
        let log = AuditLog::new(db.connection());

        log.append(&entry("r1", "a1", 100, &["status"])).unwrap();
        log.append(&entry("r1", "a2", 200, &["description"])).unwrap();

        let latest = log.recent_for("r1", 0, "a3").unwrap().unwrap();
        assert_eq!(latest.actor_id, "a2");
        assert_eq!(latest.timestamp, 200);
    }

    #[test]
    fn test_entries_ordered_by_commit() {
        let db = Database::open_in_memory().unwrap();
        insert_report(db.connection(), "r1");
        let log = AuditLog::new(db.connection());

        log.append(&entry("r1", "a1", 100, &["status"])).unwrap();
        log.append(&entry("r1", "a2", 150, &["title"])).unwrap();
        log.append(&entry("r1", "a1", 200, &["description"])).unwrap();

        let entries = log.for_report("r1").unwrap();
        let ids: Vec<i64> = entries.iter().map(|e| e.id).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);
    }
}
