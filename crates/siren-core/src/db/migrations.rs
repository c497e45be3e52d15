//! Database migrations

use crate::error::Result;
use rusqlite::Connection;

/// Current schema version
const CURRENT_VERSION: i32 = 1;

/// Run all pending migrations
pub fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        migrate_v1(conn)?;
    }

    Ok(())
}

/// Get the current schema version
fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get::<_, i32>(0).map(|v| v != 0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    Ok(version)
}

/// Migration to version 1: reports, audit trail, conflict queue
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "BEGIN;

        -- Schema version tracking
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );

        -- Reports: current state plus the optimistic-concurrency version
        CREATE TABLE IF NOT EXISTS reports (
            id TEXT PRIMARY KEY,
            version INTEGER NOT NULL,
            fields TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            last_modified_at INTEGER NOT NULL,
            last_modified_by TEXT NOT NULL,
            last_modified_platform TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_reports_modified ON reports(last_modified_at DESC);

        -- Append-only audit trail; one row per successful write
        CREATE TABLE IF NOT EXISTS audit_entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            report_id TEXT NOT NULL REFERENCES reports(id),
            actor_id TEXT NOT NULL,
            actor_platform TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            version INTEGER NOT NULL,
            modified_fields TEXT NOT NULL,
            field_changes TEXT NOT NULL,
            reason TEXT,
            origin_addr TEXT,
            client_info TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_audit_report_time ON audit_entries(report_id, timestamp DESC);
        CREATE INDEX IF NOT EXISTS idx_audit_actor_time ON audit_entries(actor_id, timestamp DESC);

        -- Structural immutability: the trail admits inserts only
        CREATE TRIGGER IF NOT EXISTS audit_entries_no_update BEFORE UPDATE ON audit_entries
        BEGIN
            SELECT RAISE(ABORT, 'audit entries are immutable');
        END;
        CREATE TRIGGER IF NOT EXISTS audit_entries_no_delete BEFORE DELETE ON audit_entries
        BEGIN
            SELECT RAISE(ABORT, 'audit entries are immutable');
        END;

        -- Conflicts awaiting or having received a decision
        CREATE TABLE IF NOT EXISTS conflict_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            report_id TEXT NOT NULL REFERENCES reports(id),
            conflicting_actor_id TEXT NOT NULL,
            original_actor_id TEXT NOT NULL,
            conflicting_fields TEXT NOT NULL,
            proposed_changes TEXT NOT NULL,
            original_snapshot TEXT,
            severity TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending_review',
            resolved_by TEXT,
            resolution_action TEXT,
            resolution_notes TEXT,
            created_at INTEGER NOT NULL,
            resolved_at INTEGER,
            expires_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_conflicts_status ON conflict_queue(status);
        CREATE INDEX IF NOT EXISTS idx_conflicts_report ON conflict_queue(report_id);

        INSERT INTO schema_version (version) VALUES (1);

        COMMIT;",
    )?;

    tracing::info!("Migrated database to version {CURRENT_VERSION}");
    Ok(())
}
