//! Report row access
//!
//! Low-level reads and writes of the `reports` table. Mutation is only
//! ever invoked from inside an immediate transaction held by the record
//! store or the review queue; nothing else may touch the row.

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT

use crate::error::{Error, Result};
use crate::models::{FieldMap, Platform, Report, ReportId};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};

/// Trait for report row operations
pub trait ReportRepository {
    /// Fetch a report by ID
    fn get(&self, id: &ReportId) -> Result<Option<Report>>;

    /// Insert a newly created report row
    fn insert(&self, report: &Report) -> Result<()>;

    /// Overwrite a report's fields, version, and last-modified stamps
    fn update_state(&self, report: &Report) -> Result<()>;

    /// List reports, most recently modified first
    fn list(&self, limit: usize) -> Result<Vec<Report>>;
}

/// `SQLite` implementation of `ReportRepository`
pub struct SqliteReportRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteReportRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Parse a report from a database row
    fn parse_report(row: &rusqlite::Row<'_>) -> rusqlite::Result<Report> {
        let id: String = row.get(0)?;
        let fields_json: String = row.get(2)?;
        let platform: String = row.get(6)?;

        let id = id
            .parse::<ReportId>()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?;
        let fields: FieldMap = serde_json::from_str(&fields_json)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;
        let platform = platform
            .parse::<Platform>()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?;

        Ok(Report {
            id,
            version: row.get(1)?,
            fields,
            created_at: row.get(3)?,
            last_modified_at: row.get(4)?,
            last_modified_by: row.get(5)?,
            last_modified_platform: platform,
        })
    }
}

impl ReportRepository for SqliteReportRepository<'_> {
    fn get(&self, id: &ReportId) -> Result<Option<Report>> {
        let report = self
            .conn
            .query_row(
                "SELECT id, version, fields, created_at, last_modified_at,
                        last_modified_by, last_modified_platform
                 FROM reports WHERE id = ?",
                params![id.as_str()],
                Self::parse_report,
            )
            .optional()?;

        Ok(report)
    }

    fn insert(&self, report: &Report) -> Result<()> {
        let fields_json = serde_json::to_string(&report.fields)?;
        self.conn.execute(
            "INSERT INTO reports (id, version, fields, created_at, last_modified_at,
             last_modified_by, last_modified_platform)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                report.id.as_str(),
                report.version,
                fields_json,
                report.created_at,
                report.last_modified_at,
                report.last_modified_by,
                report.last_modified_platform.as_str(),
            ],
        )?;
        Ok(())
    }

    fn update_state(&self, report: &Report) -> Result<()> {
        let fields_json = serde_json::to_string(&report.fields)?;
        let rows = self.conn.execute(
            "UPDATE reports
             SET version = ?, fields = ?, last_modified_at = ?,
                 last_modified_by = ?, last_modified_platform = ?
             WHERE id = ?",
            params![
                report.version,
                fields_json,
                report.last_modified_at,
                report.last_modified_by,
                report.last_modified_platform.as_str(),
                report.id.as_str(),
            ],
        )?;

        if rows == 0 {
            return Err(Error::NotFound(report.id.to_string()));
        }
        Ok(())
    }

    fn list(&self, limit: usize) -> Result<Vec<Report>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, version, fields, created_at, last_modified_at,
                    last_modified_by, last_modified_platform
             FROM reports
             ORDER BY last_modified_at DESC
             LIMIT ?",
        )?;

        let reports = stmt
            .query_map(params![limit as i64], Self::parse_report)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(reports)
    }
}
