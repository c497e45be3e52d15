//! Manual review queue
//!
//! Durable store of conflicts the strategy engine could not settle.
//! Administrator actions re-acquire the record lock and commit the
//! record mutation and the conflict's terminal transition atomically.

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use crate::conflict::{manual_merge, EngineConfig};
use crate::db::{Database, ReportRepository, SqliteReportRepository};
use crate::error::{Error, Result};
use crate::models::{
    Actor, ConflictRecord, ConflictStatus, FieldMap, NewConflict, Platform, Provenance, Report,
    ReportId, ResolutionAction, Severity,
};
use crate::notify::{Notice, NotificationDispatcher, NotificationKind, NullDispatcher};
use crate::store::apply_write;
use crate::util::{Clock, SystemClock};

/// Queue configuration
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// How long a pending conflict lives before it expires unreviewed
    pub review_ttl: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            review_ttl: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// Administrator-facing operations over the conflict queue
pub struct ManualReviewQueue {
    config: QueueConfig,
    merge: EngineConfig,
    dispatcher: Arc<dyn NotificationDispatcher>,
    clock: Arc<dyn Clock>,
}

impl Default for ManualReviewQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default(), EngineConfig::default())
    }
}

impl ManualReviewQueue {
    /// Create a queue; `merge` supplies the mergeable field set for the
    /// `merge_changes` action.
    pub fn new(config: QueueConfig, merge: EngineConfig) -> Self {
        Self {
            config,
            merge,
            dispatcher: Arc::new(NullDispatcher),
            clock: Arc::new(SystemClock),
        }
    }

    /// Wire up post-commit notification delivery
    #[must_use]
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn NotificationDispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// Replace the time source (tests pin it)
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// When a conflict created at `now` expires
    #[must_use]
    pub fn expiry_deadline(&self, now: i64) -> i64 {
        #[allow(clippy::cast_possible_wrap)]
        let ttl_ms = self.config.review_ttl.as_millis() as i64;
        now.saturating_add(ttl_ms)
    }

    /// Insert a conflict record; called from inside the record store's
    /// transaction so the deferral commits with the detection that
    /// caused it. Returns the new row id.
    pub fn enqueue(&self, conn: &Connection, conflict: &NewConflict) -> Result<i64> {
        let conflicting_fields = serde_json::to_string(&conflict.conflicting_fields)?;
        let proposed_changes = serde_json::to_string(&conflict.proposed_changes)?;
        let original_snapshot = conflict
            .original_snapshot
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        conn.execute(
            "INSERT INTO conflict_queue (report_id, conflicting_actor_id, original_actor_id,
             conflicting_fields, proposed_changes, original_snapshot, severity, status,
             created_at, expires_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, 'pending_review', ?, ?)",
            params![
                conflict.report_id,
                conflict.conflicting_actor_id,
                conflict.original_actor_id,
                conflicting_fields,
                proposed_changes,
                original_snapshot,
                conflict.severity.as_str(),
                conflict.created_at,
                conflict.expires_at,
            ],
        )?;

        let id = conn.last_insert_rowid();
        tracing::info!(
            conflict_id = id,
            report_id = %conflict.report_id,
            severity = %conflict.severity,
            "conflict enqueued for manual review"
        );
        Ok(id)
    }

    /// Fetch one conflict record
    pub fn get(&self, db: &Database, conflict_id: i64) -> Result<ConflictRecord> {
        Self::fetch(db.connection(), conflict_id)?
            .ok_or_else(|| Error::NotFound(format!("conflict {conflict_id}")))
    }

    /// Pending conflicts, oldest first, optionally scoped to a report
    pub fn list_pending(
        &self,
        db: &Database,
        report_id: Option<&ReportId>,
    ) -> Result<Vec<ConflictRecord>> {
        let conn = db.connection();

        let records = match report_id {
            Some(report_id) => {
                let mut stmt = conn.prepare(&format!(
                    "{SELECT_CONFLICT} WHERE status = 'pending_review' AND report_id = ?
                     ORDER BY created_at ASC"
                ))?;
                let rows = stmt.query_map(params![report_id.as_str()], Self::parse_conflict)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "{SELECT_CONFLICT} WHERE status = 'pending_review' ORDER BY created_at ASC"
                ))?;
                let rows = stmt.query_map([], Self::parse_conflict)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };

        Ok(records)
    }

    /// Settle a pending conflict with an administrator action.
    ///
    /// Re-acquires the record lock; the record write (when the action
    /// produces one), the version bump, the audit entry, and the
    /// conflict's transition to `resolved` commit atomically. Returns
    /// the report as persisted.
    pub fn resolve(
        &self,
        db: &mut Database,
        conflict_id: i64,
        action: ResolutionAction,
        resolver: &Actor,
        notes: Option<String>,
        custom_fields: Option<FieldMap>,
    ) -> Result<Report> {
        let now = self.clock.now_ms();

        let tx = db
            .connection_mut()
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let conflict = Self::fetch(&tx, conflict_id)?
            .ok_or_else(|| Error::NotFound(format!("conflict {conflict_id}")))?;
        if conflict.status.is_terminal() {
            return Err(Error::ConflictClosed {
                id: conflict_id,
                status: conflict.status,
            });
        }

        let report_id: ReportId = conflict
            .report_id
            .parse()
            .map_err(|_| Error::InvalidInput(format!("corrupt report id on conflict {conflict_id}")))?;
        let report = SqliteReportRepository::new(&tx)
            .get(&report_id)?
            .ok_or_else(|| Error::NotFound(conflict.report_id.clone()))?;

        let (changes, reason) = match action {
            ResolutionAction::AcceptNew => (
                conflict.proposed_changes.clone(),
                format!("conflict {conflict_id} resolved: accepted new changes"),
            ),
            ResolutionAction::KeepOriginal => (
                FieldMap::new(),
                "no-op, kept original".to_string(),
            ),
            ResolutionAction::MergeChanges => (
                manual_merge(
                    &report,
                    &conflict.proposed_changes,
                    &conflict.conflicting_fields,
                    &self.merge.mergeable_fields,
                    &conflict.conflicting_actor_id,
                    now,
                ),
                format!("conflict {conflict_id} resolved: merged changes"),
            ),
            ResolutionAction::Custom => {
                let fields = custom_fields.ok_or_else(|| {
                    Error::InvalidInput("custom resolution requires explicit field values".into())
                })?;
                crate::models::schema::validate_fields(&fields)?;
                (fields, format!("conflict {conflict_id} resolved: custom values"))
            }
        };

        let written = apply_write(
            &tx,
            &report,
            &changes,
            &resolver.id,
            Platform::ConflictResolution,
            Some(reason),
            &Provenance::default(),
            now,
        )
        .map_err(|e| match e {
            Error::Busy => Error::Busy,
            other => Error::ResolutionFailed(other.to_string()),
        })?;

        Self::close(&tx, conflict_id, ConflictStatus::Resolved, resolver, Some(action), notes, now)?;

        tx.commit()?;

        self.dispatcher.notify(&Notice {
            recipient: conflict.conflicting_actor_id.clone(),
            kind: NotificationKind::ReviewResolved,
            message: format!(
                "Conflict {conflict_id} on report {} was resolved via {action}",
                conflict.report_id
            ),
            context: [
                ("report_id".to_string(), serde_json::json!(conflict.report_id)),
                ("conflict_id".to_string(), serde_json::json!(conflict_id)),
                ("action".to_string(), serde_json::json!(action.as_str())),
            ]
            .into_iter()
            .collect(),
        });

        tracing::info!(
            conflict_id,
            %action,
            resolver = %resolver.id,
            new_version = written.report.version,
            "conflict resolved"
        );
        Ok(written.report)
    }

    /// Dismiss a pending conflict without touching the record
    pub fn reject(
        &self,
        db: &mut Database,
        conflict_id: i64,
        resolver: &Actor,
        notes: Option<String>,
    ) -> Result<()> {
        let now = self.clock.now_ms();

        let tx = db
            .connection_mut()
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let conflict = Self::fetch(&tx, conflict_id)?
            .ok_or_else(|| Error::NotFound(format!("conflict {conflict_id}")))?;
        if conflict.status.is_terminal() {
            return Err(Error::ConflictClosed {
                id: conflict_id,
                status: conflict.status,
            });
        }

        Self::close(&tx, conflict_id, ConflictStatus::Rejected, resolver, None, notes, now)?;
        tx.commit()?;

        self.dispatcher.notify(&Notice {
            recipient: conflict.conflicting_actor_id,
            kind: NotificationKind::ReviewResolved,
            message: format!(
                "Conflict {conflict_id} on report {} was rejected",
                conflict.report_id
            ),
            context: [
                ("report_id".to_string(), serde_json::json!(conflict.report_id)),
                ("conflict_id".to_string(), serde_json::json!(conflict_id)),
            ]
            .into_iter()
            .collect(),
        });
        Ok(())
    }

    /// Expire pending conflicts whose deadline has passed; returns how
    /// many were expired.
    pub fn expire_due(&self, db: &mut Database) -> Result<usize> {
        let now = self.clock.now_ms();
        let expired = db.connection().execute(
            "UPDATE conflict_queue
             SET status = 'expired', resolved_at = ?
             WHERE status = 'pending_review' AND expires_at <= ?",
            params![now, now],
        )?;

        if expired > 0 {
            tracing::info!(count = expired, "expired unreviewed conflicts");
        }
        Ok(expired)
    }

    /// Terminal transition, guarded so a terminal row never moves again
    fn close(
        conn: &Connection,
        conflict_id: i64,
        status: ConflictStatus,
        resolver: &Actor,
        action: Option<ResolutionAction>,
        notes: Option<String>,
        now: i64,
    ) -> Result<()> {
        let rows = conn.execute(
            "UPDATE conflict_queue
             SET status = ?, resolved_by = ?, resolution_action = ?, resolution_notes = ?,
                 resolved_at = ?
             WHERE id = ? AND status = 'pending_review'",
            params![
                status.as_str(),
                resolver.id,
                action.map(ResolutionAction::as_str),
                notes,
                now,
                conflict_id,
            ],
        )?;

        if rows == 0 {
            // Lost a race with another resolver or the expiry sweep
            return Err(Error::ConflictClosed {
                id: conflict_id,
                status,
            });
        }
        Ok(())
    }

    fn fetch(conn: &Connection, conflict_id: i64) -> Result<Option<ConflictRecord>> {
        let record = conn
            .query_row(
                &format!("{SELECT_CONFLICT} WHERE id = ?"),
                params![conflict_id],
                Self::parse_conflict,
            )
            .optional()?;
        Ok(record)
    }

    /// Parse a conflict record from a database row
    fn parse_conflict(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConflictRecord> {
        let conflicting_fields: String = row.get(4)?;
        let proposed_changes: String = row.get(5)?;
        let original_snapshot: Option<String> = row.get(6)?;
        let severity: String = row.get(7)?;
        let status: String = row.get(8)?;
        let resolution_action: Option<String> = row.get(10)?;

        let conflicting_fields: BTreeSet<String> = serde_json::from_str(&conflicting_fields)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?;
        let proposed_changes: FieldMap = serde_json::from_str(&proposed_changes)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?;
        let original_snapshot: Option<FieldMap> = original_snapshot
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?;
        let severity: Severity = severity
            .parse()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(7, Type::Text, Box::new(e)))?;
        let status: ConflictStatus = status
            .parse()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(8, Type::Text, Box::new(e)))?;
        let resolution_action: Option<ResolutionAction> = resolution_action
            .map(|s| s.parse())
            .transpose()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(10, Type::Text, Box::new(e)))?;

        Ok(ConflictRecord {
            id: row.get(0)?,
            report_id: row.get(1)?,
            conflicting_actor_id: row.get(2)?,
            original_actor_id: row.get(3)?,
            conflicting_fields,
            proposed_changes,
            original_snapshot,
            severity,
            status,
            resolved_by: row.get(9)?,
            resolution_action,
            resolution_notes: row.get(11)?,
            created_at: row.get(12)?,
            resolved_at: row.get(13)?,
            expires_at: row.get(14)?,
        })
    }
}

const SELECT_CONFLICT: &str = "SELECT id, report_id, conflicting_actor_id, original_actor_id,
    conflicting_fields, proposed_changes, original_snapshot, severity, status,
    resolved_by, resolution_action, resolution_notes, created_at, resolved_at, expires_at
    FROM conflict_queue";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::models::ActorRole;
    use crate::notify::testing::RecordingDispatcher;
    use crate::util::FixedClock;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn seed_report(db: &Database) -> Report {
        let report = Report {
            id: ReportId::new(),
            version: 3,
            fields: [
                ("status".to_string(), json!("ACTIVE")),
                ("description".to_string(), json!("A")),
                ("assigned_team".to_string(), json!("alpha")),
            ]
            .into_iter()
            .collect(),
            created_at: 100,
            last_modified_at: 500,
            last_modified_by: "a1".into(),
            last_modified_platform: Platform::Mobile,
        };
        SqliteReportRepository::new(db.connection())
            .insert(&report)
            .unwrap();
        report
    }

    fn pending_conflict(report: &Report, fields: &[(&str, serde_json::Value)]) -> NewConflict {
        NewConflict {
            report_id: report.id.as_str(),
            conflicting_actor_id: "a2".into(),
            original_actor_id: "a1".into(),
            conflicting_fields: fields.iter().map(|(name, _)| (*name).to_string()).collect(),
            proposed_changes: fields
                .iter()
                .map(|(name, value)| ((*name).to_string(), value.clone()))
                .collect(),
            original_snapshot: Some(report.fields.clone()),
            severity: Severity::High,
            created_at: 1_000,
            expires_at: 2_000,
        }
    }

    fn queue_at(now: i64) -> ManualReviewQueue {
        ManualReviewQueue::default().with_clock(Arc::new(FixedClock(now)))
    }

    fn resolver() -> Actor {
        Actor::new("adm", ActorRole::Admin, Platform::Web)
    }

    #[test]
    fn test_enqueue_and_list_pending() {
        let mut db = Database::open_in_memory().unwrap();
        let report = seed_report(&db);
        let other = seed_report(&db);
        let queue = queue_at(1_500);

        let id = queue
            .enqueue(
                db.connection_mut(),
                &pending_conflict(&report, &[("status", json!("RESOLVED"))]),
            )
            .unwrap();
        assert!(id > 0);

        let all = queue.list_pending(&db, None).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, ConflictStatus::PendingReview);
        assert_eq!(all[0].severity, Severity::High);

        let scoped = queue.list_pending(&db, Some(&report.id)).unwrap();
        assert_eq!(scoped.len(), 1);
        let none = queue.list_pending(&db, Some(&other.id)).unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_resolve_accept_new_writes_proposal() {
        let mut db = Database::open_in_memory().unwrap();
        let report = seed_report(&db);
        let queue = queue_at(1_500);
        let id = queue
            .enqueue(
                db.connection_mut(),
                &pending_conflict(&report, &[("status", json!("RESOLVED"))]),
            )
            .unwrap();

        let updated = queue
            .resolve(
                &mut db,
                id,
                ResolutionAction::AcceptNew,
                &resolver(),
                Some("confirmed on site".into()),
                None,
            )
            .unwrap();

        assert_eq!(updated.version, 4);
        assert_eq!(updated.fields["status"], json!("RESOLVED"));
        assert_eq!(updated.last_modified_platform, Platform::ConflictResolution);

        let record = queue.get(&db, id).unwrap();
        assert_eq!(record.status, ConflictStatus::Resolved);
        assert_eq!(record.resolved_by.as_deref(), Some("adm"));
        assert_eq!(record.resolution_action, Some(ResolutionAction::AcceptNew));
        assert_eq!(record.resolution_notes.as_deref(), Some("confirmed on site"));
        assert_eq!(record.resolved_at, Some(1_500));

        let entries = AuditLog::new(db.connection())
            .for_report(&report.id.as_str())
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].actor_platform, Platform::ConflictResolution);
        assert_eq!(entries[0].version, 4);
    }

    #[test]
    fn test_resolve_keep_original_audits_noop() {
        let mut db = Database::open_in_memory().unwrap();
        let report = seed_report(&db);
        let queue = queue_at(1_500);
        let id = queue
            .enqueue(
                db.connection_mut(),
                &pending_conflict(&report, &[("status", json!("RESOLVED"))]),
            )
            .unwrap();

        let updated = queue
            .resolve(&mut db, id, ResolutionAction::KeepOriginal, &resolver(), None, None)
            .unwrap();

        // Version still bumps and the trail records the decision
        assert_eq!(updated.version, 4);
        assert_eq!(updated.fields["status"], json!("ACTIVE"));

        let entries = AuditLog::new(db.connection())
            .for_report(&report.id.as_str())
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].modified_fields.is_empty());
        assert_eq!(entries[0].reason.as_deref(), Some("no-op, kept original"));
    }

    #[test]
    fn test_resolve_merge_changes_combines_text() {
        let mut db = Database::open_in_memory().unwrap();
        let report = seed_report(&db);
        let queue = queue_at(1_500);
        let id = queue
            .enqueue(
                db.connection_mut(),
                &pending_conflict(&report, &[("description", json!("B"))]),
            )
            .unwrap();

        let updated = queue
            .resolve(&mut db, id, ResolutionAction::MergeChanges, &resolver(), None, None)
            .unwrap();

        let merged = updated.fields["description"].as_str().unwrap();
        assert!(merged.contains('A'));
        assert!(merged.contains('B'));
    }

    #[test]
    fn test_resolve_custom_requires_fields() {
        let mut db = Database::open_in_memory().unwrap();
        let report = seed_report(&db);
        let queue = queue_at(1_500);
        let id = queue
            .enqueue(
                db.connection_mut(),
                &pending_conflict(&report, &[("status", json!("RESOLVED"))]),
            )
            .unwrap();

        let missing = queue.resolve(
            &mut db,
            id,
            ResolutionAction::Custom,
            &resolver(),
            None,
            None,
        );
        assert!(matches!(missing, Err(Error::InvalidInput(_))));

        let custom: FieldMap = [("status".to_string(), json!("MONITORING"))].into_iter().collect();
        let updated = queue
            .resolve(
                &mut db,
                id,
                ResolutionAction::Custom,
                &resolver(),
                None,
                Some(custom),
            )
            .unwrap();
        assert_eq!(updated.fields["status"], json!("MONITORING"));
    }

    #[test]
    fn test_resolve_twice_fails_without_second_write() {
        let mut db = Database::open_in_memory().unwrap();
        let report = seed_report(&db);
        let queue = queue_at(1_500);
        let id = queue
            .enqueue(
                db.connection_mut(),
                &pending_conflict(&report, &[("status", json!("RESOLVED"))]),
            )
            .unwrap();

        queue
            .resolve(&mut db, id, ResolutionAction::AcceptNew, &resolver(), None, None)
            .unwrap();
        let second = queue.resolve(&mut db, id, ResolutionAction::AcceptNew, &resolver(), None, None);
        assert!(matches!(second, Err(Error::ConflictClosed { .. })));

        // The record did not move again
        let current = SqliteReportRepository::new(db.connection())
            .get(&report.id)
            .unwrap()
            .unwrap();
        assert_eq!(current.version, 4);
        let entries = AuditLog::new(db.connection())
            .for_report(&report.id.as_str())
            .unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_reject_leaves_record_untouched() {
        let mut db = Database::open_in_memory().unwrap();
        let report = seed_report(&db);
        let queue = queue_at(1_500);
        let id = queue
            .enqueue(
                db.connection_mut(),
                &pending_conflict(&report, &[("status", json!("RESOLVED"))]),
            )
            .unwrap();

        queue.reject(&mut db, id, &resolver(), Some("duplicate".into())).unwrap();

        let record = queue.get(&db, id).unwrap();
        assert_eq!(record.status, ConflictStatus::Rejected);

        let current = SqliteReportRepository::new(db.connection())
            .get(&report.id)
            .unwrap()
            .unwrap();
        assert_eq!(current.version, 3);
        assert!(AuditLog::new(db.connection())
            .for_report(&report.id.as_str())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_expire_due_sweep() {
        let mut db = Database::open_in_memory().unwrap();
        let report = seed_report(&db);
        let queue = queue_at(3_000); // past the 2_000 deadline
        let id = queue
            .enqueue(
                db.connection_mut(),
                &pending_conflict(&report, &[("status", json!("RESOLVED"))]),
            )
            .unwrap();

        let expired = queue.expire_due(&mut db).unwrap();
        assert_eq!(expired, 1);

        assert!(queue.list_pending(&db, None).unwrap().is_empty());
        let record = queue.get(&db, id).unwrap();
        assert_eq!(record.status, ConflictStatus::Expired);

        // Expired is terminal
        let late = queue.resolve(&mut db, id, ResolutionAction::AcceptNew, &resolver(), None, None);
        assert!(matches!(late, Err(Error::ConflictClosed { .. })));
    }

    #[test]
    fn test_resolution_notifies_conflicting_actor() {
        let mut db = Database::open_in_memory().unwrap();
        let report = seed_report(&db);
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let queue = ManualReviewQueue::default()
            .with_clock(Arc::new(FixedClock(1_500)))
            .with_dispatcher(dispatcher.clone());
        let id = queue
            .enqueue(
                db.connection_mut(),
                &pending_conflict(&report, &[("status", json!("RESOLVED"))]),
            )
            .unwrap();

        queue
            .resolve(&mut db, id, ResolutionAction::AcceptNew, &resolver(), None, None)
            .unwrap();

        let notices = dispatcher.taken();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].recipient, "a2");
        assert_eq!(notices[0].kind, NotificationKind::ReviewResolved);
    }
}
