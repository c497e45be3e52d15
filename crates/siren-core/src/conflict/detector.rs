//! Conflict detection against the trailing modification window

use rusqlite::Connection;
use std::collections::BTreeSet;
use std::time::Duration;

use crate::audit::AuditLog;
use crate::error::Result;
use crate::models::{schema, Actor, AuditEntry, FieldMap, Report, Severity};

/// Detection thresholds, passed in at construction so tests can
/// exercise the boundaries directly.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Trailing span during which a prior modification by a different
    /// actor counts against a new update
    pub conflict_window: Duration,
    /// Fields whose concurrent modification always escalates
    pub critical_fields: BTreeSet<String>,
    /// Overlaps larger than this (and not critical) classify as medium
    pub medium_overlap_threshold: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            conflict_window: Duration::from_secs(300),
            critical_fields: schema::CRITICAL_FIELDS
                .iter()
                .map(|f| (*f).to_string())
                .collect(),
            medium_overlap_threshold: 3,
        }
    }
}

/// A detected overlap between a proposed update and a recent write
#[derive(Debug, Clone)]
pub struct Detection {
    /// Field names both writes touch
    pub overlap: BTreeSet<String>,
    /// Classified severity of the overlap
    pub severity: Severity,
    /// The recent audit entry the proposal collides with
    pub prior: AuditEntry,
}

/// Inspects the audit trail for near-simultaneous writes to the same
/// report by a different actor.
///
/// Field-set intersection, not whole-record diffing: one actor updating
/// photos while another updates status is not a conflict. The writer's
/// own recent entries are excluded, so a client retrying its own update
/// never contends with itself.
#[derive(Debug, Clone, Default)]
pub struct ConflictDetector {
    config: DetectorConfig,
}

impl ConflictDetector {
    /// Create a detector with the given thresholds
    pub const fn new(config: DetectorConfig) -> Self {
        Self { config }
    }

    /// Check a proposed update against the trailing window.
    ///
    /// Returns `None` when there is nothing to resolve: no recent
    /// foreign write, or no overlapping fields.
    pub fn detect(
        &self,
        conn: &Connection,
        report: &Report,
        proposed: &FieldMap,
        actor: &Actor,
        now: i64,
    ) -> Result<Option<Detection>> {
        #[allow(clippy::cast_possible_wrap)]
        let window_ms = self.config.conflict_window.as_millis() as i64;
        let since = now.saturating_sub(window_ms);

        let log = AuditLog::new(conn);
        let Some(prior) = log.recent_for(&report.id.as_str(), since, &actor.id)? else {
            return Ok(None);
        };

        let overlap: BTreeSet<String> = prior
            .modified_fields
            .iter()
            .filter(|field| proposed.contains_key(*field))
            .cloned()
            .collect();

        if overlap.is_empty() {
            return Ok(None);
        }

        let severity = self.classify(&overlap);
        tracing::debug!(
            report_id = %report.id,
            actor_id = %actor.id,
            prior_actor = %prior.actor_id,
            ?overlap,
            %severity,
            "conflicting update detected"
        );

        Ok(Some(Detection {
            overlap,
            severity,
            prior,
        }))
    }

    /// Severity of an overlapping field set
    fn classify(&self, overlap: &BTreeSet<String>) -> Severity {
        if overlap
            .iter()
            .any(|field| self.config.critical_fields.contains(field))
        {
            Severity::High
        } else if overlap.len() > self.config.medium_overlap_threshold {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{ActorRole, FieldChange, NewAuditEntry, Platform, Provenance, ReportId};
    use rusqlite::params;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn setup(report: &Report) -> Database {
        let db = Database::open_in_memory().unwrap();
        db.connection()
            .execute(
                "INSERT INTO reports (id, version, fields, created_at, last_modified_at,
                 last_modified_by, last_modified_platform)
                 VALUES (?, 1, '{}', 0, 0, 'seed', 'mobile')",
                params![report.id.as_str()],
            )
            .unwrap();
        db
    }

    fn report() -> Report {
        Report {
            id: ReportId::new(),
            version: 1,
            fields: FieldMap::new(),
            created_at: 0,
            last_modified_at: 0,
            last_modified_by: "seed".into(),
            last_modified_platform: Platform::Mobile,
        }
    }

    fn write_entry(db: &Database, report: &Report, actor_id: &str, timestamp: i64, fields: &[&str]) {
        let entry = NewAuditEntry {
            report_id: report.id.as_str(),
            actor_id: actor_id.into(),
            actor_platform: Platform::Mobile,
            timestamp,
            version: 2,
            modified_fields: fields.iter().map(|f| (*f).to_string()).collect(),
            field_changes: fields
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
                .collect::<BTreeMap<_, _>>(),
            reason: None,
            provenance: Provenance::default(),
        };
        AuditLog::new(db.connection()).append(&entry).unwrap();
    }

    fn proposed(fields: &[&str]) -> FieldMap {
        fields
            .iter()
            .map(|f| ((*f).to_string(), json!("y")))
            .collect()
    }

    fn actor(id: &str) -> Actor {
        Actor::new(id, ActorRole::FieldAgent, Platform::Mobile)
    }

    #[test]
    fn test_empty_history_no_conflict() {
        let report = report();
        let db = setup(&report);
        let detector = ConflictDetector::default();

        let detection = detector
            .detect(db.connection(), &report, &proposed(&["status"]), &actor("a1"), 1_000)
            .unwrap();
        assert!(detection.is_none());
    }

    #[test]
    fn test_own_recent_write_no_conflict() {
        let report = report();
        let db = setup(&report);
        write_entry(&db, &report, "a1", 500, &["status"]);
        let detector = ConflictDetector::default();

        let detection = detector
            .detect(db.connection(), &report, &proposed(&["status"]), &actor("a1"), 1_000)
            .unwrap();
        assert!(detection.is_none());
    }

    #[test]
    fn test_disjoint_fields_no_conflict() {
        let report = report();
        let db = setup(&report);
        write_entry(&db, &report, "a1", 500, &["status"]);
        let detector = ConflictDetector::default();

        let detection = detector
            .detect(
                db.connection(),
                &report,
                &proposed(&["description"]),
                &actor("a2"),
                1_000,
            )
            .unwrap();
        assert!(detection.is_none());
    }

    #[test]
    fn test_entry_outside_window_no_conflict() {
        let report = report();
        let db = setup(&report);
        write_entry(&db, &report, "a1", 1_000, &["status"]);
        let detector = ConflictDetector::default();

        // Window is 5 minutes; the prior entry is 6 minutes old
        let now = 1_000 + 6 * 60 * 1_000;
        let detection = detector
            .detect(db.connection(), &report, &proposed(&["status"]), &actor("a2"), now)
            .unwrap();
        assert!(detection.is_none());
    }

    #[test]
    fn test_critical_overlap_is_high() {
        let report = report();
        let db = setup(&report);
        write_entry(&db, &report, "a1", 500, &["status"]);
        let detector = ConflictDetector::default();

        let detection = detector
            .detect(db.connection(), &report, &proposed(&["status"]), &actor("a2"), 1_000)
            .unwrap()
            .unwrap();
        assert_eq!(detection.severity, Severity::High);
        assert_eq!(detection.overlap.len(), 1);
        assert!(detection.overlap.contains("status"));
        assert_eq!(detection.prior.actor_id, "a1");
    }

    #[test]
    fn test_wide_noncritical_overlap_is_medium() {
        let report = report();
        let db = setup(&report);
        let fields = [
            "description",
            "situation_notes",
            "weather_conditions",
            "access_conditions",
        ];
        write_entry(&db, &report, "a1", 500, &fields);
        let detector = ConflictDetector::default();

        let detection = detector
            .detect(db.connection(), &report, &proposed(&fields), &actor("a2"), 1_000)
            .unwrap()
            .unwrap();
        assert_eq!(detection.severity, Severity::Medium);
    }

    #[test]
    fn test_small_noncritical_overlap_is_low() {
        let report = report();
        let db = setup(&report);
        write_entry(&db, &report, "a1", 500, &["description"]);
        let detector = ConflictDetector::default();

        let detection = detector
            .detect(
                db.connection(),
                &report,
                &proposed(&["description"]),
                &actor("a2"),
                1_000,
            )
            .unwrap()
            .unwrap();
        assert_eq!(detection.severity, Severity::Low);
    }

    #[test]
    fn test_threshold_boundary_is_config_driven() {
        let report = report();
        let db = setup(&report);
        let fields = ["description", "situation_notes", "weather_conditions"];
        write_entry(&db, &report, "a1", 500, &fields);

        // Overlap of exactly 3: low at the default threshold of 3,
        // medium when the threshold drops to 2.
        let at_default = ConflictDetector::default()
            .detect(db.connection(), &report, &proposed(&fields), &actor("a2"), 1_000)
            .unwrap()
            .unwrap();
        assert_eq!(at_default.severity, Severity::Low);

        let tightened = ConflictDetector::new(DetectorConfig {
            medium_overlap_threshold: 2,
            ..DetectorConfig::default()
        })
        .detect(db.connection(), &report, &proposed(&fields), &actor("a2"), 1_000)
        .unwrap()
        .unwrap();
        assert_eq!(tightened.severity, Severity::Medium);
    }
}
