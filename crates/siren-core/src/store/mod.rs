//! Versioned record store
//!
//! The single entry point for report mutation. Every update runs as one
//! immediate (write-locked) transaction: version check, conflict
//! detection, strategy execution, persistence, and the audit entry all
//! commit or roll back together. Notifications go out only after the
//! commit.

mod writer;

pub(crate) use writer::apply_write;

use rusqlite::TransactionBehavior;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::conflict::{ConflictDetector, Decision, ResolutionEngine, ResolutionStrategy};
use crate::db::{Database, ReportRepository, SqliteReportRepository};
use crate::error::{Error, Result};
use crate::models::{
    schema, Actor, FieldMap, NewAuditEntry, NewConflict, Provenance, Report, ReportId, Severity,
};
use crate::notify::{Notice, NotificationDispatcher, NotificationKind, NullDispatcher};
use crate::review::ManualReviewQueue;
use crate::util::{Clock, SystemClock};

/// Audience name review-request notices are addressed to
const DEFAULT_REVIEW_AUDIENCE: &str = "coordinators";

/// A proposed update to one report
#[derive(Debug, Clone)]
pub struct UpdateRequest {
    /// Target report
    pub report_id: ReportId,
    /// Proposed field values (validated upstream, re-checked against
    /// the schema here)
    pub fields: FieldMap,
    /// The calling principal
    pub actor: Actor,
    /// Strict optimistic-locking check: when set and stale, the call
    /// fails fast with `VersionConflict` before any processing
    pub expected_version: Option<i64>,
    /// Optional free-text reason recorded on the audit entry
    pub reason: Option<String>,
    /// Request provenance for the audit entry
    pub provenance: Provenance,
}

/// Structured result of an update call.
///
/// `Rejected` and `Deferred` are successful outcomes, not errors: the
/// caller's input was fine, the system just decided against (or
/// postponed) the write.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UpdateOutcome {
    /// The write landed
    Applied {
        /// Version the write produced
        new_version: i64,
        /// Fields whose values actually changed
        applied_fields: BTreeSet<String>,
        /// Strategy involved, if the write resolved a conflict
        resolution: Option<ResolutionStrategy>,
    },
    /// The write was refused; refetch and resubmit
    Rejected {
        /// Fields a privileged actor recently changed
        conflicting_fields: BTreeSet<String>,
        /// Whose change blocked the update
        other_actor_id: String,
        /// When that change landed (Unix ms)
        other_modified_at: i64,
    },
    /// The write is pending human review
    Deferred {
        /// Conflict record to poll for the decision
        conflict_id: i64,
        /// Fields under review
        conflicting_fields: BTreeSet<String>,
        /// Classified severity
        severity: Severity,
    },
}

/// Orchestrates the locked read-modify-write cycle over reports
pub struct ReportStore {
    detector: ConflictDetector,
    engine: ResolutionEngine,
    queue: ManualReviewQueue,
    dispatcher: Arc<dyn NotificationDispatcher>,
    clock: Arc<dyn Clock>,
    review_audience: String,
}

impl Default for ReportStore {
    fn default() -> Self {
        Self::new(
            ConflictDetector::default(),
            ResolutionEngine::default(),
            ManualReviewQueue::default(),
        )
    }
}

impl ReportStore {
    /// Create a store from its components
    pub fn new(
        detector: ConflictDetector,
        engine: ResolutionEngine,
        queue: ManualReviewQueue,
    ) -> Self {
        Self {
            detector,
            engine,
            queue,
            dispatcher: Arc::new(NullDispatcher),
            clock: Arc::new(SystemClock),
            review_audience: DEFAULT_REVIEW_AUDIENCE.to_string(),
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

    /// Create a report from an initial submission; version starts at 1
    pub fn create(
        &self,
        db: &mut Database,
        fields: FieldMap,
        actor: &Actor,
        provenance: Provenance,
    ) -> Result<Report> {
        schema::validate_fields(&fields)?;
        let now = self.clock.now_ms();

        let tx = db
            .connection_mut()
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let report = Report {
            id: ReportId::new(),
            version: 1,
            fields: fields.clone(),
            created_at: now,
            last_modified_at: now,
            last_modified_by: actor.id.clone(),
            last_modified_platform: actor.platform,
        };
        SqliteReportRepository::new(&tx).insert(&report)?;

        let entry = NewAuditEntry {
            report_id: report.id.as_str(),
            actor_id: actor.id.clone(),
            actor_platform: actor.platform,
            timestamp: now,
            version: 1,
            modified_fields: fields.keys().cloned().collect(),
            field_changes: fields
                .iter()
                .map(|(name, value)| {
                    (
                        name.clone(),
                        crate::models::FieldChange {
                            old: None,
                            new: value.clone(),
                        },
                    )
                })
                .collect(),
            reason: None,
            provenance,
        };
        crate::audit::AuditLog::new(&tx).append(&entry)?;

        tx.commit()?;
        tracing::info!(report_id = %report.id, actor_id = %actor.id, "report created");
        Ok(report)
    }

    /// Fetch a report
    pub fn get(&self, db: &Database, id: &ReportId) -> Result<Report> {
        SqliteReportRepository::new(db.connection())
            .get(id)?
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Submit a proposed update; the whole cycle runs in one immediate
    /// transaction and either commits entirely or leaves no trace.
    pub fn update(&self, db: &mut Database, request: &UpdateRequest) -> Result<UpdateOutcome> {
        schema::validate_fields(&request.fields)?;
        let now = self.clock.now_ms();

        let tx = db
            .connection_mut()
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        // Any error below drops the transaction, rolling everything back
        let (outcome, notices) = self.update_in_tx(&tx, request, now)?;

        tx.commit()?;

        for notice in &notices {
            self.dispatcher.notify(notice);
        }
        Ok(outcome)
    }

    fn update_in_tx(
        &self,
        tx: &rusqlite::Transaction<'_>,
        request: &UpdateRequest,
        now: i64,
    ) -> Result<(UpdateOutcome, Vec<Notice>)> {
        let repo = SqliteReportRepository::new(tx);
        let report = repo
            .get(&request.report_id)?
            .ok_or_else(|| Error::NotFound(request.report_id.to_string()))?;

        // Strict optimistic-locking path for clients that fetched a
        // specific version; fails fast, nothing else runs.
        if let Some(expected) = request.expected_version {
            if expected != report.version {
                return Err(Error::VersionConflict {
                    expected,
                    actual: report.version,
                });
            }
        }

        let detection =
            self.detector
                .detect(tx, &report, &request.fields, &request.actor, now)?;

        let Some(detection) = detection else {
            let written = apply_write(
                tx,
                &report,
                &request.fields,
                &request.actor.id,
                request.actor.platform,
                request.reason.clone(),
                &request.provenance,
                now,
            )?;
            return Ok((
                UpdateOutcome::Applied {
                    new_version: written.report.version,
                    applied_fields: written.modified_fields,
                    resolution: None,
                },
                Vec::new(),
            ));
        };

        let decision = self
            .engine
            .resolve(&report, &request.fields, &request.actor, &detection, now);

        match decision {
            Decision::Apply {
                fields,
                strategy,
                notices,
            } => {
                let written = apply_write(
                    tx,
                    &report,
                    &fields,
                    &request.actor.id,
                    request.actor.platform,
                    request
                        .reason
                        .clone()
                        .or_else(|| Some(format!("conflict resolved via {strategy}"))),
                    &request.provenance,
                    now,
                )
                .map_err(|e| match e {
                    Error::Busy => Error::Busy,
                    other => Error::ResolutionFailed(other.to_string()),
                })?;
                Ok((
                    UpdateOutcome::Applied {
                        new_version: written.report.version,
                        applied_fields: written.modified_fields,
                        resolution: Some(strategy),
                    },
                    notices,
                ))
            }
            Decision::Reject {
                conflicting_fields,
                other_actor_id,
                other_modified_at,
            } => Ok((
                UpdateOutcome::Rejected {
                    conflicting_fields,
                    other_actor_id,
                    other_modified_at,
                },
                Vec::new(),
            )),
            Decision::Defer {
                conflicting_fields,
                severity,
                snapshot,
            } => {
                let conflict = NewConflict {
                    report_id: report.id.as_str(),
                    conflicting_actor_id: request.actor.id.clone(),
                    original_actor_id: detection.prior.actor_id.clone(),
                    conflicting_fields: conflicting_fields.clone(),
                    proposed_changes: request.fields.clone(),
                    original_snapshot: Some(snapshot),
                    severity,
                    created_at: now,
                    expires_at: self.queue.expiry_deadline(now),
                };
                let conflict_id = self.queue.enqueue(tx, &conflict)?;

                let notice = Notice {
                    recipient: self.review_audience.clone(),
                    kind: NotificationKind::ReviewRequested,
                    message: format!(
                        "Conflict {conflict_id} on report {} needs review ({severity} severity)",
                        report.id
                    ),
                    context: [
                        ("report_id".to_string(), serde_json::json!(report.id.as_str())),
                        ("conflict_id".to_string(), serde_json::json!(conflict_id)),
                        ("fields".to_string(), serde_json::json!(conflicting_fields)),
                    ]
                    .into_iter()
                    .collect(),
                };

                Ok((
                    UpdateOutcome::Deferred {
                        conflict_id,
                        conflicting_fields,
                        severity,
                    },
                    vec![notice],
                ))
            }
        }
    }
}
