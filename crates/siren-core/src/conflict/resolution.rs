//! Resolution strategy engine
//!
//! Pure dispatch: given a detected conflict, pick one strategy and
//! compute what should happen. The engine never touches the datastore;
//! the record store executes the returned [`Decision`] inside its own
//! transaction.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::conflict::Detection;
use crate::models::{schema, Actor, FieldMap, Report, Severity};
use crate::notify::{Notice, NotificationKind};

/// Deterministic policy used to settle a detected conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Elevated role wins; the other side is notified or told to refetch
    AdminWins,
    /// The incoming write wins outright (it is by definition the
    /// latest, since the row lock linearizes writers)
    LatestWins,
    /// Combine overlapping mergeable fields programmatically
    FieldMerge,
    /// Defer to a human decision
    ManualReview,
}

impl ResolutionStrategy {
    /// Stable string form used in audit reasons and logs
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AdminWins => "admin_wins",
            Self::LatestWins => "latest_wins",
            Self::FieldMerge => "field_merge",
            Self::ManualReview => "manual_review",
        }
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine configuration.
///
/// The mergeable set and the low-severity policy are explicit inputs so
/// deployments (and tests) can tune them without recompiling.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Fields whose concurrent values may be combined programmatically
    pub mergeable_fields: BTreeSet<String>,
    /// Strategy applied to low-severity conflicts; `FieldMerge` by
    /// default, `LatestWins` for deployments that prefer overwrite
    pub low_severity_strategy: ResolutionStrategy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mergeable_fields: schema::MERGEABLE_FIELDS
                .iter()
                .map(|f| (*f).to_string())
                .collect(),
            low_severity_strategy: ResolutionStrategy::FieldMerge,
        }
    }
}

/// What the record store should do with a conflicting update
#[derive(Debug, Clone)]
pub enum Decision {
    /// Write these fields, bump the version, append an audit entry
    Apply {
        /// Final field values to persist
        fields: FieldMap,
        /// Strategy that produced them
        strategy: ResolutionStrategy,
        /// Notices to dispatch after commit
        notices: Vec<Notice>,
    },
    /// Refuse the write; the caller must refetch and resubmit
    Reject {
        /// Fields the privileged actor changed
        conflicting_fields: BTreeSet<String>,
        /// Whose change blocked the update
        other_actor_id: String,
        /// When that change landed (Unix ms)
        other_modified_at: i64,
    },
    /// Create a conflict record and defer the write to manual review
    Defer {
        /// Fields that could not be settled automatically
        conflicting_fields: BTreeSet<String>,
        /// Severity carried onto the conflict record
        severity: Severity,
        /// Record field values at detection time
        snapshot: FieldMap,
    },
}

/// Selects and executes one resolution strategy per conflict
#[derive(Debug, Clone, Default)]
pub struct ResolutionEngine {
    config: EngineConfig,
}

impl ResolutionEngine {
    /// Create an engine with the given configuration
    pub const fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Strategy selection, in priority order
    #[must_use]
    pub fn select(&self, detection: &Detection) -> ResolutionStrategy {
        match detection.severity {
            Severity::High => ResolutionStrategy::ManualReview,
            Severity::Medium => ResolutionStrategy::AdminWins,
            Severity::Low => self.config.low_severity_strategy,
        }
    }

    /// Resolve a detected conflict into a [`Decision`]
    #[must_use]
    pub fn resolve(
        &self,
        report: &Report,
        proposed: &FieldMap,
        actor: &Actor,
        detection: &Detection,
        now: i64,
    ) -> Decision {
        let strategy = self.select(detection);
        tracing::debug!(
            report_id = %report.id,
            actor_id = %actor.id,
            severity = %detection.severity,
            %strategy,
            "resolving conflict"
        );

        match strategy {
            ResolutionStrategy::AdminWins => Self::admin_wins(report, proposed, actor, detection),
            ResolutionStrategy::LatestWins => Self::latest_wins(report, proposed, detection),
            ResolutionStrategy::FieldMerge => {
                self.field_merge(report, proposed, actor, detection, now)
            }
            ResolutionStrategy::ManualReview => Self::manual_review(report, detection),
        }
    }

    /// Admin-wins: the elevated role's change lands; a non-elevated
    /// caller is told whose change blocked them and must refetch.
    fn admin_wins(
        report: &Report,
        proposed: &FieldMap,
        actor: &Actor,
        detection: &Detection,
    ) -> Decision {
        if actor.is_elevated() {
            let notice = Notice {
                recipient: detection.prior.actor_id.clone(),
                kind: NotificationKind::OverrideNotice,
                message: format!(
                    "Your recent changes to report {} were overridden by {}",
                    report.id, actor.id
                ),
                context: override_context(report, &detection.overlap),
            };
            Decision::Apply {
                fields: proposed.clone(),
                strategy: ResolutionStrategy::AdminWins,
                notices: vec![notice],
            }
        } else {
            Decision::Reject {
                conflicting_fields: detection.overlap.clone(),
                other_actor_id: detection.prior.actor_id.clone(),
                other_modified_at: detection.prior.timestamp,
            }
        }
    }

    /// Latest-wins: apply the incoming write verbatim, telling the
    /// prior actor their change was shadowed.
    fn latest_wins(report: &Report, proposed: &FieldMap, detection: &Detection) -> Decision {
        let notice = Notice {
            recipient: detection.prior.actor_id.clone(),
            kind: NotificationKind::OverrideNotice,
            message: format!(
                "A newer update superseded your recent changes to report {}",
                report.id
            ),
            context: override_context(report, &detection.overlap),
        };
        Decision::Apply {
            fields: proposed.clone(),
            strategy: ResolutionStrategy::LatestWins,
            notices: vec![notice],
        }
    }

    /// Field-merge: combine mergeable overlap fields, pass
    /// non-overlapping fields through, defer anything unmergeable.
    fn field_merge(
        &self,
        report: &Report,
        proposed: &FieldMap,
        actor: &Actor,
        detection: &Detection,
        now: i64,
    ) -> Decision {
        let mut merged = FieldMap::new();
        let mut unresolved = BTreeSet::new();

        for (name, value) in proposed {
            if !detection.overlap.contains(name) {
                merged.insert(name.clone(), value.clone());
            } else if self.config.mergeable_fields.contains(name) {
                merged.insert(
                    name.clone(),
                    merge_values(report.field(name), value, &actor.id, now),
                );
            } else {
                unresolved.insert(name.clone());
            }
        }

        if unresolved.is_empty() {
            Decision::Apply {
                fields: merged,
                strategy: ResolutionStrategy::FieldMerge,
                notices: Vec::new(),
            }
        } else {
            Decision::Defer {
                conflicting_fields: unresolved,
                severity: detection.severity,
                snapshot: report.fields.clone(),
            }
        }
    }

    /// Manual review: everything in the overlap goes to a human
    fn manual_review(report: &Report, detection: &Detection) -> Decision {
        Decision::Defer {
            conflicting_fields: detection.overlap.clone(),
            severity: detection.severity,
            snapshot: report.fields.clone(),
        }
    }
}

/// Combine one field's current and proposed values.
///
/// Two text values concatenate with a timestamped separator naming the
/// second writer; anything else (numbers, enums, missing current value)
/// takes the proposed value.
pub(crate) fn merge_values(
    current: Option<&Value>,
    proposed: &Value,
    actor_id: &str,
    now: i64,
) -> Value {
    match (current, proposed) {
        (Some(Value::String(existing)), Value::String(incoming)) => {
            let stamp = chrono::DateTime::from_timestamp_millis(now)
                .map_or_else(|| now.to_string(), |dt| dt.format("%Y-%m-%d %H:%M UTC").to_string());
            json!(format!(
                "{existing}\n--- [{stamp}] {actor_id} ---\n{incoming}"
            ))
        }
        _ => proposed.clone(),
    }
}

/// Merge used by the review queue's `merge_changes` action.
///
/// Same combination rules as the automatic field-merge, except that
/// unmergeable conflicting fields take the proposed value outright:
/// the resolver chose to merge and is the authority, so nothing
/// re-defers.
pub(crate) fn manual_merge(
    report: &Report,
    proposed: &FieldMap,
    conflicting: &BTreeSet<String>,
    mergeable: &BTreeSet<String>,
    actor_id: &str,
    now: i64,
) -> FieldMap {
    proposed
        .iter()
        .map(|(name, value)| {
            let merged = if conflicting.contains(name) && mergeable.contains(name) {
                merge_values(report.field(name), value, actor_id, now)
            } else {
                value.clone()
            };
            (name.clone(), merged)
        })
        .collect()
}

fn override_context(report: &Report, overlap: &BTreeSet<String>) -> BTreeMap<String, Value> {
    let mut context = BTreeMap::new();
    context.insert("report_id".to_string(), json!(report.id.as_str()));
    context.insert("fields".to_string(), json!(overlap));
    context
}
