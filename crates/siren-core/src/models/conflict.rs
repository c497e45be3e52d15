//! Conflict record model and its state machine

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::Error;
use crate::models::FieldMap;

/// How serious a detected overlap is
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Overlap on mergeable or minor fields only
    Low,
    /// Broad overlap without critical fields
    Medium,
    /// Overlap touches a critical field
    High,
}

impl Severity {
    /// Stable string form used in the database
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(Error::InvalidInput(format!("unknown severity: {other}"))),
        }
    }
}

/// Lifecycle state of a conflict record.
///
/// `PendingReview` is the only live state; the other three are
/// terminal and never transition again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    /// Awaiting an administrator decision
    PendingReview,
    /// Settled by an administrator action
    Resolved,
    /// Dismissed by an administrator without a record write
    Rejected,
    /// Passed `expires_at` without a decision
    Expired,
}

impl ConflictStatus {
    /// Stable string form used in the database
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PendingReview => "pending_review",
            Self::Resolved => "resolved",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        }
    }

    /// Whether this state can never transition again
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::PendingReview)
    }
}

impl fmt::Display for ConflictStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_review" => Ok(Self::PendingReview),
            "resolved" => Ok(Self::Resolved),
            "rejected" => Ok(Self::Rejected),
            "expired" => Ok(Self::Expired),
            other => Err(Error::InvalidInput(format!(
                "unknown conflict status: {other}"
            ))),
        }
    }
}

/// Administrator action that settles a pending conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionAction {
    /// Apply the conflicting actor's proposed changes verbatim
    AcceptNew,
    /// Keep the record as it stands; audit the no-op
    KeepOriginal,
    /// Re-run the field merge over the conflicting fields
    MergeChanges,
    /// Apply resolver-supplied field values
    Custom,
}

impl ResolutionAction {
    /// Stable string form used in the database
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AcceptNew => "accept_new",
            Self::KeepOriginal => "keep_original",
            Self::MergeChanges => "merge_changes",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for ResolutionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolutionAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accept_new" => Ok(Self::AcceptNew),
            "keep_original" => Ok(Self::KeepOriginal),
            "merge_changes" => Ok(Self::MergeChanges),
            "custom" => Ok(Self::Custom),
            other => Err(Error::InvalidInput(format!(
                "unknown resolution action: {other}"
            ))),
        }
    }
}

/// A durable record of a concurrent-edit conflict awaiting (or having
/// received) a decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// Row id
    pub id: i64,
    /// Report the conflict is about
    pub report_id: String,
    /// Actor whose proposed update was deferred
    pub conflicting_actor_id: String,
    /// Actor whose recent change overlaps
    pub original_actor_id: String,
    /// Overlapping field names that could not be settled automatically
    pub conflicting_fields: BTreeSet<String>,
    /// The full proposed update, held for later application
    pub proposed_changes: FieldMap,
    /// Record field values at detection time, if captured
    pub original_snapshot: Option<FieldMap>,
    /// Classified severity at detection time
    pub severity: Severity,
    /// Lifecycle state
    pub status: ConflictStatus,
    /// Administrator who settled the conflict
    pub resolved_by: Option<String>,
    /// Action taken on resolution
    pub resolution_action: Option<ResolutionAction>,
    /// Resolver notes
    pub resolution_notes: Option<String>,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    /// Resolution timestamp (Unix ms)
    pub resolved_at: Option<i64>,
    /// Deadline after which the conflict expires unreviewed (Unix ms)
    pub expires_at: i64,
}

/// A conflict about to be enqueued, before it has a row id
#[derive(Debug, Clone)]
pub struct NewConflict {
    /// Report the conflict is about
    pub report_id: String,
    /// Actor whose proposed update was deferred
    pub conflicting_actor_id: String,
    /// Actor whose recent change overlaps
    pub original_actor_id: String,
    /// Overlapping field names that could not be settled automatically
    pub conflicting_fields: BTreeSet<String>,
    /// The full proposed update
    pub proposed_changes: FieldMap,
    /// Record field values at detection time
    pub original_snapshot: Option<FieldMap>,
    /// Classified severity
    pub severity: Severity,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    /// Expiry deadline (Unix ms)
    pub expires_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_terminal() {
        assert!(!ConflictStatus::PendingReview.is_terminal());
        assert!(ConflictStatus::Resolved.is_terminal());
        assert!(ConflictStatus::Rejected.is_terminal());
        assert!(ConflictStatus::Expired.is_terminal());
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            ConflictStatus::PendingReview,
            ConflictStatus::Resolved,
            ConflictStatus::Rejected,
            ConflictStatus::Expired,
        ] {
            let parsed: ConflictStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_action_round_trip() {
        for action in [
            ResolutionAction::AcceptNew,
            ResolutionAction::KeepOriginal,
            ResolutionAction::MergeChanges,
            ResolutionAction::Custom,
        ] {
            let parsed: ResolutionAction = action.as_str().parse().unwrap();
            assert_eq!(parsed, action);
        }
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
    }
}
