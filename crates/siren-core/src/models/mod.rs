//! Data models for Siren

mod actor;
mod audit;
mod conflict;
mod report;

pub use actor::{Actor, ActorRole, Platform};
pub use audit::{AuditEntry, FieldChange, NewAuditEntry, Provenance};
pub use conflict::{ConflictRecord, ConflictStatus, NewConflict, ResolutionAction, Severity};
pub use report::{schema, FieldMap, Report, ReportId};
