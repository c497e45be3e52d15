//! siren-core - Core library for Siren
//!
//! Coordinates concurrent edits to shared disaster-incident reports
//! made by field agents (mobile, high-latency) and coordinators (web
//! console) without silently losing either side's work: a versioned
//! record store with optimistic concurrency, conflict detection against
//! a trailing modification window, automatic and manual resolution
//! strategies, an append-only audit trail, and a durable review queue.

pub mod audit;
pub mod conflict;
pub mod db;
pub mod error;
pub mod models;
pub mod notify;
pub mod review;
pub mod store;
pub mod util;

pub use error::{Error, Result};
pub use models::{Actor, ActorRole, Platform, Report, ReportId};
pub use store::{ReportStore, UpdateOutcome, UpdateRequest};
