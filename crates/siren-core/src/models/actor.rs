//! Actors: who is editing a report, and from where

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Role of the principal making an edit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    /// Field agent submitting from the ground
    FieldAgent,
    /// Coordinator working the console
    Coordinator,
    /// System administrator
    Admin,
}

/// Platform an edit arrived from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Platform {
    /// Mobile client (disconnected/high-latency)
    Mobile,
    /// Web console
    Web,
    /// Writes produced by conflict resolution itself
    ConflictResolution,
}

impl Platform {
    /// Stable string form used in the database
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Mobile => "mobile",
            Self::Web => "web",
            Self::ConflictResolution => "conflict-resolution",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mobile" => Ok(Self::Mobile),
            "web" => Ok(Self::Web),
            "conflict-resolution" => Ok(Self::ConflictResolution),
            other => Err(Error::InvalidInput(format!("unknown platform: {other}"))),
        }
    }
}

/// The resolved calling principal.
///
/// Resolution from session/token to `Actor` happens upstream; the core
/// only consumes the result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    /// Stable principal id
    pub id: String,
    /// Authorization role
    pub role: ActorRole,
    /// Originating platform
    pub platform: Platform,
}

impl Actor {
    /// Create an actor
    pub fn new(id: impl Into<String>, role: ActorRole, platform: Platform) -> Self {
        Self {
            id: id.into(),
            role,
            platform,
        }
    }

    /// Whether this actor may override conflicting edits.
    ///
    /// Authority comes from the role alone. The platform a request
    /// arrived on says nothing about authorization, so `Web` does not
    /// elevate.
    #[must_use]
    pub const fn is_elevated(&self) -> bool {
        matches!(self.role, ActorRole::Coordinator | ActorRole::Admin)
    }
}
