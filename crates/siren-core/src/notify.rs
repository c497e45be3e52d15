//! Notification dispatch contract
//!
//! Delivery (push, e-mail, websocket fan-out) lives outside the core.
//! The store and review queue only hand finished notices to a
//! [`NotificationDispatcher`], and only after the surrounding
//! transaction has committed — never from inside the locked section.

use serde_json::Value;
use std::collections::BTreeMap;

/// What a notice is about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    /// An elevated actor's change overrode the recipient's recent edit
    OverrideNotice,
    /// A conflict was deferred and needs an administrator decision
    ReviewRequested,
    /// A pending conflict the recipient is involved in was settled
    ReviewResolved,
}

/// A notice waiting to be dispatched after commit
#[derive(Debug, Clone)]
pub struct Notice {
    /// Recipient actor id or audience name
    pub recipient: String,
    /// Notice kind
    pub kind: NotificationKind,
    /// Human-readable message
    pub message: String,
    /// Structured context (report id, conflict id, fields involved)
    pub context: BTreeMap<String, Value>,
}

/// Outbound notification delivery, implemented by the host application
pub trait NotificationDispatcher: Send + Sync {
    /// Deliver one notice; failures are the implementation's problem
    /// and must not affect the committed write.
    fn notify(&self, notice: &Notice);
}

/// Dispatcher that drops every notice; the default when the host wires
/// nothing up.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullDispatcher;

impl NotificationDispatcher for NullDispatcher {
    fn notify(&self, notice: &Notice) {
        tracing::debug!(
            recipient = %notice.recipient,
            kind = ?notice.kind,
            "dropping notice (no dispatcher configured)"
        );
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::{Notice, NotificationDispatcher};
    use std::sync::Mutex;

    /// Records every notice for assertions
    #[derive(Debug, Default)]
    pub struct RecordingDispatcher {
        notices: Mutex<Vec<Notice>>,
    }

    impl RecordingDispatcher {
        pub fn taken(&self) -> Vec<Notice> {
            self.notices.lock().unwrap().clone()
        }
    }

    impl NotificationDispatcher for RecordingDispatcher {
        fn notify(&self, notice: &Notice) {
            self.notices.lock().unwrap().push(notice.clone());
        }
    }
}
