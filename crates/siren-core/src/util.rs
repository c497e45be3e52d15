//! Shared utilities: time source

/// Source of the current wall-clock time in Unix milliseconds.
///
/// All timestamps in the system (audit entries, conflict expiry, the
/// detection window) come through one clock so window and expiry logic
/// stay consistent. Tests pin time with [`FixedClock`].
pub trait Clock: Send + Sync {
    /// Current time in Unix milliseconds
    fn now_ms(&self) -> i64;
}

/// System wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Clock pinned to a fixed instant, for tests
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub i64);

impl Clock for FixedClock {
    fn now_ms(&self) -> i64 {
        self.0
    }
}
