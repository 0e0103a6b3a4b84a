//! Time source abstraction
//!
//! Workers schedule against a [`Clock`] rather than calling `Utc::now()`
//! directly so tests can run the whole engine under tokio's paused time.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Port for reading the current time
pub trait Clock: Send + Sync {
    /// Get the current time according to this clock
    fn now(&self) -> DateTime<Utc>;

    /// Get the clock's name/identifier for debugging
    fn name(&self) -> &str {
        "Clock"
    }
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn name(&self) -> &str {
        "system"
    }
}

/// Clock that follows tokio's monotonic time from a fixed anchor
///
/// Under `tokio::time::pause()` it advances exactly as far as the runtime's
/// virtual time does, which keeps schedules computed from `now()` consistent
/// with `tokio::time::sleep`.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    anchor: DateTime<Utc>,
    started: tokio::time::Instant,
}

impl MonotonicClock {
    pub fn new(anchor: DateTime<Utc>) -> Self {
        Self {
            anchor,
            started: tokio::time::Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.started.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.anchor + elapsed
    }

    fn name(&self) -> &str {
        "monotonic"
    }
}

/// Convert the gap between now and `until` into a sleep duration
pub fn duration_until(now: DateTime<Utc>, until: DateTime<Utc>) -> Duration {
    (until - now).to_std().unwrap_or(Duration::ZERO)
}

/// Convert a std duration into a chrono span
pub fn span(duration: Duration) -> chrono::Duration {
    chrono::Duration::seconds(duration.as_secs() as i64)
        + chrono::Duration::nanoseconds(duration.subsec_nanos() as i64)
}
