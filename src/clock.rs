//! Wall-clock access as an explicit dependency.
//!
//! Every component that makes a timing decision is handed a [`Clock`] rather
//! than reading ambient time. Scheduling math always happens on local time in
//! the configured timezone; monotonic timers are reserved for retry backoff.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;

pub trait Clock: Send + Sync {
    /// Current instant in the configured local timezone.
    fn now(&self) -> DateTime<Tz>;

    fn timezone(&self) -> Tz;

    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

pub type SharedClock = Arc<dyn Clock>;

/// Production clock: OS time projected into the configured zone.
pub struct SystemClock {
    tz: Tz,
}

impl SystemClock {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Tz> {
        Utc::now().with_timezone(&self.tz)
    }

    fn timezone(&self) -> Tz {
        self.tz
    }
}

/// Test clock that follows the tokio runtime's (possibly paused) time.
///
/// `now()` is `base + elapsed-runtime-time`, so with `start_paused` tests the
/// wall clock advances deterministically with every `tokio::time::sleep`.
#[cfg(test)]
pub struct TestClock {
    base: DateTime<Utc>,
    tz: Tz,
    started: tokio::time::Instant,
}

#[cfg(test)]
impl TestClock {
    /// Must be constructed inside a tokio runtime.
    pub fn starting_at(base: DateTime<Utc>, tz: Tz) -> Self {
        Self {
            base,
            tz,
            started: tokio::time::Instant::now(),
        }
    }
}

#[cfg(test)]
impl Clock for TestClock {
    fn now(&self) -> DateTime<Tz> {
        let elapsed = self.started.elapsed();
        (self.base + chrono::Duration::milliseconds(elapsed.as_millis() as i64))
            .with_timezone(&self.tz)
    }

    fn timezone(&self) -> Tz {
        self.tz
    }
}

// ===========================================================================
// Tests
// ===========================================================================
