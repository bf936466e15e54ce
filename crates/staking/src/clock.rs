//! Time source boundary. The engine never reads the wall clock directly.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

/// Supplies `now` as a non-decreasing timestamp.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

impl<T> Clock for Arc<T>
where
    T: Clock + ?Sized,
{
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Hand-driven clock for tests and simulation. Only moves forward.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move forward by `by`. Negative durations are ignored.
    pub fn advance(&self, by: Duration) -> DateTime<Utc> {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        if by > Duration::zero() {
            *now += by;
        }
        *now
    }

    /// Move forward to `at`; earlier instants leave the clock where it is.
    pub fn advance_to(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        if at > *now {
            *now = at;
        }
        *now
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_never_goes_backwards() {
        let start = DateTime::<Utc>::default();
        let clock = ManualClock::new(start);

        assert_eq!(clock.advance(Duration::seconds(10)), start + Duration::seconds(10));
        assert_eq!(clock.advance(Duration::seconds(-5)), start + Duration::seconds(10));
        assert_eq!(clock.advance_to(start), start + Duration::seconds(10));
        assert_eq!(clock.advance_to(start + Duration::days(1)), start + Duration::days(1));
        assert_eq!(clock.now(), start + Duration::days(1));
    }
}
