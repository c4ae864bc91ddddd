//! Injected clock capability.
//!
//! Every timestamp the build loop produces (story transitions, iteration
//! metadata, run ids) derives from this capability instead of calling
//! `Utc::now()` directly, so a test can hand the loop a fixed or
//! step-advancing clock and assert on exact values.

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
pub struct FixedClock(pub std::sync::Mutex<DateTime<Utc>>);

#[cfg(test)]
impl FixedClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self(std::sync::Mutex::new(at))
    }

    pub fn advance(&self, seconds: i64) {
        let mut guard = self.0.lock().unwrap();
        *guard += chrono::Duration::seconds(seconds);
    }
}

#[cfg(test)]
impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_clock_advances() {
        let clock = FixedClock::new(Utc::now());
        let first = clock.now();
        clock.advance(10);
        let second = clock.now();
        assert_eq!((second - first).num_seconds(), 10);
    }
}
