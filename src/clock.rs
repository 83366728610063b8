//! Injectable time source.
//!
//! Sync providers and the orchestrator never read the wall clock directly.
//! They take an `Arc<dyn Clock>` so tests can pin time and long-running
//! simulations can compress it.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock where real time elapsed since `base` counts `factor` times over:
/// `base + (real_now - base) * factor`. Restarts resume from the same
/// simulated timeline.
#[derive(Debug, Clone)]
pub struct AcceleratedClock {
    base: DateTime<Utc>,
    factor: f64,
}

impl AcceleratedClock {
    pub fn new(base: DateTime<Utc>, factor: f64) -> Self {
        Self { base, factor }
    }

    fn at(&self, real_now: DateTime<Utc>) -> DateTime<Utc> {
        let elapsed = real_now - self.base;
        // Float to int casts saturate; saturate the date the same way.
        let scaled_ms = (elapsed.num_milliseconds() as f64 * self.factor) as i64;
        let fallback = if scaled_ms < 0 {
            DateTime::<Utc>::MIN_UTC
        } else {
            DateTime::<Utc>::MAX_UTC
        };
        Duration::try_milliseconds(scaled_ms)
            .and_then(|scaled| self.base.checked_add_signed(scaled))
            .unwrap_or(fallback)
    }
}

impl Clock for AcceleratedClock {
    fn now(&self) -> DateTime<Utc> {
        self.at(Utc::now())
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_manual_clock_advance() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        clock.advance(Duration::hours(2));
        assert_eq!(clock.now(), start + Duration::hours(2));

        clock.set(start);
        assert_eq!(clock.now(), start);
    }

    #[test]
    fn test_accelerated_clock_scales_elapsed_time() {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = AcceleratedClock::new(base, 60.0);
        assert_eq!(clock.at(base), base);
        assert_eq!(clock.at(base + Duration::seconds(1)), base + Duration::minutes(1));
    }

    #[test]
    fn test_accelerated_clock_counts_from_past_base() {
        let base = Utc::now() - Duration::hours(1);
        let clock = AcceleratedClock::new(base, 60.0);

        let elapsed = clock.now() - base;
        assert!(elapsed >= Duration::hours(60));
        assert!(elapsed < Duration::hours(61));

        // A second clock over the same base lands on the same timeline.
        let restarted = AcceleratedClock::new(base, 60.0);
        assert!(restarted.now() >= clock.now());
    }

    #[test]
    fn test_accelerated_clock_saturates_instead_of_overflowing() {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = AcceleratedClock::new(base, 1e15);
        assert_eq!(clock.at(base + Duration::days(365)), DateTime::<Utc>::MAX_UTC);
    }
}
