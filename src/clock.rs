//! Injectable time source for lease and retry timing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

/// Source of the current time and of timed waits.
///
/// Every lease expiry and retry delay in the monitor is computed from a
/// `Clock` so tests can drive time deterministically.
#[async_trait]
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;

    async fn sleep(&self, duration: Duration);

    /// Sleep until the clock reads at least `deadline`.
    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        let remaining = deadline - self.now();
        if let Ok(remaining) = remaining.to_std() {
            self.sleep(remaining).await;
        }
    }
}

pub type SharedClock = Arc<dyn Clock>;

/// Adds a std duration to a timestamp, saturating instead of overflowing.
pub fn add_duration(t: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    let delta = TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX);
    t.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Drops sub-millisecond precision, as the store does for timestamps.
pub fn truncate_millis(t: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(t.timestamp_millis()).unwrap_or(t)
}

/// The system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct WallClock;

#[async_trait]
impl Clock for WallClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// A clock that follows tokio's timer instead of the system time.
///
/// Under a paused runtime (`start_paused = true` or `tokio::time::pause`)
/// the reading only moves when tokio auto-advances or when a test calls
/// `tokio::time::advance`, so lease expiry is fully deterministic.
#[derive(Debug, Clone)]
pub struct VirtualClock {
    epoch: DateTime<Utc>,
    start: tokio::time::Instant,
}

impl VirtualClock {
    pub fn new(epoch: DateTime<Utc>) -> Self {
        Self {
            epoch,
            start: tokio::time::Instant::now(),
        }
    }

    pub fn new_arc(epoch: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self::new(epoch))
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

#[async_trait]
impl Clock for VirtualClock {
    fn now(&self) -> DateTime<Utc> {
        add_duration(self.epoch, self.start.elapsed())
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn epoch() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2020-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[tokio::test(start_paused = true)]
    async fn virtual_clock_moves_with_tokio_time() {
        let clock = VirtualClock::new(epoch());
        assert_eq!(clock.now(), epoch());

        tokio::time::advance(Duration::from_secs(50)).await;
        assert_eq!(clock.now(), epoch() + TimeDelta::seconds(50));
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_until_past_deadline_returns_immediately() {
        let clock = VirtualClock::new(epoch());
        clock.sleep_until(epoch() - TimeDelta::seconds(10)).await;
        assert_eq!(clock.elapsed(), Duration::ZERO);

        clock.sleep_until(epoch() + TimeDelta::seconds(3)).await;
        assert_eq!(clock.now(), epoch() + TimeDelta::seconds(3));
    }

    #[test]
    fn truncate_drops_sub_millisecond_precision() {
        let t = epoch() + TimeDelta::nanoseconds(1_234_567);
        assert_eq!(truncate_millis(t), epoch() + TimeDelta::milliseconds(1));
    }
}
