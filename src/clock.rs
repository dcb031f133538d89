//! Monotonic time source and delay abstraction
//!
//! Every timing-sensitive component reads time through a [`Clock`] so that
//! tests can run against tokio's paused virtual clock and so that backoff
//! delays never touch `std::thread::sleep`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::Instant;

/// Source of monotonic time, wall-clock time, and delays
#[async_trait]
pub trait Clock: Send + Sync {
    /// Monotonic reading used for durations, deadlines and trace ordering
    fn now(&self) -> Instant;

    /// Wall-clock reading attached to persisted records
    fn wall(&self) -> DateTime<Utc> {
        Utc::now()
    }

    /// Suspend the caller for `duration`
    async fn sleep(&self, duration: Duration);
}

/// Clock backed by the tokio timer
///
/// Under `tokio::time::pause()` this clock advances virtually, which is how
/// the retry and deadline tests avoid real delays.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Longest span added to an instant; about thirty years, as tokio uses for far-future timers
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `start + span`, with spans beyond representable time treated as "far future"
pub fn instant_after(start: Instant, span: Duration) -> Instant {
    start
        .checked_add(span.min(FAR_FUTURE))
        .or_else(|| start.checked_add(Duration::from_secs(86400)))
        .unwrap_or(start)
}

/// Remaining time until `deadline`, saturating at zero
pub fn remaining_until(clock: &dyn Clock, deadline: Instant) -> Duration {
    deadline.saturating_duration_since(clock.now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_sleep_advances_virtual_time() {
        let clock = TokioClock;
        let before = clock.now();

        clock.sleep(Duration::from_secs(30)).await;

        assert!(clock.now() - before >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_until_saturates() {
        let clock = TokioClock;
        let deadline = clock.now() + Duration::from_millis(100);

        assert_eq!(remaining_until(&clock, deadline), Duration::from_millis(100));

        clock.sleep(Duration::from_millis(250)).await;
        assert_eq!(remaining_until(&clock, deadline), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_instant_after_saturates_huge_spans() {
        let clock = TokioClock;
        let start = clock.now();

        assert_eq!(instant_after(start, Duration::from_secs(5)), start + Duration::from_secs(5));

        let far = instant_after(start, Duration::MAX);
        assert!(far > start + Duration::from_secs(86400 * 365));
        assert_eq!(far, instant_after(start, FAR_FUTURE));
    }
}
