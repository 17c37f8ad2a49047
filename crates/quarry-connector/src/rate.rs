//! Process-local request pacing.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Minimum-interval rate clock: at most `requests_per_second` calls pass
/// per second, enforced by spacing. Private to a connector; not shared
/// across workers or processes.
#[derive(Debug)]
pub struct RateClock {
    min_interval: Option<Duration>,
    last: Mutex<Option<Instant>>,
}

impl RateClock {
    /// `requests_per_second <= 0.0` disables pacing.
    #[must_use]
    pub fn new(requests_per_second: f64) -> Self {
        let min_interval = if requests_per_second > 0.0 {
            Some(Duration::from_secs_f64(1.0 / requests_per_second))
        } else {
            None
        };
        Self {
            min_interval,
            last: Mutex::new(None),
        }
    }

    /// Wait until the next request is allowed.
    pub async fn pace(&self) {
        let Some(interval) = self.min_interval else {
            return;
        };

        let mut last = self.last.lock().await;
        let now = Instant::now();
        if let Some(prev) = *last {
            let elapsed = now.duration_since(prev);
            if elapsed < interval {
                tokio::time::sleep(interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unlimited_clock_does_not_wait() {
        let clock = RateClock::new(0.0);
        let start = Instant::now();
        for _ in 0..100 {
            clock.pace().await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn paced_clock_spaces_requests() {
        let clock = RateClock::new(100.0); // 10ms interval
        let start = Instant::now();
        for _ in 0..3 {
            clock.pace().await;
        }
        // Two full intervals between three requests.
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
