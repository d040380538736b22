use std::time::Duration;

use crate::config::QueueConfig;

/// Adaptive inter-poll delay.
///
/// The delay starts at the floor, multiplies by the backoff rate on every
/// empty poll, and snaps back to the floor the moment a poll finds work.
/// The dispatcher drives it: ask for [`schedule_next`](Self::schedule_next),
/// claim, then report the outcome.
#[derive(Clone, Debug)]
pub struct AdaptivePoller {
    current: Duration,
    fastest: Duration,
    slowest: Duration,
    backoff: f64,
}

impl AdaptivePoller {
    pub fn new(config: &QueueConfig) -> Self {
        Self::from_rates(
            config.fastest_polling_rate(),
            config.slowest_polling_rate(),
            config.polling_backoff_rate,
        )
    }

    pub fn from_rates(fastest: Duration, slowest: Duration, backoff: f64) -> Self {
        Self {
            current: fastest,
            fastest,
            slowest,
            backoff,
        }
    }

    /// The delay the next `schedule_next` call will sleep for.
    pub fn current_delay(&self) -> Duration {
        self.current
    }

    /// Sleep out the current delay. The dispatcher wraps this in a select
    /// against shutdown, which cancels the sleep.
    pub async fn schedule_next(&self) {
        tokio::time::sleep(self.current).await;
    }

    /// Adjust the delay from the latest poll outcome.
    pub fn record_outcome(&mut self, found: usize) {
        if found > 0 {
            self.current = self.fastest;
        } else {
            self.current = self.current.mul_f64(self.backoff).min(self.slowest);
        }
    }
}
