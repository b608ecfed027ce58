//! Reconnect policy for the stream connection.

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use std::time::Duration;

/// Attempt ceiling and delay schedule for reconnects.
///
/// `max_attempts` bounds the number of consecutive connection attempts made
/// without reaching `Open`. `None` retries forever.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: Option<u32>,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Some(3),
            base_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    pub fn new(max_attempts: Option<u32>, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    /// Retry forever with the given delays
    pub fn unlimited(base_delay: Duration, max_delay: Duration) -> Self {
        Self::new(None, base_delay, max_delay)
    }

    /// Whether another attempt is allowed after `attempts` failed ones
    pub fn allows_retry(&self, attempts: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempts < max)
    }

    /// Fresh delay schedule: `base`, `2*base`, `4*base`, ... capped at `max_delay`
    pub fn schedule(&self) -> BackoffSchedule {
        let builder = ExponentialBuilder::default()
            .with_min_delay(self.base_delay)
            .with_max_delay(self.max_delay)
            .with_factor(2.0)
            .with_max_times(usize::MAX);
        BackoffSchedule {
            inner: builder.build(),
            max_delay: self.max_delay,
        }
    }
}

/// Iterator over reconnect delays; restart it by asking the policy for a new one
pub struct BackoffSchedule {
    inner: ExponentialBackoff,
    max_delay: Duration,
}

impl BackoffSchedule {
    pub fn next_delay(&mut self) -> Duration {
        self.inner.next().unwrap_or(self.max_delay)
    }
}
