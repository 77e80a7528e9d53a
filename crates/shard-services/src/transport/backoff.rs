//! Reconnect backoff for the send path.

use std::time::Duration;

use tokio::time::Instant;

/// Exponential backoff window armed by consecutive connect failures.
///
/// While the window is open the worker drops envelopes instead of dialing.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    failures: u32,
    until: Option<Instant>,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: 0,
            until: None,
        }
    }

    /// Time left in the current window, if one is open.
    pub fn remaining(&self) -> Option<Duration> {
        let until = self.until?;
        let now = Instant::now();
        (until > now).then(|| until - now)
    }

    /// Record a failed connect and open the next window. Returns its length.
    pub fn record_failure(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let factor = 1u32.checked_shl(self.failures - 1).unwrap_or(u32::MAX);
        let delay = self.base.saturating_mul(factor).min(self.max);
        self.until = Some(Instant::now() + delay);
        delay
    }

    pub fn reset(&mut self) {
        self.failures = 0;
        self.until = None;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}
