use std::time::Duration;

use rand::Rng;

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Decides how long to wait before the next connection attempt.
///
/// `failures` counts consecutive losses since the last established session,
/// starting at 1 for the first loss.
pub trait ReconnectPolicy: Send {
    fn delay_for(&mut self, failures: u32) -> Duration;

    fn name(&self) -> &'static str;
}

/// Same delay after every loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedDelay {
    delay: Duration,
}

impl FixedDelay {
    pub const fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for FixedDelay {
    fn default() -> Self {
        Self::new(DEFAULT_RECONNECT_DELAY)
    }
}

impl ReconnectPolicy for FixedDelay {
    fn delay_for(&mut self, _failures: u32) -> Duration {
        self.delay
    }

    fn name(&self) -> &'static str {
        "fixed"
    }
}

/// `initial * 2^(failures - 1)`, capped at `max`. With jitter on, the result
/// is drawn uniformly from the upper half of that delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    jitter: bool,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            jitter: true,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    fn ceiling(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1);
        let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
        self.initial
            .checked_mul(factor)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_RECONNECT_DELAY, DEFAULT_BACKOFF_MAX)
    }
}

impl ReconnectPolicy for ExponentialBackoff {
    fn delay_for(&mut self, failures: u32) -> Duration {
        let ceiling = self.ceiling(failures);
        if !self.jitter {
            return ceiling;
        }
        let ceiling_ms = ceiling.as_millis() as u64;
        let floor_ms = ceiling_ms / 2;
        if ceiling_ms == floor_ms {
            return ceiling;
        }
        Duration::from_millis(rand::thread_rng().gen_range(floor_ms..=ceiling_ms))
    }

    fn name(&self) -> &'static str {
        "exponential"
    }
}
