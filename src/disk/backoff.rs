use std::time::Duration;

use crate::constants::{INITIAL_RETRY_DELAY, MAX_RETRY_DELAY};

/// Exponentially growing retry delay for persistent disk failures,
/// capped at 120 seconds.
#[derive(Debug)]
pub(crate) struct ExponentialBackoff {
    current: Duration,
}

impl ExponentialBackoff {
    pub fn new() -> Self {
        Self {
            current: INITIAL_RETRY_DELAY,
        }
    }

    /// The delay to apply to the next retry; each call doubles the
    /// following one, up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(MAX_RETRY_DELAY);
        delay
    }

    /// A successful operation resets the ramp.
    pub fn reset(&mut self) {
        self.current = INITIAL_RETRY_DELAY;
    }
}
