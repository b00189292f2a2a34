use std::time::Duration;

const BACKOFF_MULTIPLIER: f64 = 2.0;

/// Exponential reconnect delay with jitter.
///
/// The n-th consecutive delay is `initial * 2^n` capped at `max`, then
/// jittered down by up to half so that many clients losing the same server
/// do not reconnect in lockstep.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            attempts: 0,
        }
    }

    /// Delay before the next attempt, advancing the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self.ceiling();
        self.attempts = self.attempts.saturating_add(1);

        let ceiling_ms = ceiling.as_millis() as f64;
        let jitter_ms = rand::random::<f64>() * ceiling_ms / 2.0;
        Duration::from_millis((ceiling_ms - jitter_ms) as u64)
    }

    /// Undelayed upper bound for the next attempt.
    pub fn ceiling(&self) -> Duration {
        let base_ms = self.initial.as_millis() as f64;
        let backoff_ms = base_ms * BACKOFF_MULTIPLIER.powi(self.attempts.min(32) as i32);
        let capped_ms = backoff_ms.min(self.max.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}
