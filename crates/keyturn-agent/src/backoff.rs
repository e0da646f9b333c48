//! Exponential backoff with jitter.
//!
//! Shared by renewal retries and watch reconnects. Each delay is jittered
//! to 0.5x..1.5x of the nominal value so a fleet of agents reacting to the
//! same rotation event does not retry in lockstep.

use std::time::Duration;

use rand::Rng;

/// Retry policy for control-plane calls.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Attempts before giving up (0 = never give up).
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Cap on the nominal delay.
    pub max_delay: Duration,
    /// Growth factor applied after each failure.
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Retry forever.
    pub fn infinite() -> Self {
        Self::with_max_attempts(0)
    }

    /// Whether `attempt` (1-based) was the last one allowed.
    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt >= self.max_attempts
    }
}

/// Stateful delay sequence for one run of retries.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    delay: Duration,
}

impl Backoff {
    pub fn new(config: RetryConfig) -> Self {
        let delay = config.initial_delay;
        Self { config, delay }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Jittered delay to wait now; grows the nominal delay for next time.
    pub fn next_delay(&mut self) -> Duration {
        let jittered = jitter(self.delay);
        self.delay = Duration::from_secs_f64(
            (self.delay.as_secs_f64() * self.config.backoff_multiplier)
                .min(self.config.max_delay.as_secs_f64()),
        );
        jittered
    }

    pub fn reset(&mut self) {
        self.delay = self.config.initial_delay;
    }
}

/// Scale `delay` by a random factor in 0.5..1.5.
pub fn jitter(delay: Duration) -> Duration {
    if delay.is_zero() {
        return delay;
    }
    let factor = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RetryConfig {
        RetryConfig {
            max_attempts: 4,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
            backoff_multiplier: 2.0,
        }
    }

    #[test]
    fn delays_grow_within_jitter_bounds_and_cap() {
        let mut backoff = Backoff::new(config());
        let nominal = [100u64, 200, 400, 400, 400];
        for ms in nominal {
            let d = backoff.next_delay();
            assert!(d >= Duration::from_millis(ms / 2), "{d:?} < {ms}/2");
            assert!(d <= Duration::from_millis(ms * 3 / 2), "{d:?} > 1.5*{ms}");
        }
    }

    #[test]
    fn reset_restarts_the_sequence() {
        let mut backoff = Backoff::new(config());
        for _ in 0..5 {
            backoff.next_delay();
        }
        backoff.reset();
        assert!(backoff.next_delay() <= Duration::from_millis(150));
    }

    #[test]
    fn exhaustion_respects_the_cap() {
        let cfg = config();
        assert!(!cfg.exhausted(3));
        assert!(cfg.exhausted(4));
        assert!(!RetryConfig::infinite().exhausted(u32::MAX));
    }

    #[test]
    fn zero_delay_stays_zero() {
        assert_eq!(jitter(Duration::ZERO), Duration::ZERO);
    }
}
