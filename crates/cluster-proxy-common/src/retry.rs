//! Exponential backoff with jitter.
//!
//! The reconcile path never sleeps on its own; it asks a [`Backoff`] how long
//! the controller should wait before the next pass and returns that as its
//! requeue action.
//!
//! # Example
//!
//! ```ignore
//! use cluster_proxy_common::retry::{Backoff, RetryConfig};
//!
//! let mut backoff = Backoff::new(RetryConfig::default());
//! let delay = backoff.next_delay(); // ~1s, then ~2s, ~4s ... capped at 60s
//! backoff.reset();                  // after a successful reconcile
//! ```

use std::time::Duration;

use rand::Rng;

/// Configuration for requeue backoff.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Scale each delay by a random factor in 0.5..1.5
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Same growth as the default, without randomization
    pub fn deterministic() -> Self {
        Self {
            jitter: false,
            ..Default::default()
        }
    }
}

/// Stateful exponential backoff.
///
/// Each call to [`Backoff::next_delay`] returns the current delay (optionally
/// jittered) and grows the base delay for the next call, capped at
/// `max_delay`.
#[derive(Clone, Debug)]
pub struct Backoff {
    config: RetryConfig,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    /// Create a backoff starting at `config.initial_delay`
    pub fn new(config: RetryConfig) -> Self {
        let current = config.initial_delay;
        Self {
            config,
            current,
            attempts: 0,
        }
    }

    /// Delay to wait before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        self.attempts = self.attempts.saturating_add(1);
        let base = self.current;

        self.current = Duration::from_secs_f64(
            (base.as_secs_f64() * self.config.backoff_multiplier)
                .min(self.config.max_delay.as_secs_f64()),
        );

        if self.config.jitter {
            let factor = rand::thread_rng().gen_range(0.5..1.5);
            Duration::from_secs_f64(base.as_secs_f64() * factor)
        } else {
            base
        }
    }

    /// Start over from the initial delay
    pub fn reset(&mut self) {
        self.current = self.config.initial_delay;
        self.attempts = 0;
    }

    /// Number of delays handed out since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_until_capped() {
        let mut backoff = Backoff::new(RetryConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
            backoff_multiplier: 2.0,
            jitter: false,
        });

        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 8, 8]);
        assert_eq!(backoff.attempts(), 6);
    }

    #[test]
    fn reset_returns_to_initial_delay() {
        let mut backoff = Backoff::new(RetryConfig::deterministic());
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();

        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_within_half_to_one_and_a_half() {
        let mut backoff = Backoff::new(RetryConfig {
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 1.0,
            jitter: true,
        });

        for _ in 0..100 {
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_secs(5), "{:?}", delay);
            assert!(delay < Duration::from_secs(15), "{:?}", delay);
        }
    }
}
