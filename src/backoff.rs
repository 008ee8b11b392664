//! Bounded exponential backoff with additive jitter.
//!
//! Paces upstream reconnect attempts: each failure doubles the delay up to
//! a maximum, and a uniform random jitter is added on top so that many
//! networks failing at once do not reconnect in lockstep.

use std::cmp;
use std::time::Duration;

use rand::Rng;

pub struct Backoff {
    min: Duration,
    max: Duration,
    jitter: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration, jitter: Duration) -> Self {
        Backoff {
            min,
            max,
            jitter,
            current: Duration::ZERO,
        }
    }

    /// The delay to wait before the next attempt. Doubles on each call,
    /// clamped to `max` before the jitter is added.
    pub fn next(&mut self) -> Duration {
        let base = if self.current.is_zero() {
            self.min
        } else {
            cmp::min(self.current.saturating_mul(2), self.max)
        };
        self.current = base;

        if self.jitter.is_zero() {
            base
        } else {
            base + self.jitter.mul_f64(rand::thread_rng().gen::<f64>())
        }
    }

    /// Return to the initial delay.
    pub fn reset(&mut self) {
        self.current = Duration::ZERO;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_then_clamps() {
        let mut b = Backoff::new(
            Duration::from_secs(1),
            Duration::from_secs(4),
            Duration::ZERO,
        );
        assert_eq!(b.next(), Duration::from_secs(1));
        assert_eq!(b.next(), Duration::from_secs(2));
        assert_eq!(b.next(), Duration::from_secs(4));
        for _ in 0..8 {
            assert_eq!(b.next(), Duration::from_secs(4));
        }
    }

    #[test]
    fn reset_returns_to_min() {
        let mut b = Backoff::new(
            Duration::from_secs(1),
            Duration::from_secs(4),
            Duration::ZERO,
        );
        b.next();
        b.next();
        b.reset();
        assert_eq!(b.next(), Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let min = Duration::from_secs(60);
        let jitter = Duration::from_secs(60);
        let mut b = Backoff::new(min, Duration::from_secs(600), jitter);
        b.reset();
        for _ in 0..100 {
            b.reset();
            let d = b.next();
            assert!(d >= min);
            assert!(d < min + jitter);
        }
    }
}
