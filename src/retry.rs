//! Retry delay schedules.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with relative jitter: base, 2x base, 4x base, ... capped.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    cap: Duration,
    jitter: f64,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, cap: Duration, jitter: f64) -> Self {
        Self {
            base,
            cap,
            jitter: jitter.clamp(0.0, 0.99),
            attempt: 0,
        }
    }

    /// Delay for the current attempt before jitter.
    pub fn nominal_delay(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(20));
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Whether the nominal delay has reached the cap.
    pub fn is_capped(&self) -> bool {
        self.nominal_delay() >= self.cap
    }

    /// Next delay with jitter applied; advances the attempt counter.
    pub fn next_delay<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let nominal = self.nominal_delay();
        self.attempt = self.attempt.saturating_add(1);
        if self.jitter == 0.0 {
            return nominal;
        }
        let factor = rng.gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        nominal.mul_f64(factor)
    }

    /// Jittered delay at the cap, without advancing.
    pub fn capped_delay<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        if self.jitter == 0.0 {
            return self.cap;
        }
        let factor = rng.gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        self.cap.mul_f64(factor)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
