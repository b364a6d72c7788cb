use std::time::Duration;

use rand::Rng;

use crate::config::TransportConfig;

/// Exponential reconnect delay with symmetric jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    growth: f64,
    max: Duration,
    jitter: f64,
}

impl Backoff {
    pub fn new(base: Duration, growth: f64, max: Duration, jitter: f64) -> Self {
        Self {
            base,
            growth: growth.max(1.0),
            max,
            jitter: jitter.clamp(0.0, 0.99),
        }
    }

    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            config.growth,
            Duration::from_millis(config.max_delay_ms),
            config.jitter,
        )
    }

    /// `base * growth^attempt`, capped at the maximum.
    pub fn nominal(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.base.as_secs_f64() * self.growth.powi(exp);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Inclusive range [`Backoff::delay_for`] draws from.
    pub fn bounds(&self, attempt: u32) -> (Duration, Duration) {
        let nominal = self.nominal(attempt);
        (
            nominal.mul_f64(1.0 - self.jitter),
            nominal.mul_f64(1.0 + self.jitter),
        )
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let nominal = self.nominal(attempt);
        if self.jitter == 0.0 {
            return nominal;
        }
        let factor = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        nominal.mul_f64(1.0 + factor)
    }
}
