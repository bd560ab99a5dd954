use std::time::Duration;

use iris_types::config::NetworkConfig;

/// Delay before reconnect attempt number `attempt` (0-based).
pub trait BackoffPolicy: Send + Sync {
    fn delay(&self, attempt: u32) -> Duration;
}

/// `initial * multiplier^attempt`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialBackoff {
    pub initial: Duration,
    pub multiplier: f64,
    pub max: Duration,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, multiplier: f64, max: Duration) -> Self {
        Self {
            initial: initial.min(max),
            multiplier: multiplier.max(1.0),
            max,
        }
    }

    pub fn from_config(config: &NetworkConfig) -> Self {
        Self::new(
            Duration::from_millis(config.backoff_initial_ms),
            config.backoff_multiplier,
            Duration::from_millis(config.backoff_max_ms),
        )
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), 2.0, Duration::from_secs(30))
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(64) as i32);
        let millis = self.initial.as_millis() as f64 * factor;
        if !millis.is_finite() || millis >= self.max.as_millis() as f64 {
            self.max
        } else {
            Duration::from_millis(millis as u64)
        }
    }
}

/// Same delay every time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedBackoff(pub Duration);

impl BackoffPolicy for FixedBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        self.0
    }
}
