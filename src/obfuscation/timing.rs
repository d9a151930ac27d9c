//! Random send delays

use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;

/// Delay bounds for traffic shaping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShapingConfig {
    /// Minimum delay before a write (milliseconds)
    pub min_delay_ms: u64,
    /// Maximum delay before a write (milliseconds)
    pub max_delay_ms: u64,
}

impl Default for ShapingConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 50,
            max_delay_ms: 500,
        }
    }
}

/// Adds a uniformly random pause before each write batch
#[derive(Debug, Clone)]
pub struct TrafficShaper {
    config: ShapingConfig,
}

impl TrafficShaper {
    pub fn new(config: ShapingConfig) -> Self {
        let (min, max) = if config.min_delay_ms <= config.max_delay_ms {
            (config.min_delay_ms, config.max_delay_ms)
        } else {
            (config.max_delay_ms, config.min_delay_ms)
        };
        Self {
            config: ShapingConfig {
                min_delay_ms: min,
                max_delay_ms: max,
            },
        }
    }

    pub fn config(&self) -> ShapingConfig {
        self.config
    }

    /// Pick the next delay
    pub fn next_delay(&self) -> Duration {
        let ms = rand::thread_rng().gen_range(self.config.min_delay_ms..=self.config.max_delay_ms);
        Duration::from_millis(ms)
    }

    /// Sleep for a random delay
    pub async fn delay(&self) {
        let delay = self.next_delay();
        if !delay.is_zero() {
            sleep(delay).await;
        }
    }
}
