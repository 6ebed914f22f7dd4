//! Reconnect backoff for dropped transports.

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use serde::{Deserialize, Serialize};

/// Automatic reconnect schedule: 1s → 2s → 4s … capped at 16s, 3 attempts, no jitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub factor: f32,
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            factor: 2.0,
            max_delay_ms: 16_000,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before each reconnect attempt, one item per allowed attempt
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(self.base_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_factor(self.factor)
            .with_max_times(self.max_attempts)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule() {
        let delays: Vec<u64> = ReconnectPolicy::default()
            .delays()
            .map(|d| d.as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000]);
    }

    #[test]
    fn test_schedule_is_capped() {
        let policy = ReconnectPolicy {
            max_attempts: 7,
            ..ReconnectPolicy::default()
        };
        let delays: Vec<u64> = policy.delays().map(|d| d.as_millis() as u64).collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 16_000, 16_000, 16_000]);
    }

    #[test]
    fn test_zero_attempts_never_retries() {
        let policy = ReconnectPolicy {
            max_attempts: 0,
            ..ReconnectPolicy::default()
        };
        assert_eq!(policy.delays().count(), 0);
    }
}
