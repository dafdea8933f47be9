use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryBackoffConfig {
    pub initial_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryBackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 200,
            backoff_factor: 2.0,
            max_delay_ms: 10_000,
            jitter: true,
        }
    }
}

/// Delay before retry number `attempt` (1-based).
pub fn delay_for_attempt_ms(attempt: u32, config: &RetryBackoffConfig, jitter_seed: u64) -> u64 {
    let exp = (attempt.saturating_sub(1)) as i32;
    let base = (config.initial_delay_ms as f64) * config.backoff_factor.powi(exp);
    let mut delay = base.min(config.max_delay_ms as f64);
    if config.jitter {
        delay *= jitter_factor(attempt, jitter_seed);
    }
    delay.round().max(0.0) as u64
}

// xorshift, scaled into [0.5, 1.5)
fn jitter_factor(attempt: u32, jitter_seed: u64) -> f64 {
    let mut x = jitter_seed ^ ((attempt as u64) << 32) ^ 0x9E3779B97F4A7C15;
    x ^= x >> 12;
    x ^= x << 25;
    x ^= x >> 27;
    let r = x.wrapping_mul(0x2545F4914F6CDD1D);
    let unit = (r as f64) / (u64::MAX as f64);
    0.5 + unit
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_for_attempt_ms_no_jitter_expected_exponential_sequence() {
        let config = RetryBackoffConfig {
            jitter: false,
            ..RetryBackoffConfig::default()
        };
        assert_eq!(delay_for_attempt_ms(1, &config, 0), 200);
        assert_eq!(delay_for_attempt_ms(2, &config, 0), 400);
        assert_eq!(delay_for_attempt_ms(3, &config, 0), 800);
    }

    #[test]
    fn delay_for_attempt_ms_caps_at_max_delay() {
        let config = RetryBackoffConfig {
            initial_delay_ms: 1_000,
            backoff_factor: 10.0,
            max_delay_ms: 5_000,
            jitter: false,
        };
        assert_eq!(delay_for_attempt_ms(4, &config, 0), 5_000);
    }

    #[test]
    fn delay_for_attempt_ms_with_jitter_stays_within_half_and_one_and_a_half() {
        let config = RetryBackoffConfig::default();
        for seed in [0_u64, 7, 42, 9_001] {
            let delay = delay_for_attempt_ms(2, &config, seed);
            assert!((200..=600).contains(&delay), "delay {delay} out of range");
        }
    }
}
