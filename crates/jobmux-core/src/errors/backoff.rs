//! Retry delay policies.

use std::time::Duration;

use rand::Rng;

use super::ErrorCategory;

/// How the delay before a retry grows with attempt number.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DelayPolicy {
    Immediate,
    Fixed(Duration),
    Linear { base: Duration },
    Exponential { base: Duration, factor: f64 },
}

impl DelayPolicy {
    /// Per-category default: `RateLimit` gets a long exponential delay,
    /// the other retryable categories a short one.
    pub fn for_category(category: ErrorCategory) -> Self {
        match category {
            ErrorCategory::RateLimit => Self::Exponential {
                base: Duration::from_secs(10),
                factor: 2.0,
            },
            _ => Self::Exponential {
                base: Duration::from_secs(1),
                factor: 2.0,
            },
        }
    }
}

/// Compute the jittered delay before retry attempt `attempt` (1-indexed).
/// Jitter is multiplicative uniform in `[0.8, 1.2]`.
pub fn retry_delay(policy: DelayPolicy, attempt: i32) -> Duration {
    let base = match policy {
        DelayPolicy::Immediate => Duration::ZERO,
        DelayPolicy::Fixed(d) => d,
        DelayPolicy::Linear { base } => base * (attempt.max(1) as u32),
        DelayPolicy::Exponential { base, factor } => {
            let secs = base.as_secs_f64() * factor.powi((attempt - 1).max(0));
            Duration::from_secs_f64(secs)
        }
    };

    if base.is_zero() {
        return base;
    }

    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    Duration::from_secs_f64(base.as_secs_f64() * jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_grows_with_attempt() {
        let policy = DelayPolicy::Exponential {
            base: Duration::from_secs(1),
            factor: 2.0,
        };
        // Strip jitter by sampling many times and checking the range.
        for attempt in 1..=4 {
            let expected = Duration::from_secs_f64(2f64.powi(attempt - 1));
            let delay = retry_delay(policy, attempt);
            let lo = expected.as_secs_f64() * 0.8;
            let hi = expected.as_secs_f64() * 1.2;
            let actual = delay.as_secs_f64();
            assert!(actual >= lo - 1e-9 && actual <= hi + 1e-9, "attempt {attempt}: {actual} not in [{lo}, {hi}]");
        }
    }

    #[test]
    fn immediate_has_no_delay() {
        assert_eq!(retry_delay(DelayPolicy::Immediate, 1), Duration::ZERO);
    }
}
