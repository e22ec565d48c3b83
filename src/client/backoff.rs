//! Retry policy with exponential backoff and jitter.

use rand::Rng;
use std::time::Duration;

use crate::config::LayerConfig;
use crate::error::ErrorKind;

/// How many times to try a call and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Total attempts, including the first one
  pub max_attempts: u32,
  pub base_delay: Duration,
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      base_delay: Duration::from_millis(250),
      max_delay: Duration::from_secs(10),
    }
  }
}

impl From<&LayerConfig> for RetryPolicy {
  fn from(config: &LayerConfig) -> Self {
    Self {
      max_attempts: config.max_retry_attempts,
      base_delay: Duration::from_millis(config.retry_base_delay_ms),
      max_delay: Duration::from_millis(config.retry_max_delay_ms),
    }
  }
}

impl RetryPolicy {
  /// Whether another attempt may follow `attempt` (zero-based) failing with `error`.
  pub fn should_retry(&self, attempt: u32, error: &ErrorKind) -> bool {
    error.is_transient() && attempt + 1 < self.max_attempts
  }

  /// Delay without jitter before the attempt following `attempt`:
  /// `base * 2^attempt`, capped at `max_delay`.
  pub fn base_delay_for(&self, attempt: u32) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    self
      .base_delay
      .checked_mul(factor)
      .unwrap_or(self.max_delay)
      .min(self.max_delay)
  }

  /// Delay before the attempt following `attempt`, with jitter in `[0, base)`.
  ///
  /// A server-suggested delay (rate limiting) wins when it is longer. The
  /// result never exceeds `max_delay`.
  pub fn delay_for<R: Rng + ?Sized>(
    &self,
    attempt: u32,
    error: &ErrorKind,
    rng: &mut R,
  ) -> Duration {
    let base_ms = self.base_delay.as_millis() as u64;
    let jitter = if base_ms > 0 {
      Duration::from_millis(rng.random_range(0..base_ms))
    } else {
      Duration::ZERO
    };

    let computed = self.base_delay_for(attempt).saturating_add(jitter);
    let delay = match error.retry_after() {
      Some(suggested) => computed.max(suggested),
      None => computed,
    };
    delay.min(self.max_delay)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use rand::rngs::StdRng;
  use rand::SeedableRng;

  fn policy() -> RetryPolicy {
    RetryPolicy {
      max_attempts: 5,
      base_delay: Duration::from_millis(100),
      max_delay: Duration::from_millis(1000),
    }
  }

  #[test]
  fn test_base_delay_doubles_and_caps() {
    let p = policy();
    assert_eq!(p.base_delay_for(0), Duration::from_millis(100));
    assert_eq!(p.base_delay_for(1), Duration::from_millis(200));
    assert_eq!(p.base_delay_for(2), Duration::from_millis(400));
    assert_eq!(p.base_delay_for(3), Duration::from_millis(800));
    assert_eq!(p.base_delay_for(4), Duration::from_millis(1000));
    assert_eq!(p.base_delay_for(40), Duration::from_millis(1000));
  }

  #[test]
  fn test_jittered_delay_stays_in_bounds() {
    let p = policy();
    let mut rng = StdRng::seed_from_u64(7);
    let err = ErrorKind::network("reset");

    for attempt in 0..6 {
      let base = p.base_delay_for(attempt);
      for _ in 0..50 {
        let d = p.delay_for(attempt, &err, &mut rng);
        assert!(d >= base);
        assert!(d < base + p.base_delay || d == p.max_delay);
        assert!(d <= p.max_delay);
      }
    }
  }

  #[test]
  fn test_lower_bound_is_non_decreasing() {
    let p = policy();
    let mut previous = Duration::ZERO;
    for attempt in 0..10 {
      let base = p.base_delay_for(attempt);
      assert!(base >= previous);
      previous = base;
    }
  }

  #[test]
  fn test_rate_limit_suggestion_wins_but_is_capped() {
    let p = policy();
    let mut rng = StdRng::seed_from_u64(1);

    let err = ErrorKind::RateLimited {
      retry_after_ms: Some(700),
    };
    assert_eq!(p.delay_for(0, &err, &mut rng), Duration::from_millis(700));

    let err = ErrorKind::RateLimited {
      retry_after_ms: Some(60_000),
    };
    assert_eq!(p.delay_for(0, &err, &mut rng), p.max_delay);
  }

  #[test]
  fn test_should_retry_respects_kind_and_budget() {
    let p = RetryPolicy {
      max_attempts: 3,
      ..policy()
    };
    let transient = ErrorKind::network("reset");
    assert!(p.should_retry(0, &transient));
    assert!(p.should_retry(1, &transient));
    assert!(!p.should_retry(2, &transient));
    assert!(!p.should_retry(0, &ErrorKind::not_found("x")));
    assert!(!p.should_retry(0, &ErrorKind::auth("expired")));
  }
}
