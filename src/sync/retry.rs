//! Per-key retry policy with exponential backoff.

use std::time::Duration;

/// Backoff schedule for keys whose push to the remote store failed.
///
/// After `max_attempts` consecutive failures a key is dead-lettered: it stays
/// dirty and queued, but background passes stop retrying it until the user
/// forces a sync or writes the record again.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
  pub initial_delay: Duration,
  pub max_delay: Duration,
  pub factor: f64,
  pub max_attempts: u32,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      initial_delay: Duration::from_secs(5),
      max_delay: Duration::from_secs(300),
      factor: 2.0,
      max_attempts: 8,
    }
  }
}

impl RetryPolicy {
  /// Fast retry for tests (minimal delays)
  #[cfg(test)]
  pub fn test() -> Self {
    Self {
      initial_delay: Duration::from_millis(10),
      max_delay: Duration::from_millis(100),
      factor: 2.0,
      max_attempts: 3,
    }
  }

  /// Wait before the attempt following failure number `attempt` (1-based).
  pub fn delay_for(&self, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32) as i32;
    let secs = self.initial_delay.as_secs_f64() * self.factor.max(1.0).powi(exponent);
    if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
      self.max_delay
    } else {
      Duration::from_secs_f64(secs)
    }
  }

  pub fn is_exhausted(&self, attempts: u32) -> bool {
    attempts >= self.max_attempts
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_delay_doubles_then_caps() {
    let policy = RetryPolicy::default();
    assert_eq!(policy.delay_for(1), Duration::from_secs(5));
    assert_eq!(policy.delay_for(2), Duration::from_secs(10));
    assert_eq!(policy.delay_for(3), Duration::from_secs(20));
    assert_eq!(policy.delay_for(7), Duration::from_secs(300));
    assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(300));
  }

  #[test]
  fn test_exhaustion() {
    let policy = RetryPolicy::test();
    assert!(!policy.is_exhausted(2));
    assert!(policy.is_exhausted(3));
  }
}
