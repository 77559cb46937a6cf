//! Backoff for rate-limited remote calls
//!
//! [`RetryPolicy`] holds no per-call state. The delay before retry `n` is
//! `base * 2^n` plus uniform jitter in `[0, jitter)`, which keeps workers
//! that were throttled together from retrying in lockstep.

use cloudbd_common::{Error, RetryConfig};
use rand::Rng;
use std::time::Duration;
use tracing::warn;

/// Classifies errors for [`RetryPolicy`]
///
/// Only a rate-limit rejection is worth retrying; everything else is final.
pub trait Throttling {
    fn is_throttled(&self) -> bool;
}

impl Throttling for Error {
    fn is_throttled(&self) -> bool {
        self.is_rate_limited()
    }
}

/// Blocking pause between attempts
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

/// Sleeps the calling thread
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Exponential backoff with jitter, applied only to rate-limit rejections
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Create a policy; `max_attempts` counts the first call
    pub const fn new(max_attempts: u32, base_delay: Duration, jitter: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            jitter,
        }
    }

    /// Build a policy from configuration
    pub const fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts, config.base_delay(), config.jitter())
    }

    /// Total attempts allowed
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay to wait after failed attempt `attempt` (zero-based)
    ///
    /// `jitter_fraction` is clamped to `[0, 1)` and scales the jitter bound.
    pub fn delay(&self, attempt: u32, jitter_fraction: f64) -> Duration {
        let backoff = self.base_delay.saturating_mul(2u32.saturating_pow(attempt));
        let fraction = jitter_fraction.clamp(0.0, 1.0 - f64::EPSILON);
        backoff.saturating_add(self.jitter.mul_f64(fraction))
    }

    /// Run `op` until it succeeds, fails with anything but a rate limit, or
    /// runs out of attempts
    ///
    /// The last error is returned unchanged. `on_retry` is called once per
    /// backoff, before sleeping.
    pub fn run<T, E, S, R, F, C>(
        &self,
        sleeper: &S,
        rng: &mut R,
        mut on_retry: C,
        mut op: F,
    ) -> Result<T, E>
    where
        E: Throttling + std::fmt::Display,
        S: Sleeper + ?Sized,
        R: Rng,
        F: FnMut() -> Result<T, E>,
        C: FnMut(u32, &E),
    {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_throttled() && attempt + 1 < self.max_attempts => {
                    let delay = self.delay(attempt, rng.gen_range(0.0..1.0));
                    warn!(
                        "Rate limited ({e}), backing off {:?} before attempt {}/{}",
                        delay,
                        attempt + 2,
                        self.max_attempts
                    );
                    on_retry(attempt, &e);
                    sleeper.sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[derive(Default)]
    struct RecordingSleeper {
        slept: Mutex<Vec<Duration>>,
    }

    impl Sleeper for RecordingSleeper {
        fn sleep(&self, duration: Duration) {
            self.slept.lock().push(duration);
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(5, Duration::from_secs(1), Duration::from_secs(1))
    }

    #[test]
    fn test_delay_is_exponential() {
        let policy = policy();
        assert_eq!(policy.delay(0, 0.0), Duration::from_secs(1));
        assert_eq!(policy.delay(1, 0.0), Duration::from_secs(2));
        assert_eq!(policy.delay(2, 0.0), Duration::from_secs(4));
        assert_eq!(policy.delay(3, 0.0), Duration::from_secs(8));
    }

    #[test]
    fn test_delay_jitter_is_sub_unit() {
        let policy = policy();
        let with_jitter = policy.delay(2, 0.5);
        assert_eq!(with_jitter, Duration::from_millis(4500));
        assert!(policy.delay(2, 0.999) < Duration::from_secs(5));
        assert_eq!(policy.delay(2, -3.0), Duration::from_secs(4));
    }

    #[test]
    fn test_succeeds_on_fifth_attempt() {
        let sleeper = RecordingSleeper::default();
        let mut rng = StdRng::seed_from_u64(7);
        let mut attempts = 0;
        let mut retries = 0;

        let result = policy().run(
            &sleeper,
            &mut rng,
            |_, _| retries += 1,
            || {
                attempts += 1;
                if attempts < 5 {
                    Err(Error::RateLimited("userRateLimitExceeded".into()))
                } else {
                    Ok("done")
                }
            },
        );

        assert_eq!(result.unwrap(), "done");
        assert_eq!(attempts, 5);
        assert_eq!(retries, 4);

        let slept = sleeper.slept.lock();
        assert_eq!(slept.len(), 4);
        for (n, delay) in slept.iter().enumerate() {
            let floor = Duration::from_secs(1 << n);
            assert!(*delay >= floor && *delay < floor + Duration::from_secs(1));
        }
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let sleeper = RecordingSleeper::default();
        let mut rng = StdRng::seed_from_u64(1);
        let mut attempts = 0;

        let result: Result<(), Error> = policy().run(
            &sleeper,
            &mut rng,
            |_, _| {},
            || {
                attempts += 1;
                Err(Error::RateLimited("rateLimitExceeded".into()))
            },
        );

        assert!(result.unwrap_err().is_rate_limited());
        assert_eq!(attempts, 5);
        assert_eq!(sleeper.slept.lock().len(), 4);
    }

    #[test]
    fn test_other_errors_not_retried() {
        let sleeper = RecordingSleeper::default();
        let mut rng = StdRng::seed_from_u64(1);
        let mut attempts = 0;

        let result: Result<(), Error> = policy().run(
            &sleeper,
            &mut rng,
            |_, _| {},
            || {
                attempts += 1;
                Err(Error::AccessDenied("read-only".into()))
            },
        );

        assert!(matches!(result, Err(Error::AccessDenied(_))));
        assert_eq!(attempts, 1);
        assert!(sleeper.slept.lock().is_empty());
    }

    #[test]
    fn test_from_config() {
        let policy = RetryPolicy::from_config(&RetryConfig {
            max_attempts: 3,
            base_delay_ms: 10,
            jitter_ms: 0,
        });
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.delay(2, 0.9), Duration::from_millis(40));
    }
}
