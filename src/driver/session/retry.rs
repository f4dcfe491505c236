// Copyright Rouven Bauer
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::result::Result as StdResult;
use std::thread::sleep;
use std::time::{Duration, Instant};

use log::warn;
use rand::Rng;
use thiserror::Error;

use crate::{Neo4jError, Result};

/// Decides whether and when a failed unit of work is tried again.
///
/// See [`ExponentialBackoff`] for the default implementation and
/// [`Driver::run_with_retry()`](crate::driver::Driver::run_with_retry).
pub trait RetryPolicy {
    type Error;

    fn execute<R>(&self, work: impl FnMut() -> Result<R>) -> StdResult<R, Self::Error>;
}

/// Retries [retryable](Neo4jError::is_retryable) errors with exponentially growing,
/// jittered delays until [`ExponentialBackoff::with_max_retry_time()`] has passed.
///
/// Defaults:
///  * initial delay: 1 second
///  * multiplier: 2.0
///  * jitter: 0.2 (each delay is randomly stretched or shrunk by up to 20%)
///  * max retry time: 30 seconds
///
/// # Example
/// ```
/// use std::time::Duration;
///
/// use neo4j_routing::retry::ExponentialBackoff;
///
/// let policy = ExponentialBackoff::new()
///     .with_initial_delay(Duration::from_millis(100))
///     .with_multiplier(1.5)
///     .unwrap()
///     .with_max_retry_time(Duration::from_secs(10));
/// ```
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_retry_time: Duration,
    multiplier: f64,
    jitter: f64,
}

#[derive(Error, Debug)]
pub enum RetryableError {
    #[error("non-retryable error occurred: {0}")]
    Neo4jError(#[from] Neo4jError),
    #[error("{0}")]
    Timeout(#[from] TimeoutError),
}

/// The work kept failing with retryable errors until the max retry time ran out.
#[derive(Error, Debug)]
#[error(
    "timeout occurred while retrying ({} attempts); last error: {}",
    .errors.len(),
    .errors.last().map(ToString::to_string).unwrap_or_default()
)]
pub struct TimeoutError {
    errors: Vec<Neo4jError>,
}

impl TimeoutError {
    /// All errors in the order they occurred.
    pub fn errors(&self) -> &[Neo4jError] {
        &self.errors
    }

    /// The error of the final attempt.
    pub fn last(&self) -> &Neo4jError {
        self.errors
            .last()
            .expect("a timeout is only raised after at least one failed attempt")
    }
}

impl From<TimeoutError> for Vec<Neo4jError> {
    fn from(value: TimeoutError) -> Self {
        value.errors
    }
}

impl ExponentialBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn with_initial_delay(self, initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            ..self
        }
    }

    /// The factor applied to the delay after each failed attempt.
    ///
    /// Must be a finite number `>= 1.0`.
    pub fn with_multiplier(
        self,
        multiplier: f64,
    ) -> StdResult<Self, InvalidBackoffError<ExponentialBackoff>> {
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(InvalidBackoffError {
                builder: self,
                reason: "multiplier must be a finite number >= 1.0",
            });
        }
        Ok(Self { multiplier, ..self })
    }

    /// Must be in the range `[0.0, 1.0)`.
    pub fn with_jitter(
        self,
        jitter: f64,
    ) -> StdResult<Self, InvalidBackoffError<ExponentialBackoff>> {
        if !(0.0..1.0).contains(&jitter) {
            return Err(InvalidBackoffError {
                builder: self,
                reason: "jitter must be in the range [0.0, 1.0)",
            });
        }
        Ok(Self { jitter, ..self })
    }

    #[inline]
    pub fn with_max_retry_time(self, max_retry_time: Duration) -> Self {
        Self {
            max_retry_time,
            ..self
        }
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    pub fn max_retry_time(&self) -> Duration {
        self.max_retry_time
    }

    fn next_sleep(&self, delay: f64, elapsed: Duration, rng: &mut impl Rng) -> Duration {
        let remaining = self.max_retry_time.saturating_sub(elapsed);
        let jittered = delay * (1.0 + rng.gen_range(-self.jitter..=self.jitter));
        if jittered >= remaining.as_secs_f64() {
            remaining
        } else {
            Duration::from_secs_f64(jittered.max(0.0))
        }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_retry_time: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy for &ExponentialBackoff {
    type Error = RetryableError;

    fn execute<R>(&self, mut work: impl FnMut() -> Result<R>) -> StdResult<R, Self::Error> {
        let time_start = Instant::now();
        let mut errors = Vec::new();
        let mut current_delay = self.initial_delay.as_secs_f64();
        let max_delay = self.max_retry_time.as_secs_f64();
        let mut rng = rand::thread_rng();
        loop {
            let err = match work() {
                Err(e) if e.is_retryable() => e,
                res => return res.map_err(Into::into),
            };
            let time_elapsed = time_start.elapsed();
            if time_elapsed >= self.max_retry_time {
                errors.push(err);
                return Err(TimeoutError { errors }.into());
            }
            let delay = self.next_sleep(current_delay, time_elapsed, &mut rng);
            warn!(
                "work failed and will be retried in {:.4} seconds: {}",
                delay.as_secs_f64(),
                err
            );
            errors.push(err);
            sleep(delay);
            current_delay = (current_delay * self.multiplier).min(max_delay);
        }
    }
}

impl RetryPolicy for ExponentialBackoff {
    type Error = <&'static ExponentialBackoff as RetryPolicy>::Error;

    fn execute<R>(&self, work: impl FnMut() -> Result<R>) -> StdResult<R, Self::Error> {
        (&self).execute(work)
    }
}

/// Returned when configuring an [`ExponentialBackoff`] with an out-of-range value.
///
/// Carries the unchanged builder so that configuration can continue.
#[derive(Debug, Error)]
#[error("invalid backoff configuration: {reason}")]
pub struct InvalidBackoffError<Builder> {
    pub builder: Builder,
    reason: &'static str,
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use rstest::*;

    use super::*;

    fn fast_policy() -> ExponentialBackoff {
        ExponentialBackoff::new()
            .with_initial_delay(Duration::from_millis(10))
            .with_jitter(0.0)
            .unwrap()
            .with_max_retry_time(Duration::from_millis(300))
    }

    #[rstest]
    fn test_defaults() {
        let policy = ExponentialBackoff::default();
        assert_eq!(policy.initial_delay(), Duration::from_secs(1));
        assert_eq!(policy.multiplier(), 2.0);
        assert_eq!(policy.jitter(), 0.2);
        assert_eq!(policy.max_retry_time(), Duration::from_secs(30));
    }

    #[rstest]
    #[case(0.5)]
    #[case(-1.0)]
    #[case(f64::NAN)]
    #[case(f64::INFINITY)]
    fn test_invalid_multiplier(#[case] multiplier: f64) {
        let err = fast_policy().with_multiplier(multiplier).unwrap_err();
        assert_eq!(err.builder.multiplier(), 2.0);
    }

    #[rstest]
    #[case(-0.1)]
    #[case(1.0)]
    #[case(f64::NAN)]
    fn test_invalid_jitter(#[case] jitter: f64) {
        let err = ExponentialBackoff::new().with_jitter(jitter).unwrap_err();
        assert_eq!(err.builder.jitter(), 0.2);
    }

    #[rstest]
    fn test_success_is_not_retried() {
        let mut calls = 0;
        let res = fast_policy().execute(|| {
            calls += 1;
            Ok(42)
        });
        assert_eq!(res.unwrap(), 42);
        assert_eq!(calls, 1);
    }

    #[rstest]
    fn test_non_retryable_error_propagates() {
        let mut calls = 0;
        let res: StdResult<(), _> = fast_policy().execute(|| {
            calls += 1;
            Err(Neo4jError::protocol_error("unexpected message"))
        });
        assert!(matches!(
            res,
            Err(RetryableError::Neo4jError(Neo4jError::ProtocolError { .. }))
        ));
        assert_eq!(calls, 1);
    }

    #[rstest]
    fn test_retryable_error_recovers() {
        let mut calls = 0;
        let res = fast_policy().execute(|| {
            calls += 1;
            match calls {
                1 | 2 => Err(Neo4jError::disconnect("connection refused")),
                _ => Ok(calls),
            }
        });
        assert_eq!(res.unwrap(), 3);
    }

    #[rstest]
    fn test_retries_until_max_retry_time() {
        let attempts = RefCell::new(Vec::new());
        let start = Instant::now();
        let res: StdResult<(), _> = fast_policy().execute(|| {
            attempts.borrow_mut().push(Instant::now());
            Err(Neo4jError::session_expired(format!(
                "no writer (attempt {})",
                attempts.borrow().len()
            )))
        });
        let elapsed = start.elapsed();

        let Err(RetryableError::Timeout(timeout)) = res else {
            panic!("expected timeout");
        };
        let attempts = attempts.into_inner();
        assert_eq!(timeout.errors().len(), attempts.len());
        assert!(attempts.len() >= 3);
        assert_eq!(
            timeout.last().to_string(),
            format!("session expired: no writer (attempt {})", attempts.len())
        );

        assert!(elapsed >= Duration::from_millis(300));
        // sleeps are capped to the remaining time
        assert!(elapsed < Duration::from_millis(600));

        // delays grow (10ms, 20ms, 40ms, ...) until capped by the remaining time
        let gaps = attempts
            .windows(2)
            .map(|w| w[1] - w[0])
            .collect::<Vec<_>>();
        assert!(gaps[1] > gaps[0]);
        assert!(gaps[0] >= Duration::from_millis(10));
    }

    #[rstest]
    fn test_timeout_without_sleeping_when_time_is_up() {
        let policy = fast_policy().with_max_retry_time(Duration::ZERO);
        let mut calls = 0;
        let res: StdResult<(), _> = policy.execute(|| {
            calls += 1;
            Err(Neo4jError::disconnect("down"))
        });
        let Err(RetryableError::Timeout(timeout)) = res else {
            panic!("expected timeout");
        };
        assert_eq!(calls, 1);
        assert_eq!(Vec::from(timeout).len(), 1);
    }

    #[rstest]
    fn test_jittered_sleep_stays_in_bounds() {
        let policy = ExponentialBackoff::new();
        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            let delay = policy.next_sleep(1.0, Duration::ZERO, &mut rng);
            assert!(delay >= Duration::from_secs_f64(0.8));
            assert!(delay <= Duration::from_secs_f64(1.2));
        }
        let capped = policy.next_sleep(10.0, Duration::from_secs(29), &mut rng);
        assert_eq!(capped, Duration::from_secs(1));
    }
}
