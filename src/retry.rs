//! Bounded retries with exponential backoff.

use std::{fmt::Display, time::Duration};

use futures::Future;

use crate::time;

/// A utility for performing sleeps which progressively get exponentially longer according to
/// `start * e^(i)` where `i` is the iteration, incremented each time
/// [`ExponentialBackoff::sleep()`] is called. The delay is capped at `max`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    start: Duration,
    max: Duration,
    i: usize,
}

/// Error created while using [`ExponentialBackoff`].
#[derive(Debug, thiserror::Error)]
pub enum ExponentialBackoffError {
    /// `start` is not less than `max`.
    #[error(
        "Start sleep duration ({}) is not less than max sleep duration ({})",
        humantime::format_duration(*.start),
        humantime::format_duration(*.max)
    )]
    StartNotLessThanMax {
        /// Specified starting sleep duration.
        start: Duration,
        /// Specified maximum sleep duration.
        max: Duration,
    },
}

impl ExponentialBackoff {
    /// Construct a new [`ExponentialBackoff`].
    pub fn new(start: Duration, max: Duration) -> Result<Self, ExponentialBackoffError> {
        if start >= max {
            return Err(ExponentialBackoffError::StartNotLessThanMax { start, max });
        }
        Ok(Self { start, max, i: 0 })
    }

    /// The duration the next call to [`ExponentialBackoff::sleep()`] will sleep for.
    #[must_use]
    pub fn next_delay(&self) -> Duration {
        let exp_duration =
            Duration::from_secs_f64(self.start.as_secs_f64() * (self.i as f64).exp());
        Duration::min(exp_duration, self.max)
    }

    /// Perform one iteration of sleep.
    pub async fn sleep(&mut self, t: &dyn time::Port) {
        t.async_sleep(self.next_delay()).await;
        self.i += 1;
    }

    /// How many iterations of [`ExponentialBackoff::sleep()`] have been performed.
    #[must_use]
    pub fn iteration(&self) -> usize {
        self.i
    }
}

/// Run `operation` up to `attempts` times (at least once), sleeping with `backoff` between
/// failed attempts. Returns the last error when every attempt fails.
pub async fn retry<F, FUT, T, E>(
    attempts: usize,
    mut backoff: ExponentialBackoff,
    time: &dyn time::Port,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> FUT,
    FUT: Future<Output = Result<T, E>>,
    E: Display,
{
    let attempts = attempts.max(1);
    loop {
        let attempt = backoff.iteration() + 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if attempt < attempts => {
                tracing::warn!(
                    "Attempt {}/{} failed: {}, retrying in {}",
                    attempt,
                    attempts,
                    error,
                    humantime::format_duration(backoff.next_delay())
                );
                backoff.sleep(time).await;
            }
            Err(error) => return Err(error),
        }
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use approx::relative_eq;

    use crate::time;

    use super::{retry, ExponentialBackoff};

    #[tokio::test]
    async fn test_exponential_backoff() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(10), Duration::from_secs(10)).unwrap();
        assert_eq!(0, backoff.iteration());
        let mut t = time::MockPort::new();

        let expected_times: &[f64] = &[
            0.01,
            0.027182818,
            0.073890561,
            0.200855369,
            0.5459815,
            1.484131591,
            4.034287935,
            10.0,
            10.0,
        ];

        for (i, et) in expected_times.iter().copied().enumerate() {
            t.expect_async_sleep()
                .withf(move |d| relative_eq!(d.as_secs_f64(), et, epsilon = 1e-6))
                .times(1)
                .returning(|_| {});
            backoff.sleep(&t).await;
            assert_eq!(i + 1, backoff.iteration());
            t.checkpoint();
        }
    }

    #[test]
    fn test_start_not_less_than_max() {
        assert!(ExponentialBackoff::new(Duration::from_secs(5), Duration::from_secs(5)).is_err());
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let mut t = time::MockPort::new();
        t.expect_async_sleep().times(2).returning(|_| {});
        let calls = AtomicUsize::new(0);
        let calls_ref = &calls;

        let result: Result<usize, String> = retry(
            5,
            ExponentialBackoff::new(Duration::from_millis(10), Duration::from_secs(1)).unwrap(),
            &t,
            move || async move {
                let call = calls_ref.fetch_add(1, Ordering::SeqCst) + 1;
                if call < 3 {
                    Err(format!("call {} failed", call))
                } else {
                    Ok(call)
                }
            },
        )
        .await;

        assert_eq!(Ok(3), result);
    }

    #[tokio::test]
    async fn test_retry_gives_up() {
        let mut t = time::MockPort::new();
        t.expect_async_sleep().times(2).returning(|_| {});
        let calls = AtomicUsize::new(0);
        let calls_ref = &calls;

        let result: Result<(), String> = retry(
            3,
            ExponentialBackoff::new(Duration::from_millis(10), Duration::from_secs(1)).unwrap(),
            &t,
            move || async move {
                calls_ref.fetch_add(1, Ordering::SeqCst);
                Err("unavailable".to_string())
            },
        )
        .await;

        assert_eq!(Err("unavailable".to_string()), result);
        assert_eq!(3, calls.load(Ordering::SeqCst));
    }
}
