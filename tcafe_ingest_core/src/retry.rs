use std::{future::Future, time::Duration};

use snafu::IntoError;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{
    error::{FetchError, RetriesExhaustedSnafu},
    governor::RateGovernor,
};

/// Exponential backoff schedule: `initial * 2^attempt`, capped.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Schedule for transient transport and decode failures.
    pub const fn transport() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }

    /// Schedule for upstream 429s. The cap is deliberately short: the
    /// governor has already cut concurrency, so waiting longer only starves
    /// the pipeline.
    pub const fn rate_limit() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            max_attempts: 5,
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

/// Run an upstream operation, retrying per the error classification.
///
/// Rate-limited attempts run on their own budget with the shorter backoff
/// and are reported to the governor; every other retryable failure consumes
/// the transport budget. `EndOfLog` and oversize requests surface
/// immediately, and cancellation interrupts any backoff wait.
pub async fn retry_operation<T, F, Fut>(
    operation: &str,
    governor: Option<&RateGovernor>,
    ct: &CancellationToken,
    mut run: F,
) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let transport = RetryPolicy::transport();
    let rate_limit = RetryPolicy::rate_limit();

    let mut transport_attempts = 0u32;
    let mut rate_limit_attempts = 0u32;

    loop {
        let error = match run().await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if !error.is_retryable() {
            return Err(error);
        }

        let delay = if matches!(error, FetchError::RateLimited { .. }) {
            if let Some(governor) = governor {
                governor.on_rate_limit();
            }
            rate_limit_attempts += 1;
            if rate_limit_attempts >= rate_limit.max_attempts {
                return Err(RetriesExhaustedSnafu {
                    attempts: rate_limit_attempts,
                }
                .into_error(error));
            }
            let delay = rate_limit.delay_for(rate_limit_attempts - 1);
            warn!(
                operation,
                attempt = rate_limit_attempts,
                ?delay,
                "rate limited, backing off"
            );
            delay
        } else {
            transport_attempts += 1;
            if transport_attempts >= transport.max_attempts {
                return Err(RetriesExhaustedSnafu {
                    attempts: transport_attempts,
                }
                .into_error(error));
            }
            let delay = transport.delay_for(transport_attempts - 1);
            warn!(
                operation,
                attempt = transport_attempts,
                error = %error,
                ?delay,
                "operation failed, retrying"
            );
            delay
        };

        tokio::select! {
            _ = ct.cancelled() => return Err(FetchError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    use super::*;

    #[test]
    fn delays_double_and_cap() {
        let policy = RetryPolicy::transport();
        assert_eq!(Duration::from_secs(1), policy.delay_for(0));
        assert_eq!(Duration::from_secs(2), policy.delay_for(1));
        assert_eq!(Duration::from_secs(4), policy.delay_for(2));
        assert_eq!(Duration::from_secs(8), policy.delay_for(3));
        assert_eq!(Duration::from_secs(30), policy.delay_for(5));
        assert_eq!(Duration::from_secs(30), policy.delay_for(63));
    }

    #[test]
    fn rate_limit_delays_cap_at_five_seconds() {
        let policy = RetryPolicy::rate_limit();
        assert_eq!(Duration::from_secs(1), policy.delay_for(0));
        assert_eq!(Duration::from_secs(2), policy.delay_for(1));
        assert_eq!(Duration::from_secs(4), policy.delay_for(2));
        assert_eq!(Duration::from_secs(5), policy.delay_for(3));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let ct = CancellationToken::new();

        let result = retry_operation("test", None, &ct, || {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(FetchError::Transient {
                        message: "boom".to_string(),
                    })
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(Ok(42), result.map_err(|e| e.to_string()));
        assert_eq!(3, calls.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_the_transport_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let ct = CancellationToken::new();

        let result: Result<(), _> = retry_operation("test", None, &ct, || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(FetchError::Transient {
                    message: "boom".to_string(),
                })
            }
        })
        .await;

        assert!(matches!(
            result,
            Err(FetchError::RetriesExhausted { attempts: 5, .. })
        ));
        assert_eq!(5, calls.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limits_report_to_the_governor() {
        let governor = RateGovernor::new(8);
        let calls = Arc::new(AtomicU32::new(0));
        let ct = CancellationToken::new();

        let result = retry_operation("test", Some(&governor), &ct, || {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(FetchError::RateLimited {
                        message: "429".to_string(),
                    })
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(2, governor.limit_events());
        assert_eq!(2, governor.current());
    }

    #[tokio::test(start_paused = true)]
    async fn end_of_log_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let ct = CancellationToken::new();

        let result: Result<(), _> = retry_operation("test", None, &ct, || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(FetchError::EndOfLog)
            }
        })
        .await;

        assert!(matches!(result, Err(FetchError::EndOfLog)));
        assert_eq!(1, calls.load(Ordering::SeqCst));
    }
}
