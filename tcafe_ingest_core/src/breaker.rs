use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

const FAILURE_THRESHOLD: u32 = 10;
const COOL_DOWN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Stops issuing work to a failing downstream for a cool-down window, then
/// probes recovery with a single attempt.
///
/// Owned by the sink task; no locking needed.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_count: u32,
    last_failure: Option<Instant>,
    state: BreakerState,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self {
            failure_count: 0,
            last_failure: None,
            state: BreakerState::Closed,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Whether an attempt is allowed right now. Transitions open → half-open
    /// once the cool-down has elapsed.
    pub fn can_execute(&mut self) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let cooled = self
                    .last_failure
                    .is_none_or(|at| at.elapsed() > COOL_DOWN);
                if cooled {
                    self.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => true,
        }
    }

    pub fn record_success(&mut self) {
        self.failure_count = 0;
        self.state = BreakerState::Closed;
    }

    pub fn record_failure(&mut self) {
        self.failure_count += 1;
        self.last_failure = Some(Instant::now());
        if self.state == BreakerState::HalfOpen || self.failure_count >= FAILURE_THRESHOLD {
            if self.state != BreakerState::Open {
                warn!(
                    failures = self.failure_count,
                    "circuit breaker opened after consecutive failures"
                );
            }
            self.state = BreakerState::Open;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn opens_after_ten_consecutive_failures() {
        let mut breaker = CircuitBreaker::new();

        for _ in 0..9 {
            assert!(breaker.can_execute());
            breaker.record_failure();
        }
        assert_eq!(BreakerState::Closed, breaker.state());

        breaker.record_failure();
        assert_eq!(BreakerState::Open, breaker.state());
        assert!(!breaker.can_execute());
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_attempts_during_cool_down() {
        let mut breaker = CircuitBreaker::new();
        for _ in 0..10 {
            breaker.record_failure();
        }

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!breaker.can_execute());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(breaker.can_execute());
        assert_eq!(BreakerState::HalfOpen, breaker.state());
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_success_closes() {
        let mut breaker = CircuitBreaker::new();
        for _ in 0..10 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(breaker.can_execute());

        breaker.record_success();
        assert_eq!(BreakerState::Closed, breaker.state());
        assert!(breaker.can_execute());
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens() {
        let mut breaker = CircuitBreaker::new();
        for _ in 0..10 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(breaker.can_execute());

        breaker.record_failure();
        assert_eq!(BreakerState::Open, breaker.state());
        assert!(!breaker.can_execute());
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_the_failure_count() {
        let mut breaker = CircuitBreaker::new();
        for _ in 0..9 {
            breaker.record_failure();
        }
        breaker.record_success();
        for _ in 0..9 {
            breaker.record_failure();
        }
        assert_eq!(BreakerState::Closed, breaker.state());
    }
}
