use std::sync::RwLock;
use std::time::Duration;

use tokio::time::Instant;
use tracing::info;

/// How long the upstream must stay quiet after a rate limit before the
/// governor attempts its first recovery step.
const MIN_STABILITY_PERIOD: Duration = Duration::from_secs(15);
/// Minimum spacing between consecutive recovery steps.
const MIN_RECOVERY_INTERVAL: Duration = Duration::from_secs(10);
/// Number of clean chunks required before each recovery step.
const CHUNK_SUCCESSES_PER_STEP: u32 = 2;

/// Adaptive concurrency controller driven by upstream rate-limit responses.
///
/// Workers report every 429 through [`RateGovernor::on_rate_limit`], which
/// halves the allowed concurrency (never below 1). The scheduler reports
/// chunks that completed without observing a rate limit through
/// [`RateGovernor::on_chunk_success`]; after a stability window the governor
/// doubles concurrency back toward the configured ceiling.
///
/// Reads are frequent and cheap; mutations are serialized behind the lock.
pub struct RateGovernor {
    ceiling: usize,
    state: RwLock<GovernorState>,
}

struct GovernorState {
    current: usize,
    limited: bool,
    limit_events: u64,
    successful_chunks: u32,
    last_rate_limit: Option<Instant>,
    last_recovery_step: Option<Instant>,
}

impl RateGovernor {
    pub fn new(ceiling: usize) -> Self {
        let ceiling = ceiling.max(1);
        Self {
            ceiling,
            state: RwLock::new(GovernorState {
                current: ceiling,
                limited: false,
                limit_events: 0,
                successful_chunks: 0,
                last_rate_limit: None,
                last_recovery_step: None,
            }),
        }
    }

    /// The concurrency the scheduler is allowed to use right now.
    pub fn current(&self) -> usize {
        self.state.read().expect("governor lock poisoned").current
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn is_limited(&self) -> bool {
        self.state.read().expect("governor lock poisoned").limited
    }

    /// Monotonically increasing count of rate-limit events.
    ///
    /// The scheduler snapshots this around a chunk to decide whether the
    /// chunk completed without any request hitting a rate limit.
    pub fn limit_events(&self) -> u64 {
        self.state
            .read()
            .expect("governor lock poisoned")
            .limit_events
    }

    /// A worker observed a 429 (or equivalent) response.
    pub fn on_rate_limit(&self) {
        let mut state = self.state.write().expect("governor lock poisoned");

        state.limited = true;
        state.limit_events += 1;
        state.last_rate_limit = Some(Instant::now());
        state.successful_chunks = 0;

        let reduced = (state.current / 2).max(1);
        if reduced != state.current {
            info!(
                from = state.current,
                to = reduced,
                events = state.limit_events,
                "rate limit detected, reducing fetch concurrency"
            );
            state.current = reduced;
        }
    }

    /// A full chunk completed without any request observing a rate limit.
    pub fn on_chunk_success(&self) {
        let mut state = self.state.write().expect("governor lock poisoned");

        if !state.limited {
            return;
        }

        state.successful_chunks += 1;

        let stable = state
            .last_rate_limit
            .is_none_or(|at| at.elapsed() > MIN_STABILITY_PERIOD);
        let spaced = state
            .last_recovery_step
            .is_none_or(|at| at.elapsed() > MIN_RECOVERY_INTERVAL);

        if state.successful_chunks < CHUNK_SUCCESSES_PER_STEP || !stable || !spaced {
            return;
        }

        let raised = (state.current * 2).min(self.ceiling);
        if raised >= self.ceiling {
            state.limited = false;
            info!(
                concurrency = raised,
                "rate limit recovery complete, concurrency restored"
            );
        } else {
            info!(
                from = state.current,
                to = raised,
                "rate limit recovery, increasing fetch concurrency"
            );
        }
        state.current = raised;
        state.successful_chunks = 0;
        state.last_recovery_step = Some(Instant::now());
    }
}
