//! Exponential backoff with jitter, guarded by a circuit breaker.
//!
//! [`RetryController`] is a plain state machine: callers ask it for a
//! [`RetrySequence`], report each attempt's outcome, and receive a
//! [`RetryDecision`]. [`execute`] drives that loop on tokio timers.

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use airwave_core::config::{BreakerConfig, RetryConfig};
use airwave_core::{Error, ErrorCategory, Result, TimeoutStage};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Retry records kept for diagnostics.
const HISTORY_LEN: usize = 32;

/// Backoff delay before retry `attempt` (0-indexed), without jitter.
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let base = config.base_delay();
    let max = config.max_delay();
    2u32.checked_pow(attempt)
        .and_then(|factor| base.checked_mul(factor))
        .map_or(max, |delay| delay.min(max))
}

/// Apply symmetric jitter to `delay`. `sample` is uniform in `[0, 1)`.
pub fn apply_jitter(delay: Duration, jitter_factor: f64, sample: f64) -> Duration {
    let secs = delay.as_secs_f64();
    let jitter = secs * jitter_factor * (sample - 0.5);
    Duration::from_secs_f64((secs + jitter).max(0.0))
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

/// Consecutive-failure breaker shared by every load in a session.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl CircuitBreaker {
    pub const fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_in_flight: false,
        }
    }

    pub const fn state(&self) -> BreakerState {
        self.state
    }

    pub const fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Admit or reject a new attempt. `Ok(true)` means the caller holds the
    /// half-open trial and must settle it with a recorded outcome or
    /// [`release_trial`](Self::release_trial).
    pub fn check(&mut self, now: Instant) -> Result<bool> {
        match self.state {
            BreakerState::Closed => Ok(false),
            BreakerState::Open => {
                let opened_at = self.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened_at);
                let reset = self.config.reset_timeout();
                if elapsed >= reset {
                    info!("Circuit breaker half-open, allowing one trial load");
                    self.state = BreakerState::HalfOpen;
                    self.trial_in_flight = true;
                    Ok(true)
                } else {
                    Err(Error::CircuitOpen {
                        retry_after: reset - elapsed,
                    })
                }
            }
            BreakerState::HalfOpen => {
                if self.trial_in_flight {
                    Err(Error::CircuitOpen {
                        retry_after: Duration::ZERO,
                    })
                } else {
                    self.trial_in_flight = true;
                    Ok(true)
                }
            }
        }
    }

    pub const fn trial_in_flight(&self) -> bool {
        self.trial_in_flight
    }

    /// Give back a trial that ended without a verdict, e.g. superseded or
    /// failed for a reason unrelated to the network. Stays half-open.
    pub fn release_trial(&mut self) {
        if self.state == BreakerState::HalfOpen && self.trial_in_flight {
            debug!("Half-open trial released without a verdict");
            self.trial_in_flight = false;
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.trial_in_flight = false;
        if self.state == BreakerState::HalfOpen {
            info!("Circuit breaker closed after successful trial");
            self.state = BreakerState::Closed;
            self.opened_at = None;
        }
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.consecutive_failures += 1;
        self.trial_in_flight = false;
        match self.state {
            BreakerState::HalfOpen => {
                warn!("Trial load failed, circuit breaker reopened");
                self.open(now);
            }
            BreakerState::Closed if self.consecutive_failures >= self.config.failure_threshold => {
                warn!(
                    "Circuit breaker opened after {} consecutive failures",
                    self.consecutive_failures
                );
                self.open(now);
            }
            _ => {}
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = BreakerState::Open;
        self.opened_at = Some(now);
    }
}

/// One logged retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryRecord {
    /// 1-based attempt that failed.
    pub attempt: u32,
    pub delay_ms: u64,
    pub category: ErrorCategory,
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp(Error),
}

/// Budget granted for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptBudget {
    pub timeout: Duration,
    /// Which limit the timeout comes from.
    pub stage: TimeoutStage,
}

/// Progress of one retried operation.
#[derive(Debug, Clone)]
pub struct RetrySequence {
    started: Instant,
    attempts: u32,
    /// Holds the breaker's half-open trial.
    trial: bool,
}

impl RetrySequence {
    /// Attempts started so far.
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Backoff scheduler and circuit breaker.
pub struct RetryController {
    config: RetryConfig,
    breaker: CircuitBreaker,
    rng: StdRng,
    history: VecDeque<RetryRecord>,
    total_retries: u64,
}

impl RetryController {
    pub fn new(config: RetryConfig, breaker: BreakerConfig) -> Self {
        Self::with_rng(config, breaker, StdRng::from_entropy())
    }

    /// Deterministic jitter for tests and reproducible runs.
    pub fn with_seed(config: RetryConfig, breaker: BreakerConfig, seed: u64) -> Self {
        Self::with_rng(config, breaker, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: RetryConfig, breaker: BreakerConfig, rng: StdRng) -> Self {
        Self {
            config,
            breaker: CircuitBreaker::new(breaker),
            rng,
            history: VecDeque::with_capacity(HISTORY_LEN),
            total_retries: 0,
        }
    }

    pub const fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Swap the policy, e.g. after a network class change.
    pub fn set_config(&mut self, config: RetryConfig) {
        self.config = config;
    }

    pub const fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn history(&self) -> impl Iterator<Item = &RetryRecord> {
        self.history.iter()
    }

    pub const fn total_retries(&self) -> u64 {
        self.total_retries
    }

    /// Start a sequence. Rejected while the breaker is open.
    pub fn begin(&mut self, now: Instant) -> Result<RetrySequence> {
        let trial = self.breaker.check(now)?;
        Ok(RetrySequence {
            started: now,
            attempts: 0,
            trial,
        })
    }

    /// Account for the next attempt and return its time budget.
    pub fn before_attempt(&mut self, seq: &mut RetrySequence, now: Instant) -> Result<AttemptBudget> {
        if seq.attempts > 0 && !seq.trial {
            seq.trial = self.breaker.check(now)?;
        }
        let overall = self.config.overall_timeout();
        let elapsed = now.saturating_duration_since(seq.started);
        if elapsed >= overall {
            return Err(Error::timeout(TimeoutStage::Sequence, overall));
        }
        seq.attempts += 1;

        let remaining = overall - elapsed;
        let per_attempt = self.config.per_attempt_timeout();
        Ok(if remaining < per_attempt {
            AttemptBudget {
                timeout: remaining,
                stage: TimeoutStage::Sequence,
            }
        } else {
            AttemptBudget {
                timeout: per_attempt,
                stage: TimeoutStage::Attempt,
            }
        })
    }

    pub fn record_success(&mut self, seq: &mut RetrySequence) {
        seq.trial = false;
        self.breaker.record_success();
    }

    /// Settle a sequence that ends without a recorded outcome.
    pub fn finish(&mut self, seq: &mut RetrySequence) {
        if std::mem::take(&mut seq.trial) {
            self.breaker.release_trial();
        }
    }

    /// Decide whether a failed attempt is retried.
    pub fn record_failure(
        &mut self,
        seq: &mut RetrySequence,
        error: Error,
        now: Instant,
    ) -> RetryDecision {
        if error.is_superseded() || !error.is_retryable() {
            debug!("Not retrying {} error: {error}", error.category().as_str());
            self.finish(seq);
            return RetryDecision::GiveUp(error);
        }

        seq.trial = false;
        self.breaker.record_failure(now);

        if seq.attempts >= self.config.max_attempts {
            warn!("Giving up after {} attempts: {error}", seq.attempts);
            return RetryDecision::GiveUp(Error::RetriesExhausted {
                attempts: seq.attempts,
                last: Box::new(error),
            });
        }

        let overall = self.config.overall_timeout();
        let elapsed = now.saturating_duration_since(seq.started);
        let base = backoff_delay(&self.config, seq.attempts - 1);
        let delay = apply_jitter(base, self.config.jitter_factor, self.rng.gen::<f64>());
        if elapsed + delay >= overall {
            warn!("Retry budget of {overall:?} exhausted: {error}");
            return RetryDecision::GiveUp(Error::timeout(TimeoutStage::Sequence, overall));
        }

        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(RetryRecord {
            attempt: seq.attempts,
            delay_ms: delay.as_millis() as u64,
            category: error.category(),
        });
        self.total_retries += 1;

        debug!(
            "Attempt {} failed ({error}), retrying in {delay:?}",
            seq.attempts
        );
        RetryDecision::Retry { delay }
    }
}

/// Sequence in progress. Dropping it, including when the `execute` future
/// is cancelled, returns an unsettled half-open trial to the breaker.
struct ActiveSequence<'a> {
    controller: &'a Mutex<RetryController>,
    seq: RetrySequence,
}

impl Drop for ActiveSequence<'_> {
    fn drop(&mut self) {
        if self.seq.trial {
            self.controller.lock().finish(&mut self.seq);
        }
    }
}

/// Run `attempt` under `controller`'s policy until it succeeds or the
/// controller gives up. Each attempt receives its 1-based index.
pub async fn execute<T, F, Fut>(controller: &Mutex<RetryController>, mut attempt: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let seq = controller.lock().begin(Instant::now())?;
    let mut active = ActiveSequence { controller, seq };
    loop {
        let budget = controller
            .lock()
            .before_attempt(&mut active.seq, Instant::now())?;
        let outcome =
            match tokio::time::timeout(budget.timeout, attempt(active.seq.attempts())).await {
                Ok(outcome) => outcome,
                Err(_) => Err(Error::timeout(budget.stage, budget.timeout)),
            };

        let error = match outcome {
            Ok(value) => {
                controller.lock().record_success(&mut active.seq);
                return Ok(value);
            }
            Err(error) => error,
        };

        let decision = controller
            .lock()
            .record_failure(&mut active.seq, error, Instant::now());
        match decision {
            RetryDecision::Retry { delay } => tokio::time::sleep(delay).await,
            RetryDecision::GiveUp(error) => return Err(error),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_jitter() -> RetryConfig {
        RetryConfig {
            jitter_factor: 0.0,
            ..RetryConfig::default()
        }
    }

    fn breaker(threshold: u32) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: threshold,
            reset_timeout_ms: 30_000,
        }
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let config = RetryConfig::default();
        assert_eq!(backoff_delay(&config, 0), Duration::from_secs(1));
        assert_eq!(backoff_delay(&config, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(&config, 3), Duration::from_secs(8));
        assert_eq!(backoff_delay(&config, 4), Duration::from_secs(16));
        assert_eq!(backoff_delay(&config, 9), Duration::from_secs(16));
        assert_eq!(backoff_delay(&config, 64), Duration::from_secs(16));
    }

    #[test]
    fn test_jitter_floor() {
        assert_eq!(apply_jitter(Duration::ZERO, 1.0, 0.0), Duration::ZERO);
        assert_eq!(
            apply_jitter(Duration::from_secs(2), 0.3, 0.5),
            Duration::from_secs(2)
        );
    }

    proptest! {
        #[test]
        fn prop_backoff_bounds(
            attempt in 0u32..40,
            base_ms in 1u64..5_000,
            extra_ms in 0u64..60_000,
            jitter in 0.0f64..=1.0,
            sample in 0.0f64..1.0,
        ) {
            let config = RetryConfig {
                base_delay_ms: base_ms,
                max_delay_ms: base_ms + extra_ms,
                jitter_factor: jitter,
                ..RetryConfig::default()
            };
            let delay = backoff_delay(&config, attempt);
            let expected = base_ms
                .saturating_mul(2u64.saturating_pow(attempt))
                .min(base_ms + extra_ms);
            prop_assert_eq!(delay, Duration::from_millis(expected));

            let jittered = apply_jitter(delay, jitter, sample).as_secs_f64();
            let secs = delay.as_secs_f64();
            prop_assert!(jittered >= 0.0);
            prop_assert!(jittered <= secs * (1.0 + jitter) + 1e-9);
            prop_assert!(jittered >= secs * (1.0 - jitter) - 1e-9);
        }
    }

    #[test]
    fn test_breaker_opens_at_threshold() {
        let mut breaker = CircuitBreaker::new(breaker(3));
        let now = Instant::now();
        breaker.record_failure(now);
        breaker.record_failure(now);
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_failure(now);
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(matches!(
            breaker.check(now + Duration::from_secs(10)),
            Err(Error::CircuitOpen { retry_after }) if retry_after == Duration::from_secs(20)
        ));
    }

    #[test]
    fn test_breaker_half_open_success_closes() {
        let mut breaker = CircuitBreaker::new(breaker(1));
        let now = Instant::now();
        breaker.record_failure(now);
        let later = now + Duration::from_secs(30);
        assert!(breaker.check(later).unwrap());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        // Only one trial at a time.
        assert!(breaker.check(later).is_err());
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[test]
    fn test_breaker_half_open_failure_reopens_with_fresh_timer() {
        let mut breaker = CircuitBreaker::new(breaker(1));
        let now = Instant::now();
        breaker.record_failure(now);
        let trial = now + Duration::from_secs(31);
        breaker.check(trial).unwrap();
        breaker.record_failure(trial);
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(breaker.check(trial + Duration::from_secs(29)).is_err());
        assert!(breaker.check(trial + Duration::from_secs(30)).is_ok());
    }

    #[test]
    fn test_success_resets_count_without_touching_closed_state() {
        let mut breaker = CircuitBreaker::new(breaker(3));
        let now = Instant::now();
        breaker.record_failure(now);
        breaker.record_failure(now);
        breaker.record_success();
        breaker.record_failure(now);
        breaker.record_failure(now);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_non_retryable_does_not_consume_budget() {
        let mut controller = RetryController::with_seed(no_jitter(), breaker(5), 1);
        let now = Instant::now();
        let mut seq = controller.begin(now).unwrap();
        controller.before_attempt(&mut seq, now).unwrap();
        let decision = controller.record_failure(&mut seq, Error::Decode("bad frame".into()), now);
        assert_eq!(decision, RetryDecision::GiveUp(Error::Decode("bad frame".into())));
        assert_eq!(controller.breaker().consecutive_failures(), 0);
        assert_eq!(controller.history().count(), 0);
    }

    #[test]
    fn test_attempts_never_exceed_max() {
        let config = RetryConfig {
            max_attempts: 3,
            ..no_jitter()
        };
        let mut controller = RetryController::with_seed(config, breaker(100), 1);
        let now = Instant::now();
        let mut seq = controller.begin(now).unwrap();
        let mut decisions = Vec::new();
        loop {
            controller.before_attempt(&mut seq, now).unwrap();
            let decision = controller.record_failure(&mut seq, Error::Network("down".into()), now);
            let done = matches!(decision, RetryDecision::GiveUp(_));
            decisions.push(decision);
            if done {
                break;
            }
        }
        assert_eq!(seq.attempts(), 3);
        assert!(matches!(
            decisions.last(),
            Some(RetryDecision::GiveUp(Error::RetriesExhausted { attempts: 3, .. }))
        ));
    }

    #[test]
    fn test_short_remaining_budget_reports_sequence_stage() {
        let config = RetryConfig {
            overall_timeout_ms: 12_000,
            ..no_jitter()
        };
        let mut controller = RetryController::with_seed(config, breaker(5), 1);
        let now = Instant::now();
        let mut seq = controller.begin(now).unwrap();
        let first = controller.before_attempt(&mut seq, now).unwrap();
        assert_eq!(first.stage, TimeoutStage::Attempt);
        let second = controller
            .before_attempt(&mut seq, now + Duration::from_secs(5))
            .unwrap();
        assert_eq!(second.stage, TimeoutStage::Sequence);
        assert_eq!(second.timeout, Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_retries_until_success() {
        let controller = Mutex::new(RetryController::with_seed(no_jitter(), breaker(5), 7));
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        let value = execute(&controller, |n| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 4 {
                    Err(Error::Network(format!("attempt {n}")))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        // 1s + 2s + 4s of backoff on virtual time.
        assert_eq!(start.elapsed(), Duration::from_secs(7));
        let delays: Vec<u64> = controller.lock().history().map(|r| r.delay_ms).collect();
        assert_eq!(delays, vec![1000, 2000, 4000]);
        assert_eq!(controller.lock().breaker().state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_times_out_hung_attempts() {
        let config = RetryConfig {
            max_attempts: 2,
            per_attempt_timeout_ms: 1000,
            ..no_jitter()
        };
        let controller = Mutex::new(RetryController::with_seed(config, breaker(5), 7));

        let result: Result<()> = execute(&controller, |_| std::future::pending()).await;

        match result.unwrap_err() {
            Error::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 2);
                assert_eq!(
                    *last,
                    Error::timeout(TimeoutStage::Attempt, Duration::from_secs(1))
                );
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_rejects_without_calling_when_open() {
        let controller = Mutex::new(RetryController::with_seed(no_jitter(), breaker(1), 7));
        controller.lock().breaker.record_failure(Instant::now());

        let calls = AtomicU32::new(0);
        let result: Result<()> = execute(&controller, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await;

        assert!(matches!(result, Err(Error::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    /// Breaker at threshold 1, opened now.
    fn opened() -> Mutex<RetryController> {
        let config = RetryConfig {
            max_attempts: 1,
            ..no_jitter()
        };
        let controller = Mutex::new(RetryController::with_seed(config, breaker(1), 7));
        controller.lock().breaker.record_failure(Instant::now());
        controller
    }

    #[tokio::test(start_paused = true)]
    async fn test_trial_without_verdict_is_released() {
        for error in [Error::Superseded, Error::Decode("bad frame".into())] {
            let controller = opened();
            tokio::time::advance(Duration::from_secs(31)).await;

            let result: Result<()> = execute(&controller, |_| {
                let error = error.clone();
                async move { Err(error) }
            })
            .await;
            assert_eq!(result.unwrap_err(), error);

            let breaker = &controller.lock().breaker;
            assert_eq!(breaker.state(), BreakerState::HalfOpen);
            assert!(!breaker.trial_in_flight());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_trial_is_released() {
        let controller = opened();
        tokio::time::advance(Duration::from_secs(31)).await;

        let cancelled = tokio::time::timeout(
            Duration::from_millis(100),
            execute(&controller, |_| std::future::pending::<Result<()>>()),
        )
        .await;
        assert!(cancelled.is_err());
        assert!(!controller.lock().breaker.trial_in_flight());

        let value = execute(&controller, |_| async { Ok(5) }).await.unwrap();
        assert_eq!(value, 5);
        assert_eq!(controller.lock().breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_release_does_not_touch_a_reopened_breaker() {
        let mut breaker = CircuitBreaker::new(breaker(1));
        let now = Instant::now();
        breaker.record_failure(now);
        breaker.release_trial();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(breaker.check(now + Duration::from_secs(1)).is_err());
    }
}
