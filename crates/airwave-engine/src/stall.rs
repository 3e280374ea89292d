//! Escalating stall recovery.
//!
//! A stall is a detection window with no playback progress while the session
//! expects to be playing. Each detected stall runs the next rung of the ladder;
//! the rung counter persists across stalls on the same track until a sustained
//! healthy resume or a track change.

use std::collections::VecDeque;

use airwave_core::config::StallConfig;
use airwave_core::NetworkClass;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Minimum forward movement that counts as progress.
const PROGRESS_EPSILON: f64 = 0.01;

/// Executed rungs kept for diagnostics.
const HISTORY_LEN: usize = 32;

/// Recovery strategies, cheapest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StallStrategy {
    /// Nudge forward and play again.
    MicroSeek,
    /// Reload the current source at the current position.
    ReloadSource,
    /// Restart the adaptive client's segment loader.
    RestartLoader,
    /// Clear the source, assign it again and resume slightly behind.
    ReassignSource,
}

const BROADBAND_LADDER: &[StallStrategy] = &[StallStrategy::MicroSeek, StallStrategy::ReloadSource];
const SLOW_LADDER: &[StallStrategy] = &[
    StallStrategy::MicroSeek,
    StallStrategy::ReloadSource,
    StallStrategy::RestartLoader,
    StallStrategy::ReassignSource,
];

/// How a rung turned out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryOutcome {
    Pending,
    Resumed,
    Failed,
}

/// One executed rung.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryAttempt {
    /// 1-based ladder position.
    pub rung: u32,
    pub strategy: StallStrategy,
    pub outcome: RecoveryOutcome,
    pub position: f64,
}

/// What the session should do about a stall.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StallAction {
    Execute {
        strategy: StallStrategy,
        rung: u32,
        position: f64,
    },
    /// Every rung ran; wait before traversing again.
    CoolDown { until: Instant },
    /// Traversal cap reached for this track.
    Exhausted { position: f64 },
}

/// Observable ladder state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StallState {
    pub stalled: bool,
    pub next_rung: u32,
    pub rungs: u32,
    pub traversals: u32,
    pub cooling_down: bool,
    pub exhausted: bool,
    pub history: Vec<RecoveryAttempt>,
}

#[derive(Debug, Clone)]
pub struct StallRecoveryLadder {
    config: StallConfig,
    network: NetworkClass,
    last_progress_at: Option<Instant>,
    last_position: f64,
    next_rung: usize,
    traversals: u32,
    cooldown_until: Option<Instant>,
    healthy_since: Option<Instant>,
    stalled: bool,
    exhausted: bool,
    history: VecDeque<RecoveryAttempt>,
}

impl StallRecoveryLadder {
    pub const fn new(config: StallConfig, network: NetworkClass) -> Self {
        Self {
            config,
            network,
            last_progress_at: None,
            last_position: 0.0,
            next_rung: 0,
            traversals: 0,
            cooldown_until: None,
            healthy_since: None,
            stalled: false,
            exhausted: false,
            history: VecDeque::new(),
        }
    }

    pub fn set_network(&mut self, network: NetworkClass) {
        self.network = network;
    }

    fn ladder(&self) -> &'static [StallStrategy] {
        if self.network.is_slow() {
            SLOW_LADDER
        } else {
            BROADBAND_LADDER
        }
    }

    pub const fn is_stalled(&self) -> bool {
        self.stalled
    }

    pub const fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn reset_for_track(&mut self, now: Instant) {
        self.last_progress_at = Some(now);
        self.last_position = 0.0;
        self.reset_ladder();
        self.traversals = 0;
        self.stalled = false;
        self.exhausted = false;
        self.history.clear();
    }

    fn reset_ladder(&mut self) {
        self.next_rung = 0;
        self.cooldown_until = None;
        self.healthy_since = None;
    }

    /// A seek moves the position without it counting as progress or regress.
    pub fn on_seek(&mut self, position: f64, now: Instant) {
        self.last_position = position;
        self.last_progress_at = Some(now);
    }

    /// Feed a playback position.
    pub fn on_progress(&mut self, position: f64, now: Instant) {
        if position <= self.last_position + PROGRESS_EPSILON {
            return;
        }
        self.last_position = position;
        self.last_progress_at = Some(now);

        if self.stalled {
            info!("Playback resumed at {position:.1}s");
            self.stalled = false;
            self.healthy_since = Some(now);
            if let Some(last) = self.history.back_mut() {
                if last.outcome == RecoveryOutcome::Pending {
                    last.outcome = RecoveryOutcome::Resumed;
                }
            }
        }

        if let Some(since) = self.healthy_since {
            if now.saturating_duration_since(since) >= self.config.healthy_resume() {
                debug!("Healthy resume sustained, ladder reset");
                self.reset_ladder();
            }
        }
    }

    /// The last executed rung failed outright.
    pub fn on_strategy_failed(&mut self) {
        if let Some(last) = self.history.back_mut() {
            if last.outcome == RecoveryOutcome::Pending {
                last.outcome = RecoveryOutcome::Failed;
            }
        }
    }

    /// Periodic check. `should_be_playing` is false while paused, loading or
    /// stopped, which keeps the detection window from accruing.
    pub fn check(&mut self, now: Instant, should_be_playing: bool) -> Option<StallAction> {
        if !should_be_playing {
            self.last_progress_at = Some(now);
            return None;
        }
        if self.exhausted {
            return None;
        }
        if let Some(until) = self.cooldown_until {
            if now < until {
                return None;
            }
            debug!("Stall cool-down over, traversing ladder again");
            self.cooldown_until = None;
            self.next_rung = 0;
        }

        let last = *self.last_progress_at.get_or_insert(now);
        if now.saturating_duration_since(last) < self.config.detection() {
            return None;
        }
        Some(self.advance(now))
    }

    /// Skip the detection window, e.g. when repeated buffer recoveries failed.
    pub fn escalate(&mut self, now: Instant) -> Option<StallAction> {
        if self.exhausted || self.cooldown_until.is_some_and(|until| now < until) {
            return None;
        }
        self.cooldown_until = None;
        Some(self.advance(now))
    }

    fn advance(&mut self, now: Instant) -> StallAction {
        if !self.stalled {
            warn!("Playback stalled at {:.1}s", self.last_position);
        }
        self.stalled = true;
        self.healthy_since = None;
        // Each rung gets a fresh detection window.
        self.last_progress_at = Some(now);

        let ladder = self.ladder();
        if let Some(&strategy) = ladder.get(self.next_rung) {
            self.next_rung += 1;
            let rung = self.next_rung as u32;
            info!("Stall recovery rung {rung}/{}: {strategy:?}", ladder.len());
            if self.history.len() == HISTORY_LEN {
                self.history.pop_front();
            }
            self.history.push_back(RecoveryAttempt {
                rung,
                strategy,
                outcome: RecoveryOutcome::Pending,
                position: self.last_position,
            });
            return StallAction::Execute {
                strategy,
                rung,
                position: self.last_position,
            };
        }

        self.traversals += 1;
        if self.traversals >= self.config.max_traversals_per_track {
            warn!(
                "Stall ladder exhausted after {} traversals at {:.1}s",
                self.traversals, self.last_position
            );
            self.exhausted = true;
            return StallAction::Exhausted {
                position: self.last_position,
            };
        }

        let until = now + self.config.cooldown_for(self.network);
        info!(
            "Stall ladder traversal {} finished, cooling down until next check",
            self.traversals
        );
        self.cooldown_until = Some(until);
        StallAction::CoolDown { until }
    }

    pub fn state(&self, now: Instant) -> StallState {
        StallState {
            stalled: self.stalled,
            next_rung: self.next_rung as u32 + 1,
            rungs: self.ladder().len() as u32,
            traversals: self.traversals,
            cooling_down: self.cooldown_until.is_some_and(|until| now < until),
            exhausted: self.exhausted,
            history: self.history.iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ladder(network: NetworkClass) -> (StallRecoveryLadder, Instant) {
        let now = Instant::now();
        let mut ladder = StallRecoveryLadder::new(StallConfig::default(), network);
        ladder.reset_for_track(now);
        (ladder, now)
    }

    fn strategy(action: Option<StallAction>) -> Option<StallStrategy> {
        match action {
            Some(StallAction::Execute { strategy, .. }) => Some(strategy),
            _ => None,
        }
    }

    #[test]
    fn test_no_stall_while_progressing() {
        let (mut ladder, start) = ladder(NetworkClass::Broadband);
        for i in 1..20u64 {
            let now = start + Duration::from_secs(i);
            ladder.on_progress(i as f64, now);
            assert!(ladder.check(now, true).is_none());
        }
    }

    #[test]
    fn test_paused_time_does_not_count() {
        let (mut ladder, start) = ladder(NetworkClass::Broadband);
        assert!(ladder.check(start + Duration::from_secs(60), false).is_none());
        assert!(ladder.check(start + Duration::from_secs(62), true).is_none());
    }

    #[test]
    fn test_broadband_ladder_order_then_cooldown() {
        let (mut ladder, start) = ladder(NetworkClass::Broadband);
        let at = |s: u64| start + Duration::from_secs(s);

        assert!(ladder.check(at(3), true).is_none());
        assert_eq!(strategy(ladder.check(at(4), true)), Some(StallStrategy::MicroSeek));
        // Next rung waits a full detection window.
        assert!(ladder.check(at(6), true).is_none());
        assert_eq!(strategy(ladder.check(at(8), true)), Some(StallStrategy::ReloadSource));
        assert!(matches!(
            ladder.check(at(12), true),
            Some(StallAction::CoolDown { until }) if until == at(27)
        ));
        assert!(ladder.check(at(20), true).is_none());
        assert_eq!(strategy(ladder.check(at(27), true)), Some(StallStrategy::MicroSeek));
    }

    #[test]
    fn test_slow_network_adds_rungs_and_longer_cooldown() {
        let (mut ladder, start) = ladder(NetworkClass::Slow);
        let strategies: Vec<_> = (1..=4u64)
            .map(|i| strategy(ladder.check(start + Duration::from_secs(4 * i), true)))
            .collect();
        assert_eq!(
            strategies,
            vec![
                Some(StallStrategy::MicroSeek),
                Some(StallStrategy::ReloadSource),
                Some(StallStrategy::RestartLoader),
                Some(StallStrategy::ReassignSource),
            ]
        );
        let cool = ladder.check(start + Duration::from_secs(20), true);
        assert!(matches!(
            cool,
            Some(StallAction::CoolDown { until }) if until == start + Duration::from_secs(50)
        ));
    }

    #[test]
    fn test_traversal_cap() {
        let (mut ladder, start) = ladder(NetworkClass::Broadband);
        let mut now = start;
        let mut exhausted = false;
        for _ in 0..100 {
            now += Duration::from_secs(4);
            if let Some(StallAction::CoolDown { until }) = ladder.check(now, true) {
                now = until - Duration::from_secs(4);
            } else if ladder.is_exhausted() {
                exhausted = true;
                break;
            }
        }
        assert!(exhausted);
        assert_eq!(ladder.state(now).traversals, 3);
        assert!(ladder.check(now + Duration::from_secs(100), true).is_none());
    }

    #[test]
    fn test_counter_persists_until_healthy_resume() {
        let (mut ladder, start) = ladder(NetworkClass::Broadband);
        let at = |s: u64| start + Duration::from_secs(s);

        assert_eq!(strategy(ladder.check(at(4), true)), Some(StallStrategy::MicroSeek));
        // Brief recovery, then a new stall continues up the ladder.
        ladder.on_progress(1.0, at(5));
        assert!(!ladder.is_stalled());
        assert_eq!(strategy(ladder.check(at(9), true)), Some(StallStrategy::ReloadSource));

        // Sustained progress resets the ladder.
        for s in 10..=16u64 {
            ladder.on_progress(s as f64, at(s));
        }
        assert_eq!(strategy(ladder.check(at(21), true)), Some(StallStrategy::MicroSeek));
        assert_eq!(ladder.state(at(21)).history[0].outcome, RecoveryOutcome::Resumed);
    }

    #[test]
    fn test_escalate_skips_detection_window() {
        let (mut ladder, start) = ladder(NetworkClass::Broadband);
        assert_eq!(
            strategy(ladder.escalate(start + Duration::from_millis(10))),
            Some(StallStrategy::MicroSeek)
        );
        ladder.on_strategy_failed();
        assert_eq!(
            ladder.state(start).history[0].outcome,
            RecoveryOutcome::Failed
        );
    }

    #[test]
    fn test_history_is_bounded_across_resumed_stalls() {
        let (mut ladder, start) = ladder(NetworkClass::Broadband);
        let mut now = start;
        let mut position = 0.0;
        for _ in 0..100 {
            now += Duration::from_secs(4);
            assert_eq!(strategy(ladder.check(now, true)), Some(StallStrategy::MicroSeek));
            for _ in 0..10 {
                now += Duration::from_secs(1);
                position += 1.0;
                ladder.on_progress(position, now);
            }
        }
        let state = ladder.state(now);
        assert_eq!(state.history.len(), HISTORY_LEN);
        assert_eq!(state.traversals, 0);
        assert!(state
            .history
            .iter()
            .all(|attempt| attempt.outcome == RecoveryOutcome::Resumed));
    }

    #[test]
    fn test_track_change_resets_everything() {
        let (mut ladder, start) = ladder(NetworkClass::Broadband);
        ladder.check(start + Duration::from_secs(4), true);
        let later = start + Duration::from_secs(5);
        ladder.reset_for_track(later);
        let state = ladder.state(later);
        assert_eq!(state.next_rung, 1);
        assert!(state.history.is_empty());
    }
}
