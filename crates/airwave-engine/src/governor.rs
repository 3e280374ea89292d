//! Platform-aware buffer-ceiling governor.
//!
//! Some runtimes corrupt or reject a stream once too many bytes are retained.
//! The governor estimates retained bytes from buffered time and bitrate, advises
//! the backend to slow or pause prefetch as the estimate approaches the limit,
//! and proactively flushes the buffer by reloading the current source before
//! the runtime fails.

use std::time::Duration;

use airwave_core::config::BufferConfig;
use airwave_core::PlatformCapabilities;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Buffered-ahead time below which playback is at risk.
const LOW_AHEAD_SECS: f64 = 10.0;
const CRITICAL_AHEAD_SECS: f64 = 3.0;
const EMPTY_AHEAD_SECS: f64 = 0.25;

/// Starvation health, from buffered-ahead time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BufferHealth {
    #[default]
    Healthy,
    Low,
    Critical,
    Empty,
}

impl BufferHealth {
    pub fn from_ahead(buffered_ahead: f64) -> Self {
        if buffered_ahead >= LOW_AHEAD_SECS {
            Self::Healthy
        } else if buffered_ahead >= CRITICAL_AHEAD_SECS {
            Self::Low
        } else if buffered_ahead > EMPTY_AHEAD_SECS {
            Self::Critical
        } else {
            Self::Empty
        }
    }
}

/// Fill-ratio band relative to the buffer ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CeilingPressure {
    #[default]
    Normal,
    SlowDown,
    PausePrefetch,
    Flush,
}

impl CeilingPressure {
    /// Prefetch policy forwarded to the backend for this band.
    pub const fn advice(self) -> PrefetchAdvice {
        match self {
            Self::Normal => PrefetchAdvice::Continue,
            Self::SlowDown => PrefetchAdvice::SlowDown,
            Self::PausePrefetch | Self::Flush => PrefetchAdvice::Pause,
        }
    }
}

/// How aggressively the backend may buffer ahead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PrefetchAdvice {
    Continue,
    SlowDown,
    Pause,
}

/// A playback progress observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferSample {
    pub position: f64,
    pub buffered_ahead: f64,
    pub buffered_total: f64,
}

/// What the session should do after an observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GovernorAction {
    /// The pressure band changed.
    Advise(CeilingPressure),
    /// Reload the current source and resume at this position.
    Recover { resume_at: f64 },
}

/// Observable governor state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BufferState {
    pub estimated_buffered_bytes: u64,
    pub limit_bytes: u64,
    pub fill_ratio: f64,
    pub health: BufferHealth,
    pub pressure: CeilingPressure,
    pub recovery_attempts_this_track: u32,
    pub recovery_active: bool,
    pub exhausted: bool,
    pub total_recoveries: u64,
}

/// Tracks buffered bytes against the platform ceiling.
#[derive(Debug, Clone)]
pub struct BufferGovernor {
    config: BufferConfig,
    limit_bytes: u64,
    bitrate_kbps: u32,
    estimated_bytes: u64,
    pressure: CeilingPressure,
    health: BufferHealth,
    recoveries_this_track: u32,
    last_recovery_at: Option<Instant>,
    recovery_active: bool,
    consecutive_failures: u32,
    exhausted_logged: bool,
    total_recoveries: u64,
}

impl BufferGovernor {
    pub fn new(config: BufferConfig, capabilities: &PlatformCapabilities) -> Self {
        let limit_bytes =
            config.limit_for(capabilities.enforces_buffer_ceiling, capabilities.network_class);
        let bitrate_kbps = config.assumed_bitrate_kbps;
        Self {
            config,
            limit_bytes,
            bitrate_kbps,
            estimated_bytes: 0,
            pressure: CeilingPressure::Normal,
            health: BufferHealth::Healthy,
            recoveries_this_track: 0,
            last_recovery_at: None,
            recovery_active: false,
            consecutive_failures: 0,
            exhausted_logged: false,
            total_recoveries: 0,
        }
    }

    /// Recompute the ceiling after a platform or network change.
    pub fn set_capabilities(&mut self, capabilities: &PlatformCapabilities) {
        let limit = self
            .config
            .limit_for(capabilities.enforces_buffer_ceiling, capabilities.network_class);
        if limit != self.limit_bytes {
            info!("Buffer ceiling {} -> {} bytes", self.limit_bytes, limit);
            self.limit_bytes = limit;
        }
    }

    /// The only place the per-track recovery budget is restored.
    pub fn reset_for_track(&mut self, bitrate_kbps: Option<u32>) {
        self.bitrate_kbps = bitrate_kbps.unwrap_or(self.config.assumed_bitrate_kbps);
        self.estimated_bytes = 0;
        self.pressure = CeilingPressure::Normal;
        self.health = BufferHealth::Healthy;
        self.recoveries_this_track = 0;
        self.recovery_active = false;
        self.consecutive_failures = 0;
        self.exhausted_logged = false;
    }

    pub const fn pressure(&self) -> CeilingPressure {
        self.pressure
    }

    pub const fn limit_bytes(&self) -> u64 {
        self.limit_bytes
    }

    pub const fn is_recovering(&self) -> bool {
        self.recovery_active
    }

    /// Prefetching into the other slot adds retained bytes.
    pub fn prefetch_allowed(&self) -> bool {
        self.pressure < CeilingPressure::PausePrefetch
    }

    fn is_exhausted(&self) -> bool {
        self.recoveries_this_track >= self.config.max_recoveries_per_track
    }

    fn fill_ratio(&self) -> f64 {
        if self.limit_bytes == 0 {
            return 0.0;
        }
        self.estimated_bytes as f64 / self.limit_bytes as f64
    }

    fn band(&self, ratio: f64) -> CeilingPressure {
        if ratio > self.config.flush_ratio {
            CeilingPressure::Flush
        } else if ratio >= self.config.pause_prefetch_ratio {
            CeilingPressure::PausePrefetch
        } else if ratio >= self.config.slow_down_ratio {
            CeilingPressure::SlowDown
        } else {
            CeilingPressure::Normal
        }
    }

    /// Fold in a progress sample.
    pub fn observe(&mut self, sample: BufferSample, now: Instant) -> Vec<GovernorAction> {
        let mut actions = Vec::new();
        let bytes_per_sec = f64::from(self.bitrate_kbps) * 1000.0 / 8.0;
        self.estimated_bytes = (sample.buffered_total.max(0.0) * bytes_per_sec) as u64;
        self.health = BufferHealth::from_ahead(sample.buffered_ahead);

        let pressure = self.band(self.fill_ratio());
        if pressure != self.pressure {
            debug!(
                "Buffer pressure {:?} -> {pressure:?} ({} / {} bytes)",
                self.pressure, self.estimated_bytes, self.limit_bytes
            );
            self.pressure = pressure;
            actions.push(GovernorAction::Advise(pressure));
        }

        if pressure == CeilingPressure::Flush {
            if let Some(resume_at) = self.try_start_recovery(sample.position, now) {
                actions.push(GovernorAction::Recover { resume_at });
            }
        }
        actions
    }

    /// The runtime reported the ceiling error itself.
    pub fn on_ceiling_error(&mut self, position: f64, now: Instant) -> Option<f64> {
        warn!("Buffer ceiling error at {position:.1}s");
        self.try_start_recovery(position, now)
    }

    fn try_start_recovery(&mut self, position: f64, now: Instant) -> Option<f64> {
        if self.recovery_active {
            return None;
        }
        if self.is_exhausted() {
            if !self.exhausted_logged {
                warn!(
                    "Buffer recovery budget of {} exhausted for this track, continuing ungoverned",
                    self.config.max_recoveries_per_track
                );
                self.exhausted_logged = true;
            }
            return None;
        }
        if let Some(last) = self.last_recovery_at {
            let since = now.saturating_duration_since(last);
            if since < self.config.min_recovery_interval() {
                debug!("Skipping buffer recovery, last one {since:?} ago");
                return None;
            }
        }

        self.recoveries_this_track += 1;
        self.total_recoveries += 1;
        self.last_recovery_at = Some(now);
        self.recovery_active = true;

        let resume_at = (position - self.config.safety_offset().as_secs_f64()).max(0.0);
        info!(
            "Proactive buffer recovery {}/{} at {resume_at:.1}s",
            self.recoveries_this_track, self.config.max_recoveries_per_track
        );
        Some(resume_at)
    }

    /// The recovery reload reported ready.
    pub fn on_recovery_succeeded(&mut self) {
        self.recovery_active = false;
        self.consecutive_failures = 0;
        self.estimated_bytes = 0;
        self.pressure = CeilingPressure::Normal;
    }

    /// The recovery failed or timed out. Returns true when the failure
    /// should escalate to the stall ladder.
    pub fn on_recovery_failed(&mut self) -> bool {
        self.recovery_active = false;
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.config.failures_before_escalation {
            warn!(
                "{} consecutive buffer recoveries failed, escalating",
                self.consecutive_failures
            );
            self.consecutive_failures = 0;
            true
        } else {
            false
        }
    }

    pub const fn recovery_timeout(&self) -> Duration {
        self.config.recovery_timeout()
    }

    pub fn state(&self) -> BufferState {
        BufferState {
            estimated_buffered_bytes: self.estimated_bytes,
            limit_bytes: self.limit_bytes,
            fill_ratio: self.fill_ratio(),
            health: self.health,
            pressure: self.pressure,
            recovery_attempts_this_track: self.recoveries_this_track,
            recovery_active: self.recovery_active,
            exhausted: self.is_exhausted(),
            total_recoveries: self.total_recoveries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use airwave_core::NetworkClass;
    use proptest::prelude::*;

    const MIB: f64 = 1024.0 * 1024.0;

    /// Seconds of 256 kbps audio that fill `ratio` of a 16 MiB ceiling.
    fn seconds_for(ratio: f64) -> f64 {
        16.0 * MIB * ratio / 32_000.0
    }

    fn governor() -> BufferGovernor {
        BufferGovernor::new(
            BufferConfig::default(),
            &PlatformCapabilities::default().constrained(),
        )
    }

    fn sample(position: f64, ratio: f64) -> BufferSample {
        BufferSample {
            position,
            buffered_ahead: 30.0,
            buffered_total: seconds_for(ratio),
        }
    }

    #[test]
    fn test_limits_follow_platform() {
        let config = BufferConfig::default();
        let broadband = BufferGovernor::new(config.clone(), &PlatformCapabilities::default());
        let cellular = BufferGovernor::new(
            config.clone(),
            &PlatformCapabilities::new(NetworkClass::Cellular),
        );
        let constrained = governor();
        assert_eq!(broadband.limit_bytes(), 64 * 1024 * 1024);
        assert_eq!(cellular.limit_bytes(), 32 * 1024 * 1024);
        assert_eq!(constrained.limit_bytes(), 16 * 1024 * 1024);
    }

    #[test]
    fn test_bands_and_advice() {
        let mut governor = governor();
        let now = Instant::now();
        assert!(governor.observe(sample(10.0, 0.5), now).is_empty());
        assert_eq!(
            governor.observe(sample(11.0, 0.75), now),
            vec![GovernorAction::Advise(CeilingPressure::SlowDown)]
        );
        assert!(governor.prefetch_allowed());
        assert_eq!(
            governor.observe(sample(12.0, 0.9), now),
            vec![GovernorAction::Advise(CeilingPressure::PausePrefetch)]
        );
        assert!(!governor.prefetch_allowed());
        assert_eq!(CeilingPressure::PausePrefetch.advice(), PrefetchAdvice::Pause);
    }

    #[test]
    fn test_flush_triggers_single_recovery_with_safety_offset() {
        let mut governor = governor();
        let now = Instant::now();
        let actions = governor.observe(sample(40.0, 0.97), now);
        assert_eq!(
            actions,
            vec![
                GovernorAction::Advise(CeilingPressure::Flush),
                GovernorAction::Recover { resume_at: 38.5 },
            ]
        );
        // Still above the ceiling while the reload is in flight.
        assert!(governor
            .observe(sample(41.0, 0.98), now + Duration::from_secs(1))
            .is_empty());

        governor.on_recovery_succeeded();
        assert!(!governor.state().recovery_active);
        // Within the minimum interval nothing more happens.
        let actions = governor.observe(sample(42.0, 0.98), now + Duration::from_secs(5));
        assert!(!actions
            .iter()
            .any(|a| matches!(a, GovernorAction::Recover { .. })));
        assert_eq!(governor.state().recovery_attempts_this_track, 1);
    }

    #[test]
    fn test_recovery_cap_then_ungoverned() {
        let mut governor = governor();
        let start = Instant::now();
        for i in 0..3u64 {
            let now = start + Duration::from_secs(31 * i);
            assert!(governor.on_ceiling_error(10.0, now).is_some());
            governor.on_recovery_succeeded();
        }
        assert!(governor
            .on_ceiling_error(10.0, start + Duration::from_secs(200))
            .is_none());
        assert!(governor.state().exhausted);

        governor.reset_for_track(Some(128));
        assert!(!governor.state().exhausted);
        assert_eq!(governor.state().recovery_attempts_this_track, 0);
    }

    #[test]
    fn test_success_does_not_reset_track_budget() {
        let mut governor = governor();
        let now = Instant::now();
        governor.on_ceiling_error(5.0, now);
        governor.on_recovery_succeeded();
        assert_eq!(governor.state().recovery_attempts_this_track, 1);
    }

    #[test]
    fn test_failures_escalate() {
        let mut governor = governor();
        let now = Instant::now();
        governor.on_ceiling_error(5.0, now);
        assert!(!governor.on_recovery_failed());
        governor.on_ceiling_error(5.0, now + Duration::from_secs(30));
        assert!(governor.on_recovery_failed());
    }

    #[test]
    fn test_resume_point_never_negative() {
        let mut governor = governor();
        assert_eq!(governor.on_ceiling_error(0.5, Instant::now()), Some(0.0));
    }

    #[test]
    fn test_health_from_ahead() {
        assert_eq!(BufferHealth::from_ahead(20.0), BufferHealth::Healthy);
        assert_eq!(BufferHealth::from_ahead(5.0), BufferHealth::Low);
        assert_eq!(BufferHealth::from_ahead(1.0), BufferHealth::Critical);
        assert_eq!(BufferHealth::from_ahead(0.0), BufferHealth::Empty);
    }

    proptest! {
        #[test]
        fn prop_recoveries_bounded_and_spaced(
            steps in prop::collection::vec((0u64..20_000, 0.0f64..1.2, any::<bool>()), 1..200)
        ) {
            let mut governor = governor();
            let config = BufferConfig::default();
            let mut now = Instant::now();
            let mut recoveries: Vec<Instant> = Vec::new();

            for (gap_ms, ratio, succeed) in steps {
                now += Duration::from_millis(gap_ms);
                for action in governor.observe(sample(60.0, ratio), now) {
                    if matches!(action, GovernorAction::Recover { .. }) {
                        recoveries.push(now);
                        if succeed {
                            governor.on_recovery_succeeded();
                        } else {
                            governor.on_recovery_failed();
                        }
                    }
                }
            }

            prop_assert!(recoveries.len() as u32 <= config.max_recoveries_per_track);
            for pair in recoveries.windows(2) {
                prop_assert!(pair[1] - pair[0] >= config.min_recovery_interval());
            }
        }
    }
}
