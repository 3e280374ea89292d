//! # Engine Configuration
//!
//! The recognized-options record accepted by a playback session. Every field
//! has a serde default, so a partial JSON document (or `{}`) is a valid config.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{CrossfadeMode, NetworkClass};

const MIB: u64 = 1024 * 1024;

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Retry policy on broadband-class networks.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Retry policy on cellular-class networks.
    #[serde(default = "RetryConfig::cellular")]
    pub retry_cellular: RetryConfig,

    #[serde(default)]
    pub breaker: BreakerConfig,

    #[serde(default)]
    pub buffer: BufferConfig,

    #[serde(default)]
    pub abr: AbrConfig,

    #[serde(default)]
    pub stall: StallConfig,

    #[serde(default)]
    pub ended: EndedConfig,

    /// How consecutive tracks are joined.
    ///
    /// Default: overlap.
    #[serde(default)]
    pub crossfade_mode: CrossfadeMode,

    /// Length of the overlap or sequential fade.
    ///
    /// In overlap mode this is also how early the "track ending" signal fires.
    ///
    /// Default: 3000 ms.
    #[serde(default = "default_crossfade_duration_ms")]
    pub crossfade_duration_ms: u64,

    /// Short fade applied to every track start and stop to suppress clicks.
    ///
    /// Default: 120 ms.
    #[serde(default = "default_click_guard_ms")]
    pub click_guard_ms: u64,

    /// Buffered audio the backend must hold before a slot reports ready.
    ///
    /// Default: 2000 ms.
    #[serde(default = "default_min_playable_buffer_ms")]
    pub min_playable_buffer_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            retry_cellular: RetryConfig::cellular(),
            breaker: BreakerConfig::default(),
            buffer: BufferConfig::default(),
            abr: AbrConfig::default(),
            stall: StallConfig::default(),
            ended: EndedConfig::default(),
            crossfade_mode: CrossfadeMode::default(),
            crossfade_duration_ms: default_crossfade_duration_ms(),
            click_guard_ms: default_click_guard_ms(),
            min_playable_buffer_ms: default_min_playable_buffer_ms(),
        }
    }
}

impl EngineConfig {
    /// Parse a JSON document and validate it.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Retry policy for the active network class.
    pub const fn retry_for(&self, network: NetworkClass) -> &RetryConfig {
        if network.is_cellular_class() {
            &self.retry_cellular
        } else {
            &self.retry
        }
    }

    pub const fn crossfade_duration(&self) -> Duration {
        Duration::from_millis(self.crossfade_duration_ms)
    }

    pub const fn click_guard(&self) -> Duration {
        Duration::from_millis(self.click_guard_ms)
    }

    pub const fn min_playable_buffer(&self) -> Duration {
        Duration::from_millis(self.min_playable_buffer_ms)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        self.retry.validate("retry")?;
        self.retry_cellular.validate("retry_cellular")?;
        self.breaker.validate()?;
        self.buffer.validate()?;
        self.abr.validate()?;
        self.stall.validate()?;

        if self.click_guard_ms == 0 {
            return Err(invalid("click_guard_ms must be > 0"));
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> Error {
    Error::InvalidConfig(message.into())
}

// ============================================================================
// Retry
// ============================================================================

/// Backoff and timeout policy for source loads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum load attempts per source candidate, including the first.
    ///
    /// Default: 5.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry; doubles per attempt.
    ///
    /// Default: 1000 ms.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound for a single backoff delay (before jitter).
    ///
    /// Default: 16000 ms.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Budget for one attempt.
    ///
    /// Default: 10 s.
    #[serde(default = "default_per_attempt_timeout_ms")]
    pub per_attempt_timeout_ms: u64,

    /// Budget for the whole sequence including backoff delays.
    ///
    /// Default: 45 s.
    #[serde(default = "default_overall_timeout_ms")]
    pub overall_timeout_ms: u64,

    /// Fraction of the delay used as jitter amplitude (0.0-1.0).
    ///
    /// Default: 0.3.
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            per_attempt_timeout_ms: default_per_attempt_timeout_ms(),
            overall_timeout_ms: default_overall_timeout_ms(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

impl RetryConfig {
    /// Longer budgets for cellular-class links.
    pub fn cellular() -> Self {
        Self {
            base_delay_ms: 1500,
            max_delay_ms: 20_000,
            per_attempt_timeout_ms: 20_000,
            overall_timeout_ms: 90_000,
            ..Self::default()
        }
    }

    pub const fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub const fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub const fn per_attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.per_attempt_timeout_ms)
    }

    pub const fn overall_timeout(&self) -> Duration {
        Duration::from_millis(self.overall_timeout_ms)
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(invalid(format!("{name}.max_attempts must be > 0")));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(invalid(format!(
                "{name}.base_delay_ms cannot exceed max_delay_ms"
            )));
        }
        if self.per_attempt_timeout_ms == 0 || self.overall_timeout_ms == 0 {
            return Err(invalid(format!("{name} timeouts must be > 0")));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(invalid(format!(
                "{name}.jitter_factor must be between 0.0 and 1.0"
            )));
        }
        Ok(())
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures (across all loads) that open the breaker.
    ///
    /// Default: 5.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Time an open breaker waits before allowing one trial load.
    ///
    /// Default: 30 s.
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
        }
    }
}

impl BreakerConfig {
    pub const fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(invalid("breaker.failure_threshold must be > 0"));
        }
        Ok(())
    }
}

// ============================================================================
// Buffer governor
// ============================================================================

/// Buffer-ceiling limits and proactive recovery policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Ceiling on broadband-class networks.
    ///
    /// Default: 64 MiB.
    #[serde(default = "default_broadband_limit")]
    pub broadband_limit_bytes: u64,

    /// Ceiling on cellular-class networks.
    ///
    /// Default: 32 MiB.
    #[serde(default = "default_cellular_limit")]
    pub cellular_limit_bytes: u64,

    /// Ceiling on broadband when the platform enforces a buffer ceiling.
    ///
    /// Default: 16 MiB.
    #[serde(default = "default_constrained_broadband_limit")]
    pub constrained_broadband_limit_bytes: u64,

    /// Ceiling on cellular when the platform enforces a buffer ceiling.
    ///
    /// Default: 8 MiB.
    #[serde(default = "default_constrained_cellular_limit")]
    pub constrained_cellular_limit_bytes: u64,

    /// Bitrate assumed when a track does not declare one.
    ///
    /// Default: 256 kbps.
    #[serde(default = "default_assumed_bitrate_kbps")]
    pub assumed_bitrate_kbps: u32,

    /// Fill ratio above which further prefetch should slow down.
    ///
    /// Default: 0.70.
    #[serde(default = "default_slow_down_ratio")]
    pub slow_down_ratio: f64,

    /// Fill ratio above which prefetch pauses.
    ///
    /// Default: 0.85.
    #[serde(default = "default_pause_prefetch_ratio")]
    pub pause_prefetch_ratio: f64,

    /// Fill ratio above which the current source is flushed by a reload.
    ///
    /// Default: 0.95.
    #[serde(default = "default_flush_ratio")]
    pub flush_ratio: f64,

    /// Minimum gap between two proactive recoveries.
    ///
    /// Default: 30 s.
    #[serde(default = "default_min_recovery_interval_ms")]
    pub min_recovery_interval_ms: u64,

    /// Proactive recoveries allowed per track before governance stops.
    ///
    /// Default: 3.
    #[serde(default = "default_max_recoveries_per_track")]
    pub max_recoveries_per_track: u32,

    /// How far behind the current position a recovery resumes.
    ///
    /// Default: 1500 ms.
    #[serde(default = "default_safety_offset_ms")]
    pub safety_offset_ms: u64,

    /// Time allowed for a recovery reload to report ready.
    ///
    /// Default: 15 s.
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,

    /// Consecutive recovery failures before escalating to the stall ladder.
    ///
    /// Default: 2.
    #[serde(default = "default_failures_before_escalation")]
    pub failures_before_escalation: u32,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            broadband_limit_bytes: default_broadband_limit(),
            cellular_limit_bytes: default_cellular_limit(),
            constrained_broadband_limit_bytes: default_constrained_broadband_limit(),
            constrained_cellular_limit_bytes: default_constrained_cellular_limit(),
            assumed_bitrate_kbps: default_assumed_bitrate_kbps(),
            slow_down_ratio: default_slow_down_ratio(),
            pause_prefetch_ratio: default_pause_prefetch_ratio(),
            flush_ratio: default_flush_ratio(),
            min_recovery_interval_ms: default_min_recovery_interval_ms(),
            max_recoveries_per_track: default_max_recoveries_per_track(),
            safety_offset_ms: default_safety_offset_ms(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
            failures_before_escalation: default_failures_before_escalation(),
        }
    }
}

impl BufferConfig {
    /// Pick the ceiling for a platform/network combination.
    pub const fn limit_for(&self, constrained: bool, network: NetworkClass) -> u64 {
        match (constrained, network.is_cellular_class()) {
            (true, true) => self.constrained_cellular_limit_bytes,
            (true, false) => self.constrained_broadband_limit_bytes,
            (false, true) => self.cellular_limit_bytes,
            (false, false) => self.broadband_limit_bytes,
        }
    }

    pub const fn min_recovery_interval(&self) -> Duration {
        Duration::from_millis(self.min_recovery_interval_ms)
    }

    pub const fn safety_offset(&self) -> Duration {
        Duration::from_millis(self.safety_offset_ms)
    }

    pub const fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        let limits = [
            self.broadband_limit_bytes,
            self.cellular_limit_bytes,
            self.constrained_broadband_limit_bytes,
            self.constrained_cellular_limit_bytes,
        ];
        if limits.contains(&0) {
            return Err(invalid("buffer limits must be > 0"));
        }
        if self.assumed_bitrate_kbps == 0 {
            return Err(invalid("buffer.assumed_bitrate_kbps must be > 0"));
        }
        let ordered = 0.0 < self.slow_down_ratio
            && self.slow_down_ratio < self.pause_prefetch_ratio
            && self.pause_prefetch_ratio < self.flush_ratio
            && self.flush_ratio <= 1.0;
        if !ordered {
            return Err(invalid(
                "buffer ratios must satisfy 0 < slow_down < pause_prefetch < flush <= 1",
            ));
        }
        if self.failures_before_escalation == 0 {
            return Err(invalid("buffer.failures_before_escalation must be > 0"));
        }
        Ok(())
    }
}

// ============================================================================
// ABR
// ============================================================================

/// Adaptive-bitrate selection policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbrConfig {
    /// Start with automatic tier selection enabled.
    ///
    /// Default: true.
    #[serde(default = "default_true")]
    pub auto: bool,

    /// Fraction of estimated bandwidth trusted when upgrading.
    ///
    /// Default: 0.5.
    #[serde(default = "default_up_factor")]
    pub up_factor: f64,

    /// Fraction of estimated bandwidth trusted when deciding to stay or drop.
    ///
    /// Default: 0.8.
    #[serde(default = "default_down_factor")]
    pub down_factor: f64,

    /// Bandwidth samples averaged into the estimate.
    ///
    /// Default: 5.
    #[serde(default = "default_sample_window")]
    pub sample_window: usize,

    /// Tier switches retained for diagnostics.
    ///
    /// Default: 10.
    #[serde(default = "default_switch_history")]
    pub switch_history: usize,
}

impl Default for AbrConfig {
    fn default() -> Self {
        Self {
            auto: true,
            up_factor: default_up_factor(),
            down_factor: default_down_factor(),
            sample_window: default_sample_window(),
            switch_history: default_switch_history(),
        }
    }
}

impl AbrConfig {
    fn validate(&self) -> Result<()> {
        let in_range = |f: f64| f > 0.0 && f <= 1.0;
        if !in_range(self.up_factor) || !in_range(self.down_factor) {
            return Err(invalid("abr factors must be in (0, 1]"));
        }
        if self.up_factor > self.down_factor {
            return Err(invalid("abr.up_factor cannot exceed abr.down_factor"));
        }
        if self.sample_window == 0 || self.switch_history == 0 {
            return Err(invalid("abr windows must be > 0"));
        }
        Ok(())
    }
}

// ============================================================================
// Stall recovery
// ============================================================================

/// Stall detection and recovery ladder policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StallConfig {
    /// Time without progress before playback counts as stalled.
    ///
    /// Default: 4000 ms.
    #[serde(default = "default_detection_ms")]
    pub detection_ms: u64,

    /// Forward nudge used by the first ladder rung.
    ///
    /// Default: 100 ms.
    #[serde(default = "default_micro_seek_ms")]
    pub micro_seek_ms: u64,

    /// How far behind the last position a source reassignment resumes.
    ///
    /// Default: 2000 ms.
    #[serde(default = "default_rewind_ms")]
    pub rewind_ms: u64,

    /// Sustained progress that counts as a healthy resume and resets the ladder.
    ///
    /// Default: 5000 ms.
    #[serde(default = "default_healthy_resume_ms")]
    pub healthy_resume_ms: u64,

    /// Wait after the ladder is exhausted before checking again.
    ///
    /// Default: 15 s.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,

    /// Cool-down on slow networks.
    ///
    /// Default: 30 s.
    #[serde(default = "default_slow_cooldown_ms")]
    pub slow_cooldown_ms: u64,

    /// Full ladder traversals allowed per track.
    ///
    /// Default: 3.
    #[serde(default = "default_max_traversals")]
    pub max_traversals_per_track: u32,
}

impl Default for StallConfig {
    fn default() -> Self {
        Self {
            detection_ms: default_detection_ms(),
            micro_seek_ms: default_micro_seek_ms(),
            rewind_ms: default_rewind_ms(),
            healthy_resume_ms: default_healthy_resume_ms(),
            cooldown_ms: default_cooldown_ms(),
            slow_cooldown_ms: default_slow_cooldown_ms(),
            max_traversals_per_track: default_max_traversals(),
        }
    }
}

impl StallConfig {
    pub const fn detection(&self) -> Duration {
        Duration::from_millis(self.detection_ms)
    }

    pub const fn healthy_resume(&self) -> Duration {
        Duration::from_millis(self.healthy_resume_ms)
    }

    pub const fn cooldown_for(&self, network: NetworkClass) -> Duration {
        if network.is_slow() {
            Duration::from_millis(self.slow_cooldown_ms)
        } else {
            Duration::from_millis(self.cooldown_ms)
        }
    }

    fn validate(&self) -> Result<()> {
        if self.detection_ms == 0 {
            return Err(invalid("stall.detection_ms must be > 0"));
        }
        if self.max_traversals_per_track == 0 {
            return Err(invalid("stall.max_traversals_per_track must be > 0"));
        }
        Ok(())
    }
}

/// Spurious end-of-media handling.
///
/// Some runtimes report "ended" well before the declared duration. Within the
/// tolerance window the signal is honored; outside it the engine seeks back to
/// the last position and resumes, a bounded number of times per track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndedConfig {
    /// Default: 2000 ms.
    #[serde(default = "default_ended_tolerance_ms")]
    pub tolerance_ms: u64,

    /// Default: 2.
    #[serde(default = "default_ended_recoveries")]
    pub max_recoveries: u32,
}

impl Default for EndedConfig {
    fn default() -> Self {
        Self {
            tolerance_ms: default_ended_tolerance_ms(),
            max_recoveries: default_ended_recoveries(),
        }
    }
}

// ============================================================================
// Default Functions (for serde)
// ============================================================================

const fn default_true() -> bool {
    true
}

const fn default_crossfade_duration_ms() -> u64 {
    3000
}

const fn default_click_guard_ms() -> u64 {
    120
}

const fn default_min_playable_buffer_ms() -> u64 {
    2000
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_base_delay_ms() -> u64 {
    1000
}

const fn default_max_delay_ms() -> u64 {
    16_000
}

const fn default_per_attempt_timeout_ms() -> u64 {
    10_000
}

const fn default_overall_timeout_ms() -> u64 {
    45_000
}

const fn default_jitter_factor() -> f64 {
    0.3
}

const fn default_failure_threshold() -> u32 {
    5
}

const fn default_reset_timeout_ms() -> u64 {
    30_000
}

const fn default_broadband_limit() -> u64 {
    64 * MIB
}

const fn default_cellular_limit() -> u64 {
    32 * MIB
}

const fn default_constrained_broadband_limit() -> u64 {
    16 * MIB
}

const fn default_constrained_cellular_limit() -> u64 {
    8 * MIB
}

const fn default_assumed_bitrate_kbps() -> u32 {
    256
}

const fn default_slow_down_ratio() -> f64 {
    0.70
}

const fn default_pause_prefetch_ratio() -> f64 {
    0.85
}

const fn default_flush_ratio() -> f64 {
    0.95
}

const fn default_min_recovery_interval_ms() -> u64 {
    30_000
}

const fn default_max_recoveries_per_track() -> u32 {
    3
}

const fn default_safety_offset_ms() -> u64 {
    1500
}

const fn default_recovery_timeout_ms() -> u64 {
    15_000
}

const fn default_failures_before_escalation() -> u32 {
    2
}

const fn default_up_factor() -> f64 {
    0.5
}

const fn default_down_factor() -> f64 {
    0.8
}

const fn default_sample_window() -> usize {
    5
}

const fn default_switch_history() -> usize {
    10
}

const fn default_detection_ms() -> u64 {
    4000
}

const fn default_micro_seek_ms() -> u64 {
    100
}

const fn default_rewind_ms() -> u64 {
    2000
}

const fn default_healthy_resume_ms() -> u64 {
    5000
}

const fn default_cooldown_ms() -> u64 {
    15_000
}

const fn default_slow_cooldown_ms() -> u64 {
    30_000
}

const fn default_max_traversals() -> u32 {
    3
}

const fn default_ended_tolerance_ms() -> u64 {
    2000
}

const fn default_ended_recoveries() -> u32 {
    2
}
