//! Adaptive-bitrate quality selection.
//!
//! The selector only advises: its recommendation is forwarded to the adaptive
//! client as a next-segment hint and the current tier changes only when the
//! client reports a level switch.

use std::collections::VecDeque;

use airwave_core::config::AbrConfig;
use airwave_core::QualityTier;
use serde::Serialize;
use tracing::debug;

/// Rolling mean over the most recent bandwidth samples.
#[derive(Debug, Clone)]
pub struct BandwidthEstimator {
    samples: VecDeque<u64>,
    capacity: usize,
}

impl BandwidthEstimator {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Add a sample, evicting the oldest when full.
    pub fn push(&mut self, bandwidth_bps: u64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(bandwidth_bps);
    }

    /// Mean bandwidth in bits/sec, if any sample exists.
    pub fn estimate(&self) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: u128 = self.samples.iter().map(|&s| u128::from(s)).sum();
        Some((sum / self.samples.len() as u128) as u64)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Why a tier changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SwitchReason {
    Upgrade,
    Downgrade,
    Manual,
}

/// One entry in the switch history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierSwitch {
    pub from: QualityTier,
    pub to: QualityTier,
    pub reason: SwitchReason,
    pub estimate_bps: Option<u64>,
}

/// Observable selector state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QualityState {
    pub auto_enabled: bool,
    pub current_tier: QualityTier,
    pub recommended_tier: QualityTier,
    pub is_upgrading: bool,
    pub is_downgrading: bool,
    pub estimate_bps: Option<u64>,
    pub available: Vec<QualityTier>,
    pub switch_history: Vec<TierSwitch>,
}

/// Maps a bandwidth estimate onto the tier ladder with hysteresis.
#[derive(Debug, Clone)]
pub struct QualitySelector {
    config: AbrConfig,
    estimator: BandwidthEstimator,
    available: Vec<QualityTier>,
    ceiling: Option<QualityTier>,
    auto_enabled: bool,
    current: QualityTier,
    recommended: QualityTier,
    history: VecDeque<TierSwitch>,
}

impl QualitySelector {
    pub fn new(config: AbrConfig) -> Self {
        Self {
            estimator: BandwidthEstimator::new(config.sample_window),
            history: VecDeque::with_capacity(config.switch_history),
            auto_enabled: config.auto,
            config,
            available: QualityTier::ALL.to_vec(),
            ceiling: None,
            current: QualityTier::default(),
            recommended: QualityTier::default(),
        }
    }

    pub const fn recommended(&self) -> QualityTier {
        self.recommended
    }

    pub const fn current(&self) -> QualityTier {
        self.current
    }

    pub const fn is_auto(&self) -> bool {
        self.auto_enabled
    }

    /// Feed a bandwidth sample. Returns the new recommendation if it changed.
    pub fn record_bandwidth(&mut self, bandwidth_bps: u64) -> Option<QualityTier> {
        self.estimator.push(bandwidth_bps);
        if !self.auto_enabled {
            return None;
        }
        let next = self.evaluate();
        self.recommend(next)
    }

    /// The adaptive client switched levels.
    pub fn on_level_switched(&mut self, tier: QualityTier) {
        if tier == self.current {
            return;
        }
        let reason = if !self.auto_enabled {
            SwitchReason::Manual
        } else if tier > self.current {
            SwitchReason::Upgrade
        } else {
            SwitchReason::Downgrade
        };
        debug!("Quality switched {} -> {tier} ({reason:?})", self.current);
        if self.history.len() == self.config.switch_history {
            self.history.pop_front();
        }
        self.history.push_back(TierSwitch {
            from: self.current,
            to: tier,
            reason,
            estimate_bps: self.estimator.estimate(),
        });
        self.current = tier;
    }

    /// Toggle automatic selection. Re-enabling re-evaluates immediately.
    pub fn set_auto(&mut self, enabled: bool) -> Option<QualityTier> {
        self.auto_enabled = enabled;
        if enabled {
            let next = self.evaluate();
            self.recommend(next)
        } else {
            None
        }
    }

    /// Pin a tier and disable automatic selection.
    pub fn force_tier(&mut self, tier: QualityTier) -> QualityTier {
        self.auto_enabled = false;
        let tier = self.clamp(tier);
        self.recommended = tier;
        tier
    }

    /// Restrict the ladder to the tiers the manifest offers.
    pub fn on_manifest_parsed(&mut self, tiers: &[QualityTier]) -> Option<QualityTier> {
        let mut offered: Vec<QualityTier> = tiers.to_vec();
        offered.sort_unstable();
        offered.dedup();
        if offered.is_empty() {
            offered = QualityTier::ALL.to_vec();
        }
        self.available = offered;

        let clamped = self.clamp(self.recommended);
        if self.auto_enabled {
            let next = self.evaluate();
            self.recommend(next)
        } else {
            self.recommend(clamped)
        }
    }

    /// New track: honor its catalog ceiling and reopen the full ladder.
    /// Bandwidth samples describe the network, so they are kept.
    pub fn reset_for_track(&mut self, max_quality: Option<QualityTier>) {
        self.ceiling = max_quality;
        self.available = QualityTier::ALL.to_vec();
        self.recommended = self.clamp(self.recommended);
    }

    pub fn state(&self) -> QualityState {
        QualityState {
            auto_enabled: self.auto_enabled,
            current_tier: self.current,
            recommended_tier: self.recommended,
            is_upgrading: self.recommended > self.current,
            is_downgrading: self.recommended < self.current,
            estimate_bps: self.estimator.estimate(),
            available: self.allowed().collect(),
            switch_history: self.history.iter().cloned().collect(),
        }
    }

    fn recommend(&mut self, tier: QualityTier) -> Option<QualityTier> {
        if tier == self.recommended {
            return None;
        }
        debug!("Recommending {tier} (was {})", self.recommended);
        self.recommended = tier;
        Some(tier)
    }

    fn allowed(&self) -> impl Iterator<Item = QualityTier> + '_ {
        self.available
            .iter()
            .copied()
            .filter(|t| self.ceiling.map_or(true, |max| *t <= max))
    }

    fn lowest(&self) -> QualityTier {
        self.allowed()
            .next()
            .or_else(|| self.available.first().copied())
            .unwrap_or(QualityTier::Low)
    }

    fn clamp(&self, tier: QualityTier) -> QualityTier {
        self.allowed()
            .filter(|t| *t <= tier)
            .last()
            .unwrap_or_else(|| self.lowest())
    }

    fn highest_within(&self, bandwidth_bps: f64) -> Option<QualityTier> {
        self.allowed()
            .filter(|t| t.min_bandwidth_bps() as f64 <= bandwidth_bps)
            .last()
    }

    /// Upgrades trust only `up_factor` of the estimate; a tier is kept while
    /// `down_factor` of the estimate still covers its threshold.
    fn evaluate(&self) -> QualityTier {
        let Some(estimate) = self.estimator.estimate() else {
            return self.clamp(self.recommended);
        };
        let estimate = estimate as f64;
        let reference = self.clamp(self.current);

        let up_bw = estimate * self.config.up_factor;
        if let Some(best) = self.highest_within(up_bw) {
            if best > reference {
                return best;
            }
        }

        let down_bw = estimate * self.config.down_factor;
        if reference.min_bandwidth_bps() as f64 > down_bw {
            return self.highest_within(down_bw).unwrap_or_else(|| self.lowest());
        }
        reference
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selector() -> QualitySelector {
        QualitySelector::new(AbrConfig::default())
    }

    fn feed(selector: &mut QualitySelector, bps: u64, times: usize) -> Option<QualityTier> {
        let mut last = None;
        for _ in 0..times {
            if let Some(tier) = selector.record_bandwidth(bps) {
                last = Some(tier);
            }
        }
        last
    }

    #[test]
    fn test_estimator_ring_evicts_oldest() {
        let mut estimator = BandwidthEstimator::new(3);
        for bps in [100, 200, 300, 400] {
            estimator.push(bps);
        }
        assert_eq!(estimator.len(), 3);
        assert_eq!(estimator.estimate(), Some(300));
    }

    #[test]
    fn test_upgrade_needs_headroom() {
        let mut selector = selector();
        // High needs 512 kbps; half of 900 kbps is not enough.
        assert_eq!(feed(&mut selector, 900_000, 5), None);
        assert_eq!(selector.recommended(), QualityTier::Medium);

        // Half of 1.3 Mbps clears Premium's 640 kbps threshold.
        assert_eq!(feed(&mut selector, 1_300_000, 5), Some(QualityTier::Premium));
        assert!(selector.state().is_upgrading);
    }

    #[test]
    fn test_hysteresis_holds_tier_inside_band() {
        let mut selector = selector();
        feed(&mut selector, 1_300_000, 5);
        selector.on_level_switched(QualityTier::Premium);

        // 0.8 x 850 kbps = 680 kbps still covers Premium.
        assert_eq!(feed(&mut selector, 850_000, 5), None);
        assert_eq!(selector.recommended(), QualityTier::Premium);

        // 0.8 x 400 kbps = 320 kbps only covers Medium.
        assert_eq!(feed(&mut selector, 400_000, 5), Some(QualityTier::Medium));
        assert!(selector.state().is_downgrading);
    }

    #[test]
    fn test_manual_mode_ignores_bandwidth() {
        let mut selector = selector();
        assert_eq!(selector.force_tier(QualityTier::Low), QualityTier::Low);
        assert_eq!(feed(&mut selector, 5_000_000, 5), None);
        assert_eq!(selector.recommended(), QualityTier::Low);

        assert_eq!(selector.set_auto(true), Some(QualityTier::Premium));
    }

    #[test]
    fn test_manifest_restricts_ladder() {
        let mut selector = selector();
        selector.on_manifest_parsed(&[QualityTier::Low, QualityTier::High]);
        feed(&mut selector, 10_000_000, 5);
        assert_eq!(selector.recommended(), QualityTier::High);
        assert_eq!(
            selector.state().available,
            vec![QualityTier::Low, QualityTier::High]
        );
    }

    #[test]
    fn test_track_ceiling() {
        let mut selector = selector();
        selector.reset_for_track(Some(QualityTier::Medium));
        feed(&mut selector, 10_000_000, 5);
        assert_eq!(selector.recommended(), QualityTier::Medium);
    }

    #[test]
    fn test_switch_history_bounded() {
        let mut selector = QualitySelector::new(AbrConfig {
            switch_history: 2,
            ..AbrConfig::default()
        });
        for tier in [QualityTier::High, QualityTier::Low, QualityTier::Premium] {
            selector.on_level_switched(tier);
        }
        let history = selector.state().switch_history;
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].to, QualityTier::Premium);
        assert_eq!(history[1].reason, SwitchReason::Upgrade);
    }
}
