//! Quality tiers offered to the adaptive-bitrate selector.

use serde::{Deserialize, Serialize};

/// Audio quality tier, ordered from lowest to highest.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    /// Low quality (~64 kbps).
    Low,
    /// Medium quality (~128 kbps).
    #[default]
    Medium,
    /// High quality (~256 kbps).
    High,
    /// Premium quality (320 kbps).
    Premium,
}

impl QualityTier {
    /// Every tier, lowest first.
    pub const ALL: [Self; 4] = [Self::Low, Self::Medium, Self::High, Self::Premium];

    /// Nearest tier for an encoded bitrate.
    pub const fn from_bitrate(kbps: u32) -> Self {
        match kbps {
            0..=80 => Self::Low,
            81..=160 => Self::Medium,
            161..=280 => Self::High,
            _ => Self::Premium,
        }
    }

    /// Nominal encoded bitrate for this tier.
    pub const fn bitrate_kbps(self) -> u32 {
        match self {
            Self::Low => 64,
            Self::Medium => 128,
            Self::High => 256,
            Self::Premium => 320,
        }
    }

    /// Minimum sustained bandwidth (bits/sec) at which this tier is considered
    /// playable. Twice the encoded bitrate leaves room for segment overhead.
    pub const fn min_bandwidth_bps(self) -> u64 {
        self.bitrate_kbps() as u64 * 1000 * 2
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Premium => "premium",
        }
    }
}

impl std::fmt::Display for QualityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_ordering() {
        assert!(QualityTier::Low < QualityTier::Medium);
        assert!(QualityTier::High < QualityTier::Premium);
        assert_eq!(QualityTier::ALL.iter().max(), Some(&QualityTier::Premium));
    }

    #[test]
    fn test_from_bitrate() {
        assert_eq!(QualityTier::from_bitrate(48), QualityTier::Low);
        assert_eq!(QualityTier::from_bitrate(128), QualityTier::Medium);
        assert_eq!(QualityTier::from_bitrate(256), QualityTier::High);
        assert_eq!(QualityTier::from_bitrate(320), QualityTier::Premium);
    }

    #[test]
    fn test_thresholds_increase() {
        let thresholds: Vec<_> = QualityTier::ALL
            .iter()
            .map(|t| t.min_bandwidth_bps())
            .collect();
        assert!(thresholds.windows(2).all(|w| w[0] < w[1]));
    }
}
