//! Common value types shared across the engine.

use serde::{Deserialize, Serialize};

/// Volume level (0.0 to 1.0).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, PartialOrd)]
pub struct Volume(f32);

impl Volume {
    pub const MUTED: Self = Self(0.0);
    pub const MAX: Self = Self(1.0);
    /// Slightly below max for headroom.
    pub const DEFAULT: Self = Self(0.85);

    /// Create a volume, clamping into range. NaN maps to muted.
    pub fn new(value: f32) -> Self {
        if value.is_nan() {
            return Self::MUTED;
        }
        Self(value.clamp(0.0, 1.0))
    }

    pub const fn as_f32(&self) -> f32 {
        self.0
    }

    pub fn scaled(&self, gain: f32) -> Self {
        Self::new(self.0 * gain)
    }
}

impl Default for Volume {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// How the engine hands playback from one track to the next.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum CrossfadeMode {
    /// Both tracks play at once while their volumes cross.
    #[default]
    Overlap,
    /// The outgoing track fades out completely before the next fades in.
    Sequential,
    /// Immediate cut, guarded only by the click-suppression fades.
    None,
}

impl CrossfadeMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Overlap => "overlap",
            Self::Sequential => "sequential",
            Self::None => "none",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::float_cmp)]
    fn test_volume_clamping() {
        assert_eq!(Volume::new(1.5).as_f32(), 1.0);
        assert_eq!(Volume::new(-0.5).as_f32(), 0.0);
        assert_eq!(Volume::new(0.5).as_f32(), 0.5);
        assert_eq!(Volume::new(f32::NAN).as_f32(), 0.0);
    }

    #[test]
    #[allow(clippy::float_cmp)]
    fn test_volume_scaled() {
        assert_eq!(Volume::new(0.8).scaled(0.5).as_f32(), 0.4);
        assert_eq!(Volume::MAX.scaled(2.0), Volume::MAX);
    }

    proptest::proptest! {
        #[test]
        fn prop_volume_stays_in_range(value in proptest::num::f32::ANY, gain in proptest::num::f32::ANY) {
            let volume = Volume::new(value);
            proptest::prop_assert!((0.0..=1.0).contains(&volume.as_f32()));
            let scaled = volume.scaled(gain).as_f32();
            proptest::prop_assert!((0.0..=1.0).contains(&scaled));
        }
    }
}
