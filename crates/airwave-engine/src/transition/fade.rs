//! Fade curves and running fades.

use std::time::Duration;

use tokio::time::Instant;

/// Shape of a fade over normalized progress `p` in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FadeCurve {
    Linear,
    /// Half-cosine ease. Rising and falling curves are complementary, so two
    /// fades sharing start and length always sum to the target.
    #[default]
    SineEase,
}

impl FadeCurve {
    /// Eased progress for linear progress `p`.
    pub fn ease(self, p: f64) -> f64 {
        let p = p.clamp(0.0, 1.0);
        match self {
            Self::Linear => p,
            Self::SineEase => 0.5 - 0.5 * (std::f64::consts::PI * p).cos(),
        }
    }
}

/// A gain ramp on one slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fade {
    pub from: f32,
    pub to: f32,
    pub started: Instant,
    pub duration: Duration,
    pub curve: FadeCurve,
}

impl Fade {
    pub const fn new(from: f32, to: f32, started: Instant, duration: Duration, curve: FadeCurve) -> Self {
        Self {
            from,
            to,
            started,
            duration,
            curve,
        }
    }

    pub fn progress(&self, now: Instant) -> f64 {
        if self.duration.is_zero() {
            return 1.0;
        }
        let elapsed = now.saturating_duration_since(self.started);
        (elapsed.as_secs_f64() / self.duration.as_secs_f64()).min(1.0)
    }

    pub fn gain_at(&self, now: Instant) -> f32 {
        let eased = self.curve.ease(self.progress(now));
        let from = f64::from(self.from);
        let to = f64::from(self.to);
        (from + (to - from) * eased) as f32
    }

    pub fn is_complete(&self, now: Instant) -> bool {
        self.progress(now) >= 1.0
    }

    pub fn is_fade_in(&self) -> bool {
        self.to > self.from
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::float_cmp)]
    fn test_endpoints() {
        let start = Instant::now();
        let d = Duration::from_millis(500);
        let fade = Fade::new(0.0, 0.8, start, d, FadeCurve::SineEase);
        assert_eq!(fade.gain_at(start), 0.0);
        assert!((fade.gain_at(start + d) - 0.8).abs() < 1e-6);
        assert!(fade.is_complete(start + d));
        assert!(!fade.is_complete(start + d / 2));
    }

    #[test]
    fn test_sine_ease_is_not_linear() {
        assert!(FadeCurve::SineEase.ease(0.25) < FadeCurve::Linear.ease(0.25));
        assert!((FadeCurve::SineEase.ease(0.5) - 0.5).abs() < 1e-12);
    }

    #[test]
    #[allow(clippy::float_cmp)]
    fn test_zero_duration_jumps() {
        let now = Instant::now();
        let fade = Fade::new(1.0, 0.0, now, Duration::ZERO, FadeCurve::Linear);
        assert_eq!(fade.gain_at(now), 0.0);
    }
}
