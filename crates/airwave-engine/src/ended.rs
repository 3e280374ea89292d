//! Guard against spurious end-of-media signals.
//!
//! Some runtimes report "ended" well short of the declared duration after a
//! buffer hiccup. An end signal outside the tolerance window is answered with a
//! seek back to the last position, a bounded number of times per track. This is
//! platform tuning, so both knobs live in `EndedConfig`.

use airwave_core::config::EndedConfig;
use tracing::{debug, warn};

/// How to treat an end-of-media signal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EndedVerdict {
    Honor,
    /// Seek back to `resume_at` and keep playing.
    Spurious { resume_at: f64 },
}

#[derive(Debug, Clone)]
pub struct EndedGuard {
    config: EndedConfig,
    recoveries: u32,
    total: u64,
}

impl EndedGuard {
    pub const fn new(config: EndedConfig) -> Self {
        Self {
            config,
            recoveries: 0,
            total: 0,
        }
    }

    pub fn reset(&mut self) {
        self.recoveries = 0;
    }

    /// Spurious endings answered over the session's lifetime.
    pub const fn total_recoveries(&self) -> u64 {
        self.total
    }

    pub fn evaluate(&mut self, position: f64, duration: Option<f64>) -> EndedVerdict {
        let Some(duration) = duration.filter(|d| *d > 0.0) else {
            return EndedVerdict::Honor;
        };
        let tolerance = self.config.tolerance_ms as f64 / 1000.0;
        if position >= duration - tolerance {
            return EndedVerdict::Honor;
        }
        if self.recoveries >= self.config.max_recoveries {
            warn!(
                "Ended at {position:.1}s of {duration:.1}s after {} recoveries, honoring",
                self.recoveries
            );
            return EndedVerdict::Honor;
        }
        self.recoveries += 1;
        self.total += 1;
        debug!("Spurious ended at {position:.1}s of {duration:.1}s, resuming");
        EndedVerdict::Spurious {
            resume_at: position,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_near_end_is_honored() {
        let mut guard = EndedGuard::new(EndedConfig::default());
        assert_eq!(guard.evaluate(178.5, Some(180.0)), EndedVerdict::Honor);
        assert_eq!(guard.evaluate(12.0, None), EndedVerdict::Honor);
    }

    #[test]
    fn test_early_end_recovered_a_bounded_number_of_times() {
        let mut guard = EndedGuard::new(EndedConfig::default());
        assert_eq!(
            guard.evaluate(60.0, Some(180.0)),
            EndedVerdict::Spurious { resume_at: 60.0 }
        );
        assert!(matches!(
            guard.evaluate(61.0, Some(180.0)),
            EndedVerdict::Spurious { .. }
        ));
        assert_eq!(guard.evaluate(62.0, Some(180.0)), EndedVerdict::Honor);

        guard.reset();
        assert!(matches!(
            guard.evaluate(62.0, Some(180.0)),
            EndedVerdict::Spurious { .. }
        ));
        assert_eq!(guard.total_recoveries(), 3);
    }
}
