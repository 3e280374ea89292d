//! Error types for Airwave.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using Airwave's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Airwave.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    // Source acquisition errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Timed out after {after:?} ({stage})")]
    Timeout { stage: TimeoutStage, after: Duration },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Not authorized: {0}")]
    Auth(String),

    #[error("Cross-origin request blocked: {0}")]
    Cors(String),

    #[error("Buffer ceiling reached: {0}")]
    BufferCeiling(String),

    #[error("Unknown media error: {0}")]
    Unknown(String),

    // Engine-level errors
    #[error("Circuit breaker open, retry after {retry_after:?}")]
    CircuitOpen { retry_after: Duration },

    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<Error> },

    #[error("Load superseded by a newer request")]
    Superseded,

    #[error("Track {0} is already loading")]
    LoadInProgress(String),

    #[error("Transition in progress")]
    TransitionInProgress,

    #[error("No track loaded")]
    NoTrackLoaded,

    #[error("Playback stalled at {position:.1}s and recovery is exhausted")]
    PlaybackStalled { position: f64 },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Media backend error: {0}")]
    Backend(String),
}

/// Which timer produced a timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TimeoutStage {
    /// A single load attempt exceeded its budget.
    Attempt,
    /// The whole retry sequence exceeded its budget.
    Sequence,
    /// A governor or stall recovery did not complete in time.
    Recovery,
}

impl std::fmt::Display for TimeoutStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Attempt => "attempt",
            Self::Sequence => "sequence",
            Self::Recovery => "recovery",
        };
        f.write_str(label)
    }
}

/// Coarse error classes reported to collaborators alongside the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCategory {
    Network,
    Timeout,
    Decode,
    Auth,
    Cors,
    BufferCeiling,
    Unknown,
}

impl ErrorCategory {
    /// Retrying can only help transient failures.
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Network | Self::Timeout | Self::Unknown)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::Decode => "decode",
            Self::Auth => "auth",
            Self::Cors => "cors",
            Self::BufferCeiling => "buffer-ceiling",
            Self::Unknown => "unknown",
        }
    }
}

impl Error {
    /// Classify this error into the reporting taxonomy.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Network(_) | Self::CircuitOpen { .. } | Self::PlaybackStalled { .. } => {
                ErrorCategory::Network
            }
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Decode(_) => ErrorCategory::Decode,
            Self::Auth(_) => ErrorCategory::Auth,
            Self::Cors(_) => ErrorCategory::Cors,
            Self::BufferCeiling(_) => ErrorCategory::BufferCeiling,
            Self::RetriesExhausted { last, .. } => last.category(),
            Self::Unknown(_)
            | Self::Superseded
            | Self::LoadInProgress(_)
            | Self::TransitionInProgress
            | Self::NoTrackLoaded
            | Self::InvalidState(_)
            | Self::InvalidConfig(_)
            | Self::Backend(_) => ErrorCategory::Unknown,
        }
    }

    /// Returns true if a load that failed with this error may be retried.
    ///
    /// Engine-level rejections (superseded loads, bad state, bad config) are
    /// never retryable even though they report as `unknown`.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Timeout { .. } | Self::Unknown(_) | Self::CircuitOpen { .. }
        )
    }

    /// Returns true for the rejection produced by a newer load generation.
    pub const fn is_superseded(&self) -> bool {
        matches!(self, Self::Superseded)
    }

    /// Build a timeout error for the given stage.
    pub const fn timeout(stage: TimeoutStage, after: Duration) -> Self {
        Self::Timeout { stage, after }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(Error::Network("test".into()).is_retryable());
        assert!(Error::timeout(TimeoutStage::Attempt, Duration::from_secs(1)).is_retryable());
        assert!(Error::Unknown("test".into()).is_retryable());
        assert!(!Error::Decode("test".into()).is_retryable());
        assert!(!Error::Auth("test".into()).is_retryable());
        assert!(!Error::Cors("test".into()).is_retryable());
        assert!(!Error::Superseded.is_retryable());
    }

    #[test]
    fn test_category_matches_retry_policy() {
        for category in [
            ErrorCategory::Network,
            ErrorCategory::Timeout,
            ErrorCategory::Unknown,
        ] {
            assert!(category.is_retryable());
        }
        for category in [
            ErrorCategory::Decode,
            ErrorCategory::Auth,
            ErrorCategory::Cors,
            ErrorCategory::BufferCeiling,
        ] {
            assert!(!category.is_retryable());
        }
    }

    #[test]
    fn test_exhausted_reports_last_category() {
        let err = Error::RetriesExhausted {
            attempts: 5,
            last: Box::new(Error::timeout(TimeoutStage::Attempt, Duration::from_secs(10))),
        };
        assert_eq!(err.category(), ErrorCategory::Timeout);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = Error::BufferCeiling("tab limit".into());
        assert_eq!(err.to_string(), "Buffer ceiling reached: tab limit");
        assert_eq!(ErrorCategory::BufferCeiling.as_str(), "buffer-ceiling");
    }
}
