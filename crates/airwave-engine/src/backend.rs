//! Ports to the collaborators the engine drives but does not implement.
//!
//! The media backend is a command sink mirroring an engine command channel:
//! the session pushes [`MediaCommand`]s addressed to a slot, and the host feeds
//! the backend's signals back through `PlaybackSession::handle_media_event`.

use std::fmt;
use std::time::Duration;

use airwave_core::{Error, QualityTier, ResolvedSource, Result, SourceVariant};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::governor::PrefetchAdvice;
use crate::transition::SlotId;

/// Identity of a single load or recovery attempt.
///
/// Load-phase signals echo it back so a late signal for an abandoned attempt
/// can never resolve a newer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttemptId(pub(crate) u64);

impl AttemptId {
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Everything the backend needs to (re)acquire a source into a slot.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadRequest {
    pub attempt: AttemptId,
    pub source: ResolvedSource,
    /// Position to resume from, in seconds.
    pub start_at: f64,
    /// Buffered audio required before reporting ready.
    pub min_playable: Duration,
}

/// Commands sent to the media backend, addressed to one slot.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaCommand {
    /// Acquire a source into an idle slot.
    Load(LoadRequest),
    /// Re-acquire the slot's source at a position, releasing retained buffer.
    Reload(LoadRequest),
    /// Clear the slot completely and assign the source again.
    Reassign(LoadRequest),
    Play,
    Pause,
    /// Seek to a position in seconds.
    Seek(f64),
    /// Set the slot gain (0.0 to 1.0).
    SetVolume(f32),
    /// Stop and free the slot's resources.
    Release,
    /// Ask the adaptive client to restart its segment loader.
    RestartLoader,
    /// Advise the adaptive client's next-segment quality choice.
    AdviseQuality(QualityTier),
    /// How aggressively the backend may keep buffering ahead.
    SetBufferPolicy(PrefetchAdvice),
}

impl MediaCommand {
    /// Attempt identity carried by load-phase commands.
    pub const fn attempt(&self) -> Option<AttemptId> {
        match self {
            Self::Load(req) | Self::Reload(req) | Self::Reassign(req) => Some(req.attempt),
            _ => None,
        }
    }
}

/// Signals reported by the media backend for one slot.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    /// The attempt buffered enough to start playing.
    Ready {
        attempt: AttemptId,
        duration: Option<f64>,
    },
    /// The attempt failed.
    LoadFailed { attempt: AttemptId, error: Error },
    /// Periodic playback progress. Buffered values are in seconds.
    TimeUpdate {
        position: f64,
        buffered_ahead: f64,
        buffered_total: f64,
    },
    Playing,
    /// Playback is waiting for data.
    Waiting,
    Ended,
    /// A runtime error after the source was acquired.
    Error(Error),
    /// The adaptive manifest lists these tiers.
    ManifestParsed { tiers: Vec<QualityTier> },
    LevelSwitched(QualityTier),
    FragmentLoaded { bandwidth_bps: u64 },
}

/// Outcome of a load attempt that reached the ready signal.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ReadyInfo {
    pub duration: Option<f64>,
}

/// Sink for slot-addressed media commands.
///
/// Implementations must not call back into the session synchronously.
pub trait MediaBackend: Send + Sync {
    fn send(&self, slot: SlotId, command: MediaCommand) -> Result<()>;
}

/// Turns a catalog id into a playable location.
#[async_trait]
pub trait SourceResolver: Send + Sync {
    /// Resolve `track_id` into a source of the requested variant.
    async fn resolve(&self, track_id: &str, variant: SourceVariant) -> Result<ResolvedSource>;

    /// Whether an adaptive manifest exists for this track.
    async fn has_adaptive_variant(&self, _track_id: &str) -> bool {
        false
    }
}
