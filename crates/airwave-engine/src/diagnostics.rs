//! Serializable diagnostics snapshots.

use airwave_core::{CrossfadeMode, NetworkClass};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::abr::QualityState;
use crate::governor::BufferState;
use crate::retry::{BreakerState, RetryRecord};
use crate::session::SessionState;
use crate::stall::StallState;
use crate::transition::{PlaybackSlot, SlotId, SlotPhase, SlotRoles, TransitionKind};

/// Lifetime counters for one session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub loads_started: u64,
    pub loads_succeeded: u64,
    pub loads_failed: u64,
    pub loads_superseded: u64,
    pub load_attempts: u64,
    pub prefetches_started: u64,
    pub prefetches_adopted: u64,
    pub stall_actions: u64,
    pub spurious_ended: u64,
    pub transitions: u64,
    pub errors_reported: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlotSnapshot {
    pub id: SlotId,
    pub phase: SlotPhase,
    pub track_id: Option<String>,
    pub gain: f32,
    pub position: f64,
    pub duration: Option<f64>,
    pub ending_latched: bool,
}

impl From<&PlaybackSlot> for SlotSnapshot {
    fn from(slot: &PlaybackSlot) -> Self {
        Self {
            id: slot.id(),
            phase: slot.phase(),
            track_id: slot.track_id().map(String::from),
            gain: slot.gain(),
            position: slot.position(),
            duration: slot.duration(),
            ending_latched: slot.is_ending_latched(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetrySnapshot {
    pub breaker: BreakerState,
    pub consecutive_failures: u32,
    /// A half-open trial load is out.
    pub trial_in_flight: bool,
    pub total_retries: u64,
    pub recent: Vec<RetryRecord>,
}

/// Everything a metrics collaborator needs to describe the session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticsSnapshot {
    pub session_id: Uuid,
    pub captured_at: DateTime<Utc>,
    pub state: SessionState,
    pub generation: u64,
    pub track_id: Option<String>,
    pub position: f64,
    pub duration: Option<f64>,
    pub volume: f32,
    pub crossfade_mode: CrossfadeMode,
    pub crossfade_duration_ms: u64,
    pub network: NetworkClass,
    pub roles: SlotRoles,
    pub slots: Vec<SlotSnapshot>,
    pub transition: Option<TransitionKind>,
    pub retry: RetrySnapshot,
    pub quality: QualityState,
    pub buffer: BufferState,
    pub stall: StallState,
    pub counters: Counters,
}

impl DiagnosticsSnapshot {
    /// The slot currently holding the audible role.
    pub fn current_slot(&self) -> Option<&SlotSnapshot> {
        self.slots.iter().find(|s| s.id == self.roles.current)
    }
}
