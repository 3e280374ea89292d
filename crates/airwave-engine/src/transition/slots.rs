//! The two playback slots and their role assignment.

use std::fmt;

use airwave_core::{ResolvedSource, Track};
use serde::Serialize;
use tracing::debug;

/// Slot identifier. Exactly two exist for a session's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SlotId {
    A,
    B,
}

impl SlotId {
    pub const fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }

    const fn index(self) -> usize {
        match self {
            Self::A => 0,
            Self::B => 1,
        }
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::A => f.write_str("A"),
            Self::B => f.write_str("B"),
        }
    }
}

/// Lifecycle of a slot's contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SlotPhase {
    #[default]
    Idle,
    Loading,
    /// Prefetched, waiting for a load request to claim it.
    Primed,
    /// Claimed by a load request, waiting for `play`.
    Ready,
    Playing,
    Paused,
    Ended,
}

impl SlotPhase {
    pub const fn is_audible(self) -> bool {
        matches!(self, Self::Playing)
    }
}

/// One buffer/decoder unit.
#[derive(Debug, Clone)]
pub struct PlaybackSlot {
    id: SlotId,
    pub(crate) phase: SlotPhase,
    pub(crate) track: Option<Track>,
    pub(crate) source: Option<ResolvedSource>,
    pub(crate) gain: f32,
    pub(crate) position: f64,
    pub(crate) duration: Option<f64>,
    /// Set once "track ending" fired for the current contents.
    pub(crate) ending_latched: bool,
}

impl PlaybackSlot {
    const fn new(id: SlotId) -> Self {
        Self {
            id,
            phase: SlotPhase::Idle,
            track: None,
            source: None,
            gain: 0.0,
            position: 0.0,
            duration: None,
            ending_latched: false,
        }
    }

    pub const fn id(&self) -> SlotId {
        self.id
    }

    pub const fn phase(&self) -> SlotPhase {
        self.phase
    }

    pub const fn track(&self) -> Option<&Track> {
        self.track.as_ref()
    }

    pub fn track_id(&self) -> Option<&str> {
        self.track.as_ref().map(|t| t.id.as_str())
    }

    pub const fn source(&self) -> Option<&ResolvedSource> {
        self.source.as_ref()
    }

    pub const fn gain(&self) -> f32 {
        self.gain
    }

    pub const fn position(&self) -> f64 {
        self.position
    }

    pub const fn duration(&self) -> Option<f64> {
        self.duration
    }

    pub const fn is_ending_latched(&self) -> bool {
        self.ending_latched
    }

    /// Empty the slot for new contents.
    pub(crate) fn clear(&mut self) {
        self.phase = SlotPhase::Idle;
        self.track = None;
        self.source = None;
        self.gain = 0.0;
        self.position = 0.0;
        self.duration = None;
        self.ending_latched = false;
    }
}

/// Role view of the pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SlotRoles {
    pub current: SlotId,
    pub next: SlotId,
}

/// Arena of exactly two slots addressed by role.
#[derive(Debug, Clone)]
pub struct SlotPair {
    slots: [PlaybackSlot; 2],
    current: SlotId,
}

impl Default for SlotPair {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotPair {
    pub const fn new() -> Self {
        Self {
            slots: [PlaybackSlot::new(SlotId::A), PlaybackSlot::new(SlotId::B)],
            current: SlotId::A,
        }
    }

    pub const fn current_id(&self) -> SlotId {
        self.current
    }

    pub const fn next_id(&self) -> SlotId {
        self.current.other()
    }

    pub const fn roles(&self) -> SlotRoles {
        SlotRoles {
            current: self.current,
            next: self.current.other(),
        }
    }

    pub const fn get(&self, id: SlotId) -> &PlaybackSlot {
        &self.slots[id.index()]
    }

    pub(crate) fn get_mut(&mut self, id: SlotId) -> &mut PlaybackSlot {
        &mut self.slots[id.index()]
    }

    pub const fn current(&self) -> &PlaybackSlot {
        self.get(self.current)
    }

    pub const fn next(&self) -> &PlaybackSlot {
        self.get(self.current.other())
    }

    /// Hand the current role to the other slot. The only way it changes.
    pub(crate) fn swap(&mut self) {
        let incoming = self.current.other();
        debug!("Slot roles swapped: current {} -> {incoming}", self.current);
        self.current = incoming;
        // A slot becoming current starts with a clean ending latch.
        self.get_mut(incoming).ending_latched = false;
    }

    pub fn iter(&self) -> impl Iterator<Item = &PlaybackSlot> {
        self.slots.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles_are_disjoint() {
        let mut pair = SlotPair::new();
        assert_eq!(pair.roles(), SlotRoles { current: SlotId::A, next: SlotId::B });
        pair.swap();
        assert_eq!(pair.current().id(), SlotId::B);
        assert_eq!(pair.next().id(), SlotId::A);
        assert_ne!(pair.current_id(), pair.next_id());
    }

    #[test]
    fn test_swap_clears_incoming_latch() {
        let mut pair = SlotPair::new();
        pair.get_mut(SlotId::B).ending_latched = true;
        pair.get_mut(SlotId::A).ending_latched = true;
        pair.swap();
        assert!(!pair.current().is_ending_latched());
        assert!(pair.next().is_ending_latched());
    }
}
