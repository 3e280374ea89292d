//! # airwave-engine
//!
//! Resilient adaptive-streaming playback engine.
//!
//! Features:
//! - Retried, generation-checked track loading with source fallback
//! - Circuit breaker shared by every load in a session
//! - Bandwidth-driven quality advice for adaptive sources
//! - Buffer-ceiling governance for constrained platforms
//! - Escalating stall recovery
//! - Dual-slot gapless transitions with equal-power crossfades

pub mod abr;
pub mod attempt;
pub mod backend;
pub mod diagnostics;
pub mod ended;
pub mod governor;
pub mod retry;
pub mod session;
pub mod sim;
pub mod stall;
pub mod transition;

pub use backend::{AttemptId, LoadRequest, MediaBackend, MediaCommand, MediaEvent, SourceResolver};
pub use diagnostics::DiagnosticsSnapshot;
pub use session::{
    DeferReason, LoadedTrack, PlaybackSession, PrefetchOutcome, SessionBuilder, SessionEvent,
    SessionState,
};
pub use transition::SlotId;
