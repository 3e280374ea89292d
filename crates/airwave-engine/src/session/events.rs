//! Session events, host callbacks and the outbox they are collected in.

use std::fmt;
use std::sync::Arc;

use airwave_core::{Error, ErrorCategory, QualityTier};
use crossbeam_channel::Sender;
use serde::Serialize;

use crate::diagnostics::DiagnosticsSnapshot;
use crate::stall::StallStrategy;
use crate::transition::SlotCommand;

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    #[default]
    Idle,
    Loading,
    Ready,
    Playing,
    Buffering,
    Transitioning,
    Paused,
    Stopped,
    Error,
}

impl SessionState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Loading => "loading",
            Self::Ready => "ready",
            Self::Playing => "playing",
            Self::Buffering => "buffering",
            Self::Transitioning => "transitioning",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transient recovery the session performed on its own.
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryEvent {
    /// The buffer governor reloaded the current source.
    BufferFlush { resume_at: f64 },
    /// A stall-ladder rung ran.
    Stall { strategy: StallStrategy, rung: u32 },
    /// Every rung ran; the ladder is cooling down.
    StallCoolDown,
    /// An early end-of-media signal was answered with a seek back.
    SpuriousEnded { resume_at: f64 },
}

/// Events broadcast to subscribers.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    TrackLoaded {
        track_id: String,
        duration: Option<f64>,
    },
    /// The current track ended, or is about to in overlap mode.
    TrackEnded { track_id: Option<String> },
    /// A prefetch finished buffering into the next slot.
    Prefetched { track_id: String },
    QualityAdvised(QualityTier),
    Recovery(RecoveryEvent),
    Error {
        error: Error,
        category: ErrorCategory,
        retryable: bool,
    },
    Diagnostics(Box<DiagnosticsSnapshot>),
}

pub type TrackLoadedCallback = Arc<dyn Fn(&str, Option<f64>) + Send + Sync>;
pub type TrackEndedCallback = Arc<dyn Fn() + Send + Sync>;
pub type DiagnosticsCallback = Arc<dyn Fn(&DiagnosticsSnapshot) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&Error, ErrorCategory, bool) + Send + Sync>;

/// Host-registered callbacks. Invoked after the session lock is released.
#[derive(Default, Clone)]
pub(crate) struct Callbacks {
    pub track_loaded: Option<TrackLoadedCallback>,
    pub track_ended: Option<TrackEndedCallback>,
    pub diagnostics: Option<DiagnosticsCallback>,
    pub error: Option<ErrorCallback>,
}

impl Callbacks {
    pub fn dispatch(&self, event: &SessionEvent) {
        match event {
            SessionEvent::TrackLoaded { track_id, duration } => {
                if let Some(cb) = &self.track_loaded {
                    cb(track_id, *duration);
                }
            }
            SessionEvent::TrackEnded { .. } => {
                if let Some(cb) = &self.track_ended {
                    cb();
                }
            }
            SessionEvent::Error {
                error,
                category,
                retryable,
            } => {
                if let Some(cb) = &self.error {
                    cb(error, *category, *retryable);
                }
            }
            SessionEvent::Diagnostics(snapshot) => {
                if let Some(cb) = &self.diagnostics {
                    cb(snapshot);
                }
            }
            _ => {}
        }
    }
}

/// Side effects collected while the session lock is held.
#[derive(Default)]
pub(crate) struct Outbox {
    pub commands: Vec<SlotCommand>,
    pub events: Vec<SessionEvent>,
    /// Publish a diagnostics snapshot once the update finishes.
    pub diagnostics: bool,
}

impl Outbox {
    pub fn emit(&mut self, event: SessionEvent) {
        self.events.push(event);
    }

    pub fn error(&mut self, error: Error) {
        let category = error.category();
        let retryable = error.is_retryable();
        self.events.push(SessionEvent::Error {
            error,
            category,
            retryable,
        });
        self.diagnostics = true;
    }
}

/// Broadcast list of event subscribers. Closed receivers are dropped lazily.
#[derive(Default)]
pub(crate) struct Subscribers {
    senders: Vec<Sender<SessionEvent>>,
}

impl Subscribers {
    pub fn add(&mut self, sender: Sender<SessionEvent>) {
        self.senders.push(sender);
    }

    pub fn broadcast(&mut self, event: &SessionEvent) {
        self.senders.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }
}
