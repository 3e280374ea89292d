//! In-process media backend and resolver for tests and the scenario runner.
//!
//! [`SimulatedBackend`] advances virtual playback when told to and queues the
//! signals a real runtime would report. Load outcomes are scripted in order.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use airwave_core::{Error, ResolvedSource, Result, SourceVariant};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::trace;
use url::Url;

use crate::backend::{AttemptId, MediaBackend, MediaCommand, MediaEvent, SourceResolver};
use crate::session::PlaybackSession;
use crate::transition::SlotId;

/// How the next load, reload or reassign command turns out.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadScript {
    Succeed,
    Fail(Error),
    /// Never report anything.
    Hang,
}

#[derive(Debug)]
struct PendingLoad {
    attempt: AttemptId,
    remaining: Duration,
    script: LoadScript,
    start_at: f64,
    duration: f64,
}

#[derive(Debug, Default)]
struct SimSlot {
    pending: Option<PendingLoad>,
    loaded: bool,
    playing: bool,
    position: f64,
    duration: f64,
    volume: f32,
}

#[derive(Debug)]
struct SimState {
    slots: [SimSlot; 2],
    scripts: VecDeque<LoadScript>,
    events: Vec<(SlotId, MediaEvent)>,
    log: Vec<(SlotId, MediaCommand)>,
    durations: HashMap<String, f64>,
    default_duration: f64,
    ready_delay: Duration,
    buffer_ahead: f64,
    retained: Option<f64>,
    bandwidth_bps: Option<u64>,
    stalled: bool,
}

const fn index(slot: SlotId) -> usize {
    match slot {
        SlotId::A => 0,
        SlotId::B => 1,
    }
}

/// Scriptable stand-in for a platform media runtime.
#[derive(Debug)]
pub struct SimulatedBackend {
    state: Mutex<SimState>,
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                slots: [SimSlot::default(), SimSlot::default()],
                scripts: VecDeque::new(),
                events: Vec::new(),
                log: Vec::new(),
                durations: HashMap::new(),
                default_duration: 180.0,
                ready_delay: Duration::from_millis(200),
                buffer_ahead: 30.0,
                retained: None,
                bandwidth_bps: None,
                stalled: false,
            }),
        }
    }

    /// Duration reported for tracks without an explicit one.
    pub fn set_default_duration(&self, seconds: f64) {
        self.state.lock().default_duration = seconds;
    }

    /// Duration reported for sources whose URL ends in `track_id`.
    pub fn set_track_duration(&self, track_id: impl Into<String>, seconds: f64) {
        self.state.lock().durations.insert(track_id.into(), seconds);
    }

    pub fn set_ready_delay(&self, delay: Duration) {
        self.state.lock().ready_delay = delay;
    }

    /// Queue outcomes for upcoming load-phase commands. Unscripted loads succeed.
    pub fn script(&self, outcomes: impl IntoIterator<Item = LoadScript>) {
        self.state.lock().scripts.extend(outcomes);
    }

    /// Override the retained-buffer figure reported in progress updates.
    pub fn set_retained(&self, seconds: Option<f64>) {
        self.state.lock().retained = seconds;
    }

    /// Report a fragment download at this bandwidth on every advance.
    pub fn set_bandwidth(&self, bandwidth_bps: Option<u64>) {
        self.state.lock().bandwidth_bps = bandwidth_bps;
    }

    /// Freeze playback progress while still reporting time updates.
    pub fn set_stalled(&self, stalled: bool) {
        self.state.lock().stalled = stalled;
    }

    /// Queue a signal as if the runtime had reported it.
    pub fn inject(&self, slot: SlotId, event: MediaEvent) {
        self.state.lock().events.push((slot, event));
    }

    /// Every command received so far.
    pub fn commands(&self) -> Vec<(SlotId, MediaCommand)> {
        self.state.lock().log.clone()
    }

    pub fn count_commands(&self, matches: impl Fn(&MediaCommand) -> bool) -> usize {
        self.state.lock().log.iter().filter(|(_, c)| matches(c)).count()
    }

    pub fn is_playing(&self, slot: SlotId) -> bool {
        self.state.lock().slots[index(slot)].playing
    }

    pub fn position(&self, slot: SlotId) -> f64 {
        self.state.lock().slots[index(slot)].position
    }

    pub fn volume(&self, slot: SlotId) -> f32 {
        self.state.lock().slots[index(slot)].volume
    }

    pub fn drain_events(&self) -> Vec<(SlotId, MediaEvent)> {
        std::mem::take(&mut self.state.lock().events)
    }

    /// Advance virtual playback by `dt`.
    pub fn advance(&self, dt: Duration) {
        let mut state = self.state.lock();
        let SimState {
            slots,
            events,
            buffer_ahead,
            retained,
            bandwidth_bps,
            stalled,
            ..
        } = &mut *state;

        for (slot_id, slot) in [SlotId::A, SlotId::B].into_iter().zip(slots.iter_mut()) {
            if let Some(pending) = slot.pending.as_mut() {
                if pending.script != LoadScript::Hang {
                    pending.remaining = pending.remaining.saturating_sub(dt);
                }
                if pending.remaining.is_zero() && pending.script != LoadScript::Hang {
                    if let Some(pending) = slot.pending.take() {
                        match pending.script {
                            LoadScript::Succeed => {
                                slot.loaded = true;
                                slot.position = pending.start_at;
                                slot.duration = pending.duration;
                                events.push((
                                    slot_id,
                                    MediaEvent::Ready {
                                        attempt: pending.attempt,
                                        duration: Some(pending.duration),
                                    },
                                ));
                            }
                            LoadScript::Fail(error) => {
                                events.push((
                                    slot_id,
                                    MediaEvent::LoadFailed {
                                        attempt: pending.attempt,
                                        error,
                                    },
                                ));
                            }
                            LoadScript::Hang => {}
                        }
                    }
                }
            }

            if !slot.loaded || !slot.playing {
                continue;
            }
            if !*stalled {
                slot.position = (slot.position + dt.as_secs_f64()).min(slot.duration);
            }
            let ahead = buffer_ahead.min(slot.duration - slot.position).max(0.0);
            events.push((
                slot_id,
                MediaEvent::TimeUpdate {
                    position: slot.position,
                    buffered_ahead: ahead,
                    buffered_total: retained.unwrap_or(slot.position + ahead),
                },
            ));
            if let Some(bandwidth_bps) = *bandwidth_bps {
                events.push((slot_id, MediaEvent::FragmentLoaded { bandwidth_bps }));
            }
            if slot.position >= slot.duration {
                slot.playing = false;
                events.push((slot_id, MediaEvent::Ended));
            }
        }
    }
}

impl MediaBackend for SimulatedBackend {
    fn send(&self, slot: SlotId, command: MediaCommand) -> Result<()> {
        trace!("sim slot {slot}: {command:?}");
        let mut state = self.state.lock();
        state.log.push((slot, command.clone()));
        let script = match &command {
            MediaCommand::Load(_) | MediaCommand::Reload(_) | MediaCommand::Reassign(_) => {
                state.scripts.pop_front().unwrap_or(LoadScript::Succeed)
            }
            _ => LoadScript::Succeed,
        };
        let ready_delay = state.ready_delay;
        let duration_for = |url: &Url, state: &SimState| {
            url.path_segments()
                .and_then(|mut segments| segments.next_back())
                .and_then(|id| state.durations.get(id).copied())
                .unwrap_or(state.default_duration)
        };

        match command {
            MediaCommand::Load(request)
            | MediaCommand::Reload(request)
            | MediaCommand::Reassign(request) => {
                let duration = duration_for(&request.source.url, &*state);
                let target = &mut state.slots[index(slot)];
                target.playing = false;
                target.pending = Some(PendingLoad {
                    attempt: request.attempt,
                    remaining: ready_delay,
                    script,
                    start_at: request.start_at,
                    duration,
                });
            }
            MediaCommand::Play => {
                let target = &mut state.slots[index(slot)];
                let startable =
                    target.loaded && target.pending.is_none() && target.position < target.duration;
                if startable && !target.playing {
                    target.playing = true;
                    state.events.push((slot, MediaEvent::Playing));
                }
            }
            MediaCommand::Pause => state.slots[index(slot)].playing = false,
            MediaCommand::Seek(position) => {
                let target = &mut state.slots[index(slot)];
                target.position = position.clamp(0.0, target.duration.max(0.0));
            }
            MediaCommand::SetVolume(volume) => state.slots[index(slot)].volume = volume,
            MediaCommand::Release => state.slots[index(slot)] = SimSlot::default(),
            MediaCommand::AdviseQuality(tier) => {
                if state.slots[index(slot)].loaded {
                    state.events.push((slot, MediaEvent::LevelSwitched(tier)));
                }
            }
            MediaCommand::RestartLoader | MediaCommand::SetBufferPolicy(_) => {}
        }
        Ok(())
    }
}

/// Resolver that maps ids onto `{base}/{variant}/{id}`.
#[derive(Debug, Clone)]
pub struct StaticResolver {
    base: Url,
    adaptive: bool,
}

impl StaticResolver {
    pub fn new(base: Url) -> Self {
        Self {
            base,
            adaptive: false,
        }
    }

    /// Advertise an adaptive variant for every track.
    #[must_use]
    pub fn with_adaptive(mut self) -> Self {
        self.adaptive = true;
        self
    }
}

#[async_trait]
impl SourceResolver for StaticResolver {
    async fn resolve(&self, track_id: &str, variant: SourceVariant) -> Result<ResolvedSource> {
        let path = match variant {
            SourceVariant::Adaptive => format!("adaptive/{track_id}"),
            SourceVariant::Direct => format!("direct/{track_id}"),
        };
        let url = self
            .base
            .join(&path)
            .map_err(|e| Error::InvalidState(format!("cannot build source url for {track_id}: {e}")))?;
        Ok(ResolvedSource { variant, url })
    }

    async fn has_adaptive_variant(&self, _track_id: &str) -> bool {
        self.adaptive
    }
}

/// Pump `backend` into `session` every `period`, forever.
pub async fn drive(session: PlaybackSession, backend: Arc<SimulatedBackend>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        backend.advance(period);
        for (slot, event) in backend.drain_events() {
            session.handle_media_event(slot, event);
        }
        session.tick();
    }
}
