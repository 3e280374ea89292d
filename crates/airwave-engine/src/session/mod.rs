//! The playback session: one logical "now playing" surface.
//!
//! A session owns every component behind one lock. Public operations take the
//! lock, mutate state, collect backend commands and events into an
//! [`Outbox`](events::Outbox), and release the lock before anything leaves the
//! session. No guard is ever held across an await.
//!
//! Loads are identified twice over: a generation number marks which request
//! the host last asked for, and an [`AttemptId`] marks each backend attempt so
//! late signals from abandoned attempts are ignored.

mod events;


pub use events::{
    DiagnosticsCallback, ErrorCallback, RecoveryEvent, SessionEvent, SessionState,
    TrackEndedCallback, TrackLoadedCallback,
};

use std::sync::Arc;
use std::time::Duration;

use airwave_core::{
    CrossfadeMode, EngineConfig, Error, ErrorCategory, PlatformCapabilities, QualityTier,
    ResolvedSource, Result, SourceDescriptor, SourceHint, SourceVariant, TimeoutStage, Track,
    Volume,
};
use chrono::Utc;
use crossbeam_channel::{unbounded, Receiver};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::abr::QualitySelector;
use crate::attempt::{AttemptPurpose, AttemptTable};
use crate::backend::{AttemptId, LoadRequest, MediaBackend, MediaCommand, MediaEvent, ReadyInfo, SourceResolver};
use crate::diagnostics::{Counters, DiagnosticsSnapshot, RetrySnapshot, SlotSnapshot};
use crate::ended::{EndedGuard, EndedVerdict};
use crate::governor::{BufferGovernor, BufferSample, GovernorAction, PrefetchAdvice};
use crate::retry::{self, RetryController};
use crate::stall::{StallAction, StallRecoveryLadder, StallStrategy};
use crate::transition::{PlayStart, SlotId, SlotPhase, TickOutput, TransitionEngine};
use events::{Callbacks, Outbox, Subscribers};

/// Result of a successful `load_track`.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedTrack {
    pub track_id: String,
    pub slot: SlotId,
    pub duration: Option<f64>,
    /// Variant that succeeded. `None` when a prefetch was adopted.
    pub variant: Option<SourceVariant>,
    pub from_prefetch: bool,
}

/// Why a prefetch did not start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferReason {
    /// The buffer governor asked for prefetch to pause.
    BufferPressure,
    /// A track load or another prefetch is already running.
    LoadInFlight,
    Transitioning,
    /// The next slot holds a track waiting for `play`.
    SlotBusy,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PrefetchOutcome {
    Primed { duration: Option<f64> },
    AlreadyPrimed,
    Deferred(DeferReason),
}

/// Which request an in-flight load belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadToken {
    Track(u64),
    Prefetch(u64),
}

impl LoadToken {
    const fn generation(self) -> u64 {
        match self {
            Self::Track(generation) | Self::Prefetch(generation) => generation,
        }
    }
}

#[derive(Debug, Clone)]
struct InFlight {
    track_id: String,
    generation: u64,
}

/// One source to try for a track.
#[derive(Debug, Clone)]
enum Candidate {
    Explicit(SourceDescriptor),
    Resolve(SourceVariant),
}

impl Candidate {
    const fn variant(&self) -> SourceVariant {
        match self {
            Self::Explicit(descriptor) => descriptor.variant,
            Self::Resolve(variant) => *variant,
        }
    }
}

const fn hint_allows(hint: SourceHint, variant: SourceVariant) -> bool {
    match hint {
        SourceHint::Auto => true,
        SourceHint::Adaptive => matches!(variant, SourceVariant::Adaptive),
        SourceHint::Direct => matches!(variant, SourceVariant::Direct),
    }
}

struct SessionInner {
    state: SessionState,
    generation: u64,
    prefetch_generation: u64,
    loading: Option<InFlight>,
    prefetching: Option<InFlight>,
    capabilities: PlatformCapabilities,
    attempts: AttemptTable,
    transition: TransitionEngine,
    quality: QualitySelector,
    governor: BufferGovernor,
    stall: StallRecoveryLadder,
    ended: EndedGuard,
    counters: Counters,
}

impl SessionInner {
    const fn is_current(&self, token: LoadToken) -> bool {
        match token {
            LoadToken::Track(generation) => self.generation == generation,
            LoadToken::Prefetch(generation) => self.prefetch_generation == generation,
        }
    }

    fn set_state(&mut self, out: &mut Outbox, state: SessionState) {
        if self.state == state {
            return;
        }
        debug!("State changed: {:?} -> {:?}", self.state, state);
        out.emit(SessionEvent::StateChanged {
            from: self.state,
            to: state,
        });
        self.state = state;
        out.diagnostics = true;
    }

    /// Where the session rests when nothing is loading.
    fn settled_state(&self) -> SessionState {
        match self.transition.slots().current().phase() {
            SlotPhase::Playing => SessionState::Playing,
            SlotPhase::Paused => SessionState::Paused,
            _ if self.transition.slots().next().phase() == SlotPhase::Ready => SessionState::Ready,
            _ => SessionState::Idle,
        }
    }

    fn should_be_playing(&self) -> bool {
        let current = self.transition.slots().current();
        current.phase().is_audible() && !self.attempts.has_pending_recovery(current.id())
    }
}

struct Shared {
    id: Uuid,
    config: EngineConfig,
    resolver: Arc<dyn SourceResolver>,
    backend: Arc<dyn MediaBackend>,
    retry: Mutex<RetryController>,
    inner: Mutex<SessionInner>,
    callbacks: Mutex<Callbacks>,
    subscribers: Mutex<Subscribers>,
}

/// Builder for [`PlaybackSession`].
pub struct SessionBuilder {
    config: EngineConfig,
    capabilities: PlatformCapabilities,
    resolver: Arc<dyn SourceResolver>,
    backend: Arc<dyn MediaBackend>,
    seed: Option<u64>,
}

impl SessionBuilder {
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn capabilities(mut self, capabilities: PlatformCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Seed retry jitter for reproducible runs.
    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn build(self) -> Result<PlaybackSession> {
        self.config.validate()?;
        let config = self.config;
        let caps = self.capabilities;
        let retry_config = config.retry_for(caps.network_class).clone();
        let retry = match self.seed {
            Some(seed) => RetryController::with_seed(retry_config, config.breaker.clone(), seed),
            None => RetryController::new(retry_config, config.breaker.clone()),
        };

        let inner = SessionInner {
            state: SessionState::Idle,
            generation: 0,
            prefetch_generation: 0,
            loading: None,
            prefetching: None,
            capabilities: caps,
            attempts: AttemptTable::new(),
            transition: TransitionEngine::new(
                config.crossfade_mode,
                config.crossfade_duration(),
                config.click_guard(),
            ),
            quality: QualitySelector::new(config.abr.clone()),
            governor: BufferGovernor::new(config.buffer.clone(), &caps),
            stall: StallRecoveryLadder::new(config.stall.clone(), caps.network_class),
            ended: EndedGuard::new(config.ended.clone()),
            counters: Counters::default(),
        };

        let id = Uuid::new_v4();
        info!(
            "Playback session {id} created ({:?} network, ceiling enforced: {})",
            caps.network_class, caps.enforces_buffer_ceiling
        );
        Ok(PlaybackSession {
            shared: Arc::new(Shared {
                id,
                config,
                resolver: self.resolver,
                backend: self.backend,
                retry: Mutex::new(retry),
                inner: Mutex::new(inner),
                callbacks: Mutex::new(Callbacks::default()),
                subscribers: Mutex::new(Subscribers::default()),
            }),
        })
    }
}

/// Clears the in-flight marker if a load future is dropped before finishing.
struct InFlightGuard<'a> {
    session: &'a PlaybackSession,
    token: LoadToken,
    slot: SlotId,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let token = self.token;
        let slot = self.slot;
        self.session.update(|inner, out, _| {
            let marker = match token {
                LoadToken::Track(_) => &mut inner.loading,
                LoadToken::Prefetch(_) => &mut inner.prefetching,
            };
            if !marker.as_ref().is_some_and(|l| l.generation == token.generation()) {
                return;
            }
            let Some(marker) = marker.take() else {
                return;
            };
            debug!("Load of {} cancelled", marker.track_id);
            inner.attempts.abandon_slot(slot);
            out.commands.extend(inner.transition.discard(slot));
            if matches!(token, LoadToken::Track(_)) {
                let state = inner.settled_state();
                inner.set_state(out, state);
            }
        });
    }
}

/// Settles a load attempt if its future is dropped (timeout or cancellation).
struct AttemptGuard<'a> {
    shared: &'a Shared,
    attempt: AttemptId,
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        if self.shared.inner.lock().attempts.settle(self.attempt).is_some() {
            debug!("Attempt {} abandoned", self.attempt);
        }
    }
}

enum LoadStart {
    Adopted(LoadedTrack),
    Fresh { generation: u64, slot: SlotId },
}

enum PrefetchStart {
    Done(PrefetchOutcome),
    Begin { generation: u64, slot: SlotId },
}

/// Handle to a playback session. Cheap to clone.
#[derive(Clone)]
pub struct PlaybackSession {
    shared: Arc<Shared>,
}

impl PlaybackSession {
    pub fn builder(resolver: Arc<dyn SourceResolver>, backend: Arc<dyn MediaBackend>) -> SessionBuilder {
        SessionBuilder {
            config: EngineConfig::default(),
            capabilities: PlatformCapabilities::default(),
            resolver,
            backend,
            seed: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn state(&self) -> SessionState {
        self.shared.inner.lock().state
    }

    /// Generation of the most recent track load request.
    pub fn generation(&self) -> u64 {
        self.shared.inner.lock().generation
    }

    // ------------------------------------------------------------------
    // Callbacks and subscriptions
    // ------------------------------------------------------------------

    pub fn on_track_loaded(&self, callback: impl Fn(&str, Option<f64>) + Send + Sync + 'static) {
        self.shared.callbacks.lock().track_loaded = Some(Arc::new(callback));
    }

    pub fn on_track_ended(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.shared.callbacks.lock().track_ended = Some(Arc::new(callback));
    }

    pub fn on_diagnostics_update(
        &self,
        callback: impl Fn(&DiagnosticsSnapshot) + Send + Sync + 'static,
    ) {
        self.shared.callbacks.lock().diagnostics = Some(Arc::new(callback));
    }

    pub fn on_error(&self, callback: impl Fn(&Error, ErrorCategory, bool) + Send + Sync + 'static) {
        self.shared.callbacks.lock().error = Some(Arc::new(callback));
    }

    /// Receive every session event on a channel.
    pub fn subscribe(&self) -> Receiver<SessionEvent> {
        let (tx, rx) = unbounded();
        self.shared.subscribers.lock().add(tx);
        rx
    }

    // ------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------

    /// Load `track` into the next slot, retrying and falling back across
    /// source variants. Resolves once the slot reports ready; call
    /// [`play`](Self::play) to hand off to it.
    ///
    /// A newer `load_track` or `stop` makes this return [`Error::Superseded`].
    pub async fn load_track(&self, track: Track, hint: SourceHint) -> Result<LoadedTrack> {
        let start = self.update(|inner, out, now| self.begin_track_load(inner, out, now, &track))?;
        let (generation, slot) = match start {
            LoadStart::Adopted(loaded) => return Ok(loaded),
            LoadStart::Fresh { generation, slot } => (generation, slot),
        };

        let token = LoadToken::Track(generation);
        let _in_flight = InFlightGuard {
            session: self,
            token,
            slot,
        };
        let result = self.acquire(slot, &track, hint, token).await;
        self.update(|inner, out, _| self.finish_track_load(inner, out, &track, slot, generation, result))
    }

    fn begin_track_load(
        &self,
        inner: &mut SessionInner,
        out: &mut Outbox,
        now: Instant,
        track: &Track,
    ) -> Result<LoadStart> {
        if inner.loading.as_ref().is_some_and(|l| l.track_id == track.id) {
            debug!("Load of {} already in flight", track.id);
            return Err(Error::LoadInProgress(track.id.clone()));
        }
        if inner.transition.is_transitioning() {
            let tick = inner.transition.finish_now(now);
            self.apply_tick(inner, out, tick, now);
        }

        let slot = inner.transition.load_slot();
        let next = inner.transition.slots().get(slot);
        if next.phase() == SlotPhase::Primed && next.track_id() == Some(track.id.as_str()) {
            let duration = next.duration();
            inner.generation += 1;
            inner.loading = None;
            inner.transition.claim(slot);
            inner.counters.loads_started += 1;
            inner.counters.loads_succeeded += 1;
            inner.counters.prefetches_adopted += 1;
            info!("Adopting prefetched {} from slot {slot}", track.display_name());
            inner.set_state(out, SessionState::Ready);
            out.emit(SessionEvent::TrackLoaded {
                track_id: track.id.clone(),
                duration,
            });
            return Ok(LoadStart::Adopted(LoadedTrack {
                track_id: track.id.clone(),
                slot,
                duration,
                variant: None,
                from_prefetch: true,
            }));
        }

        inner.generation += 1;
        inner.prefetch_generation += 1;
        inner.prefetching = None;
        if let Some(previous) = inner.loading.take() {
            debug!("Load of {} superseded", previous.track_id);
            inner.counters.loads_superseded += 1;
        }
        inner.attempts.abandon_slot(slot);
        out.commands.extend(inner.transition.discard(slot));
        inner.transition.begin_load(slot, track);
        inner.loading = Some(InFlight {
            track_id: track.id.clone(),
            generation: inner.generation,
        });
        inner.counters.loads_started += 1;
        info!(
            "Loading {} into slot {slot} (generation {})",
            track.display_name(),
            inner.generation
        );
        inner.set_state(out, SessionState::Loading);
        Ok(LoadStart::Fresh {
            generation: inner.generation,
            slot,
        })
    }

    fn finish_track_load(
        &self,
        inner: &mut SessionInner,
        out: &mut Outbox,
        track: &Track,
        slot: SlotId,
        generation: u64,
        result: Result<(ReadyInfo, SourceVariant)>,
    ) -> Result<LoadedTrack> {
        if inner.generation != generation {
            return Err(Error::Superseded);
        }
        inner.loading = None;
        match result {
            Ok((info, variant)) => {
                inner.transition.mark_loaded(slot, info.duration, true);
                inner.counters.loads_succeeded += 1;
                let duration = inner.transition.slots().get(slot).duration();
                info!(
                    "Loaded {} via {variant:?} source ({})",
                    track.display_name(),
                    duration.map_or_else(|| "unknown duration".to_string(), |d| format!("{d:.1}s"))
                );
                inner.set_state(out, SessionState::Ready);
                out.emit(SessionEvent::TrackLoaded {
                    track_id: track.id.clone(),
                    duration,
                });
                Ok(LoadedTrack {
                    track_id: track.id.clone(),
                    slot,
                    duration,
                    variant: Some(variant),
                    from_prefetch: false,
                })
            }
            Err(e) if e.is_superseded() => Err(e),
            Err(e) => {
                warn!("Failed to load {}: {e}", track.display_name());
                inner.counters.loads_failed += 1;
                inner.counters.errors_reported += 1;
                out.commands.extend(inner.transition.discard(slot));
                inner.set_state(out, SessionState::Error);
                out.error(e.clone());
                Err(e)
            }
        }
    }

    /// Buffer `track` into the next slot ahead of time. The slot stays
    /// silent until a `load_track` for the same id adopts it.
    pub async fn prefetch_next(&self, track: Track, hint: SourceHint) -> Result<PrefetchOutcome> {
        let start = self.update(|inner, out, _| Self::begin_prefetch(inner, out, &track));
        let (generation, slot) = match start {
            PrefetchStart::Done(outcome) => return Ok(outcome),
            PrefetchStart::Begin { generation, slot } => (generation, slot),
        };

        let token = LoadToken::Prefetch(generation);
        let _in_flight = InFlightGuard {
            session: self,
            token,
            slot,
        };
        let result = self.acquire(slot, &track, hint, token).await;
        self.update(|inner, out, _| {
            if inner.prefetch_generation != generation {
                return Err(Error::Superseded);
            }
            inner.prefetching = None;
            match result {
                Ok((info, _)) => {
                    inner.transition.mark_loaded(slot, info.duration, false);
                    let duration = inner.transition.slots().get(slot).duration();
                    info!("Prefetched {} into slot {slot}", track.display_name());
                    out.emit(SessionEvent::Prefetched {
                        track_id: track.id.clone(),
                    });
                    out.diagnostics = true;
                    Ok(PrefetchOutcome::Primed { duration })
                }
                Err(e) => {
                    if !e.is_superseded() {
                        warn!("Prefetch of {} failed: {e}", track.display_name());
                    }
                    out.commands.extend(inner.transition.discard(slot));
                    Err(e)
                }
            }
        })
    }

    fn begin_prefetch(inner: &mut SessionInner, out: &mut Outbox, track: &Track) -> PrefetchStart {
        let slot = inner.transition.load_slot();
        let next = inner.transition.slots().get(slot);
        let same_track = next.track_id() == Some(track.id.as_str());

        if same_track && matches!(next.phase(), SlotPhase::Primed | SlotPhase::Ready) {
            return PrefetchStart::Done(PrefetchOutcome::AlreadyPrimed);
        }
        let deferred = if inner.loading.is_some() || inner.prefetching.is_some() {
            Some(DeferReason::LoadInFlight)
        } else if inner.transition.is_transitioning() {
            Some(DeferReason::Transitioning)
        } else if next.phase() == SlotPhase::Ready {
            Some(DeferReason::SlotBusy)
        } else if !inner.governor.prefetch_allowed() {
            Some(DeferReason::BufferPressure)
        } else {
            None
        };
        if let Some(reason) = deferred {
            debug!("Prefetch of {} deferred: {reason:?}", track.id);
            return PrefetchStart::Done(PrefetchOutcome::Deferred(reason));
        }

        inner.prefetch_generation += 1;
        inner.attempts.abandon_slot(slot);
        out.commands.extend(inner.transition.discard(slot));
        inner.transition.begin_load(slot, track);
        inner.prefetching = Some(InFlight {
            track_id: track.id.clone(),
            generation: inner.prefetch_generation,
        });
        inner.counters.prefetches_started += 1;
        debug!("Prefetching {} into slot {slot}", track.id);
        PrefetchStart::Begin {
            generation: inner.prefetch_generation,
            slot,
        }
    }

    /// Ordered sources to try for `track`.
    async fn plan(&self, track: &Track, hint: SourceHint) -> Vec<Candidate> {
        let supports_adaptive = self.shared.inner.lock().capabilities.supports_adaptive;
        let usable = |variant: SourceVariant| {
            hint_allows(hint, variant) && (variant != SourceVariant::Adaptive || supports_adaptive)
        };

        if track.has_explicit_sources() {
            return track
                .sources
                .iter()
                .filter(|s| usable(s.variant))
                .cloned()
                .map(Candidate::Explicit)
                .collect();
        }

        let mut plan = Vec::with_capacity(2);
        if usable(SourceVariant::Adaptive)
            && self.shared.resolver.has_adaptive_variant(&track.id).await
        {
            plan.push(Candidate::Resolve(SourceVariant::Adaptive));
        }
        if usable(SourceVariant::Direct) {
            plan.push(Candidate::Resolve(SourceVariant::Direct));
        }
        plan
    }

    /// Run the fallback plan under the retry policy until one source is ready.
    async fn acquire(
        &self,
        slot: SlotId,
        track: &Track,
        hint: SourceHint,
        token: LoadToken,
    ) -> Result<(ReadyInfo, SourceVariant)> {
        let plan = self.plan(track, hint).await;
        if plan.is_empty() {
            return Err(Error::InvalidState(format!(
                "no playable source for {} with hint {hint:?}",
                track.id
            )));
        }

        let mut last_error = None;
        for candidate in &plan {
            let outcome = retry::execute(&self.shared.retry, |n| {
                self.attempt(slot, track, candidate, token, n)
            })
            .await;
            match outcome {
                Ok(info) => return Ok((info, candidate.variant())),
                Err(e) if e.is_superseded() || matches!(e, Error::CircuitOpen { .. }) => {
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        "{:?} source for {} failed: {e}",
                        candidate.variant(),
                        track.id
                    );
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or(Error::Superseded))
    }

    /// One backend attempt. Resolves when the slot reports ready or failed.
    async fn attempt(
        &self,
        slot: SlotId,
        track: &Track,
        candidate: &Candidate,
        token: LoadToken,
        n: u32,
    ) -> Result<ReadyInfo> {
        if !self.shared.inner.lock().is_current(token) {
            return Err(Error::Superseded);
        }
        let source: ResolvedSource = match candidate {
            Candidate::Explicit(descriptor) => descriptor.clone().into(),
            Candidate::Resolve(variant) => self.shared.resolver.resolve(&track.id, *variant).await?,
        };

        let (attempt, reply) = {
            let mut inner = self.shared.inner.lock();
            if !inner.is_current(token) {
                return Err(Error::Superseded);
            }
            inner.transition.set_source(slot, source.clone());
            inner.counters.load_attempts += 1;
            inner.attempts.open_load(slot, Instant::now())
        };
        let _guard = AttemptGuard {
            shared: &self.shared,
            attempt,
        };

        debug!(
            "Attempt {n} for {} ({attempt}) via {:?}: {}",
            track.id, source.variant, source.url
        );
        let request = LoadRequest {
            attempt,
            source,
            start_at: 0.0,
            min_playable: self.shared.config.min_playable_buffer(),
        };
        self.shared.backend.send(slot, MediaCommand::Load(request))?;

        match reply.await {
            Ok(outcome) => outcome,
            // Abandoned by a newer load or stop.
            Err(_) => Err(Error::Superseded),
        }
    }

    // ------------------------------------------------------------------
    // Transport
    // ------------------------------------------------------------------

    /// Start playback, handing off to the next slot if a loaded track waits there.
    pub fn play(&self) -> Result<()> {
        self.update(|inner, out, now| {
            let before = inner.transition.slots().current_id();
            let (start, commands) = inner.transition.play(now)?;
            out.commands.extend(commands);
            match start {
                PlayStart::AlreadyPlaying => {
                    if inner.state != SessionState::Buffering {
                        inner.set_state(out, SessionState::Playing);
                    }
                }
                PlayStart::Resumed => {
                    let position = inner.transition.slots().current().position();
                    inner.stall.on_seek(position, now);
                    inner.set_state(out, SessionState::Playing);
                }
                PlayStart::Started => {
                    self.activate_current(inner, out, now);
                    inner.set_state(out, SessionState::Playing);
                }
                PlayStart::Transition(kind) => {
                    inner.counters.transitions += 1;
                    // Overlap and cut swap roles immediately; sequential swaps on a later tick.
                    if inner.transition.slots().current_id() != before {
                        self.activate_current(inner, out, now);
                    }
                    debug!("{kind:?} hand-off started");
                    inner.set_state(out, SessionState::Transitioning);
                }
            }
            Ok(())
        })
    }

    pub fn pause(&self) -> Result<()> {
        self.update(|inner, out, now| {
            let tick = inner.transition.pause(now)?;
            self.apply_tick(inner, out, tick, now);
            inner.set_state(out, SessionState::Paused);
            Ok(())
        })
    }

    /// Fade out, release both slots and cancel every in-flight load.
    pub fn stop(&self) {
        self.update(|inner, out, now| {
            inner.generation += 1;
            inner.prefetch_generation += 1;
            inner.loading = None;
            inner.prefetching = None;
            for slot in [SlotId::A, SlotId::B] {
                inner.attempts.abandon_slot(slot);
            }
            out.commands.extend(inner.transition.stop(now));
            info!("Playback stopped");
            inner.set_state(out, SessionState::Stopped);
        });
    }

    /// Seek the current track to `seconds`, clamped to its duration.
    pub fn seek(&self, seconds: f64) -> Result<()> {
        if !seconds.is_finite() {
            return Err(Error::InvalidState(format!("invalid seek position {seconds}")));
        }
        self.update(|inner, out, now| {
            let slots = inner.transition.slots();
            let target = if matches!(
                slots.current().phase(),
                SlotPhase::Playing | SlotPhase::Paused | SlotPhase::Ready
            ) {
                slots.current()
            } else if slots.next().phase() == SlotPhase::Ready {
                slots.next()
            } else {
                return Err(Error::NoTrackLoaded);
            };
            let slot = target.id();
            let position = target
                .duration()
                .map_or(seconds.max(0.0), |d| seconds.clamp(0.0, d));

            debug!("Seeking slot {slot} to {position:.2}s");
            out.commands.push((slot, MediaCommand::Seek(position)));
            inner.transition.set_position(slot, position);
            if slot == inner.transition.slots().current_id() {
                inner.stall.on_seek(position, now);
            }
            Ok(())
        })
    }

    pub fn set_volume(&self, volume: f32) {
        self.update(|inner, out, _| {
            out.commands.extend(inner.transition.set_volume(Volume::new(volume)));
            out.diagnostics = true;
        });
    }

    pub fn set_crossfade_mode(&self, mode: CrossfadeMode) {
        self.update(|inner, out, _| {
            inner.transition.set_mode(mode);
            out.diagnostics = true;
        });
    }

    pub fn set_crossfade_duration(&self, duration: Duration) {
        self.update(|inner, out, _| {
            inner.transition.set_duration(duration);
            out.diagnostics = true;
        });
    }

    pub fn set_auto_quality(&self, enabled: bool) {
        self.update(|inner, out, _| {
            info!("Automatic quality {}", if enabled { "enabled" } else { "disabled" });
            if let Some(tier) = inner.quality.set_auto(enabled) {
                Self::advise_quality(inner, out, tier);
            }
            out.diagnostics = true;
        });
    }

    /// Pin a quality tier. Disables automatic selection.
    pub fn set_quality(&self, tier: QualityTier) {
        self.update(|inner, out, _| {
            let tier = inner.quality.force_tier(tier);
            info!("Quality pinned to {tier}");
            Self::advise_quality(inner, out, tier);
        });
    }

    /// Apply a new platform probe result.
    pub fn set_capabilities(&self, capabilities: PlatformCapabilities) {
        self.update(|inner, out, _| {
            if inner.capabilities == capabilities {
                return;
            }
            info!(
                "Platform capabilities changed: {:?} network, ceiling enforced: {}",
                capabilities.network_class, capabilities.enforces_buffer_ceiling
            );
            inner.capabilities = capabilities;
            inner.governor.set_capabilities(&capabilities);
            inner.stall.set_network(capabilities.network_class);
            self.shared
                .retry
                .lock()
                .set_config(self.shared.config.retry_for(capabilities.network_class).clone());
            out.diagnostics = true;
        });
    }

    /// Snapshot of every component's state.
    pub fn get_metrics(&self) -> DiagnosticsSnapshot {
        let inner = self.shared.inner.lock();
        self.snapshot(&inner, Instant::now())
    }

    // ------------------------------------------------------------------
    // Backend signals and the periodic tick
    // ------------------------------------------------------------------

    /// Feed a signal reported by the media backend for `slot`.
    pub fn handle_media_event(&self, slot: SlotId, event: MediaEvent) {
        trace!("<- slot {slot}: {event:?}");
        self.update(|inner, out, now| self.on_media_event(inner, out, now, slot, event));
    }

    /// Advance fades, expire recovery attempts and run stall detection.
    /// Hosts call this periodically (every 50-250 ms).
    pub fn tick(&self) {
        self.update(|inner, out, now| {
            let tick = inner.transition.tick(now);
            self.apply_tick(inner, out, tick, now);

            let timeout = inner.governor.recovery_timeout();
            for (id, pending) in inner.attempts.expire_recoveries(now, timeout) {
                warn!("Recovery attempt {id} timed out after {timeout:?}");
                if pending.slot != inner.transition.slots().current_id() {
                    continue;
                }
                match pending.purpose {
                    AttemptPurpose::GovernorRecovery => {
                        self.governor_recovery_failed(
                            inner,
                            out,
                            now,
                            &Error::timeout(TimeoutStage::Recovery, timeout),
                        );
                    }
                    AttemptPurpose::StallRecovery => inner.stall.on_strategy_failed(),
                    AttemptPurpose::Load => {}
                }
            }

            let should_play = inner.should_be_playing();
            if let Some(action) = inner.stall.check(now, should_play) {
                self.run_stall_action(inner, out, now, action);
            }
        });
    }

    fn on_media_event(
        &self,
        inner: &mut SessionInner,
        out: &mut Outbox,
        now: Instant,
        slot: SlotId,
        event: MediaEvent,
    ) {
        let is_current = slot == inner.transition.slots().current_id();
        match event {
            MediaEvent::Ready { attempt, duration } => {
                self.on_attempt_ready(inner, out, now, slot, attempt, duration);
            }
            MediaEvent::LoadFailed { attempt, error } => {
                self.on_attempt_failed(inner, out, now, attempt, error);
            }
            MediaEvent::TimeUpdate {
                position,
                buffered_ahead,
                buffered_total,
            } => {
                let sample = BufferSample {
                    position,
                    buffered_ahead,
                    buffered_total,
                };
                self.on_time_update(inner, out, now, slot, sample);
            }
            MediaEvent::Playing => {
                if is_current && inner.state == SessionState::Buffering && !inner.stall.is_stalled() {
                    inner.set_state(out, SessionState::Playing);
                }
            }
            MediaEvent::Waiting => {
                if is_current && inner.state == SessionState::Playing {
                    inner.set_state(out, SessionState::Buffering);
                }
            }
            MediaEvent::Ended => self.on_ended(inner, out, slot),
            MediaEvent::Error(error) => self.on_runtime_error(inner, out, now, slot, error),
            MediaEvent::ManifestParsed { tiers } => {
                debug!("Slot {slot} manifest offers {} tiers", tiers.len());
                if let Some(tier) = inner.quality.on_manifest_parsed(&tiers) {
                    Self::advise_quality(inner, out, tier);
                }
            }
            MediaEvent::LevelSwitched(tier) => {
                if is_current {
                    inner.quality.on_level_switched(tier);
                    out.diagnostics = true;
                }
            }
            MediaEvent::FragmentLoaded { bandwidth_bps } => {
                if let Some(tier) = inner.quality.record_bandwidth(bandwidth_bps) {
                    Self::advise_quality(inner, out, tier);
                }
            }
        }
    }

    fn on_attempt_ready(
        &self,
        inner: &mut SessionInner,
        out: &mut Outbox,
        now: Instant,
        slot: SlotId,
        attempt: AttemptId,
        duration: Option<f64>,
    ) {
        let Some(pending) = inner.attempts.settle(attempt) else {
            debug!("Ignoring ready for settled attempt {attempt}");
            return;
        };
        if pending.slot != slot {
            warn!(
                "Attempt {attempt} was issued to slot {} but reported by slot {slot}",
                pending.slot
            );
        }
        match pending.purpose {
            AttemptPurpose::Load => pending.complete(Ok(ReadyInfo { duration })),
            AttemptPurpose::GovernorRecovery => {
                info!("Buffer recovery {attempt} ready");
                inner.governor.on_recovery_succeeded();
                Self::resume_after_recovery(inner, out, pending.slot, now);
            }
            AttemptPurpose::StallRecovery => {
                debug!("Stall recovery {attempt} ready");
                Self::resume_after_recovery(inner, out, pending.slot, now);
            }
        }
    }

    fn on_attempt_failed(
        &self,
        inner: &mut SessionInner,
        out: &mut Outbox,
        now: Instant,
        attempt: AttemptId,
        error: Error,
    ) {
        let Some(pending) = inner.attempts.settle(attempt) else {
            debug!("Ignoring failure for settled attempt {attempt}: {error}");
            return;
        };
        match pending.purpose {
            AttemptPurpose::Load => pending.complete(Err(error)),
            AttemptPurpose::GovernorRecovery => {
                warn!("Buffer recovery {attempt} failed: {error}");
                self.governor_recovery_failed(inner, out, now, &error);
            }
            AttemptPurpose::StallRecovery => {
                warn!("Stall recovery {attempt} failed: {error}");
                inner.stall.on_strategy_failed();
            }
        }
    }

    fn on_time_update(
        &self,
        inner: &mut SessionInner,
        out: &mut Outbox,
        now: Instant,
        slot: SlotId,
        sample: BufferSample,
    ) {
        let ending = inner.transition.observe_time(slot, sample.position);
        if slot != inner.transition.slots().current_id() {
            return;
        }
        inner.stall.on_progress(sample.position, now);
        if inner.state == SessionState::Buffering && !inner.stall.is_stalled() {
            inner.set_state(out, SessionState::Playing);
        }

        for action in inner.governor.observe(sample, now) {
            match action {
                GovernorAction::Advise(pressure) => {
                    out.commands
                        .push((slot, MediaCommand::SetBufferPolicy(pressure.advice())));
                    out.diagnostics = true;
                }
                GovernorAction::Recover { resume_at } => {
                    if self.reload_current(inner, out, now, AttemptPurpose::GovernorRecovery, resume_at, false) {
                        out.emit(SessionEvent::Recovery(RecoveryEvent::BufferFlush { resume_at }));
                    } else {
                        inner.governor.on_recovery_failed();
                    }
                }
            }
        }

        if ending {
            let track_id = inner.transition.slots().current().track_id().map(String::from);
            info!("Track ending, signalling early for overlap");
            out.emit(SessionEvent::TrackEnded { track_id });
        }
    }

    fn on_ended(&self, inner: &mut SessionInner, out: &mut Outbox, slot: SlotId) {
        let current = inner.transition.slots().current();
        if slot != current.id() {
            inner.transition.on_natural_end(slot);
            return;
        }

        if let EndedVerdict::Spurious { resume_at } =
            inner.ended.evaluate(current.position(), current.duration())
        {
            inner.counters.spurious_ended += 1;
            out.commands.push((slot, MediaCommand::Seek(resume_at)));
            out.commands.push((slot, MediaCommand::Play));
            out.emit(SessionEvent::Recovery(RecoveryEvent::SpuriousEnded { resume_at }));
            out.diagnostics = true;
            return;
        }

        let track_id = current.track_id().map(String::from);
        if inner.transition.on_natural_end(slot) {
            info!("Track ended");
            out.emit(SessionEvent::TrackEnded { track_id });
        }
        if !inner.transition.is_transitioning()
            && matches!(inner.state, SessionState::Playing | SessionState::Buffering)
        {
            inner.set_state(out, SessionState::Stopped);
        }
    }

    fn on_runtime_error(
        &self,
        inner: &mut SessionInner,
        out: &mut Outbox,
        now: Instant,
        slot: SlotId,
        error: Error,
    ) {
        if slot != inner.transition.slots().current_id() {
            debug!("Ignoring error from non-current slot {slot}: {error}");
            return;
        }
        warn!("Playback error on slot {slot}: {error}");
        let position = inner.transition.slots().current().position();

        if error.category() == ErrorCategory::BufferCeiling {
            if let Some(resume_at) = inner.governor.on_ceiling_error(position, now) {
                if self.reload_current(inner, out, now, AttemptPurpose::GovernorRecovery, resume_at, false) {
                    out.emit(SessionEvent::Recovery(RecoveryEvent::BufferFlush { resume_at }));
                    return;
                }
                inner.governor.on_recovery_failed();
            }
        }
        if error.category().is_retryable() || error.category() == ErrorCategory::BufferCeiling {
            if let Some(action) = inner.stall.escalate(now) {
                self.run_stall_action(inner, out, now, action);
                return;
            }
        }

        inner.counters.errors_reported += 1;
        inner.set_state(out, SessionState::Error);
        out.error(error);
    }

    fn governor_recovery_failed(
        &self,
        inner: &mut SessionInner,
        out: &mut Outbox,
        now: Instant,
        error: &Error,
    ) {
        if inner.governor.on_recovery_failed() {
            debug!("Escalating to stall ladder after: {error}");
            if let Some(action) = inner.stall.escalate(now) {
                self.run_stall_action(inner, out, now, action);
            }
        }
        out.diagnostics = true;
    }

    fn run_stall_action(
        &self,
        inner: &mut SessionInner,
        out: &mut Outbox,
        now: Instant,
        action: StallAction,
    ) {
        let slot = inner.transition.slots().current_id();
        match action {
            StallAction::Execute {
                strategy,
                rung,
                position,
            } => {
                inner.counters.stall_actions += 1;
                if inner.state == SessionState::Playing {
                    inner.set_state(out, SessionState::Buffering);
                }
                let config = &self.shared.config.stall;
                match strategy {
                    StallStrategy::MicroSeek => {
                        let target = position + config.micro_seek_ms as f64 / 1000.0;
                        out.commands.push((slot, MediaCommand::Seek(target)));
                        out.commands.push((slot, MediaCommand::Play));
                        inner.stall.on_seek(target, now);
                    }
                    StallStrategy::ReloadSource => {
                        if !self.reload_current(inner, out, now, AttemptPurpose::StallRecovery, position, false) {
                            inner.stall.on_strategy_failed();
                        }
                    }
                    StallStrategy::RestartLoader => {
                        out.commands.push((slot, MediaCommand::RestartLoader));
                        out.commands.push((slot, MediaCommand::Play));
                    }
                    StallStrategy::ReassignSource => {
                        let resume_at = (position - config.rewind_ms as f64 / 1000.0).max(0.0);
                        if !self.reload_current(inner, out, now, AttemptPurpose::StallRecovery, resume_at, true) {
                            inner.stall.on_strategy_failed();
                        }
                    }
                }
                out.emit(SessionEvent::Recovery(RecoveryEvent::Stall { strategy, rung }));
                out.diagnostics = true;
            }
            StallAction::CoolDown { .. } => {
                out.emit(SessionEvent::Recovery(RecoveryEvent::StallCoolDown));
                out.diagnostics = true;
            }
            StallAction::Exhausted { position } => {
                inner.counters.errors_reported += 1;
                inner.set_state(out, SessionState::Error);
                out.error(Error::PlaybackStalled { position });
            }
        }
    }

    /// Re-acquire the current slot's source at `start_at`. Returns false when
    /// the slot has nothing to reload.
    fn reload_current(
        &self,
        inner: &mut SessionInner,
        out: &mut Outbox,
        now: Instant,
        purpose: AttemptPurpose,
        start_at: f64,
        reassign: bool,
    ) -> bool {
        let slot = inner.transition.slots().current_id();
        let Some(source) = inner.transition.slots().current().source().cloned() else {
            warn!("No source to reload on slot {slot}");
            return false;
        };
        let attempt = inner.attempts.open_recovery(slot, purpose, now);
        let request = LoadRequest {
            attempt,
            source,
            start_at,
            min_playable: self.shared.config.min_playable_buffer(),
        };
        debug!("Reloading slot {slot} at {start_at:.1}s ({attempt}, {purpose:?})");
        let command = if reassign {
            MediaCommand::Reassign(request)
        } else {
            MediaCommand::Reload(request)
        };
        out.commands.push((slot, command));
        inner.transition.set_position(slot, start_at);
        inner.stall.on_seek(start_at, now);
        true
    }

    fn resume_after_recovery(inner: &mut SessionInner, out: &mut Outbox, slot: SlotId, now: Instant) {
        if slot != inner.transition.slots().current_id() {
            return;
        }
        let current = inner.transition.slots().current();
        if current.phase().is_audible() {
            let gain = inner.transition.gain_at(slot, now);
            out.commands.push((slot, MediaCommand::SetVolume(gain)));
            out.commands.push((slot, MediaCommand::Play));
        }
        out.diagnostics = true;
    }

    /// Reset per-track state for the slot that just became current.
    fn activate_current(&self, inner: &mut SessionInner, out: &mut Outbox, now: Instant) {
        let current = inner.transition.slots().current();
        let slot = current.id();
        let track = current.track().cloned();
        let adaptive = current
            .source()
            .is_some_and(|s| s.variant == SourceVariant::Adaptive);

        // Recoveries belong to the outgoing track and die with it.
        for (id, pending) in inner.attempts.abandon_recoveries(slot.other()) {
            debug!(
                "Dropping {:?} {id} on outgoing slot {}",
                pending.purpose, pending.slot
            );
        }

        inner
            .governor
            .reset_for_track(track.as_ref().and_then(|t| t.bitrate_kbps));
        inner.stall.reset_for_track(now);
        inner.ended.reset();
        inner
            .quality
            .reset_for_track(track.as_ref().and_then(|t| t.max_quality));

        out.commands
            .push((slot, MediaCommand::SetBufferPolicy(PrefetchAdvice::Continue)));
        if adaptive {
            out.commands
                .push((slot, MediaCommand::AdviseQuality(inner.quality.recommended())));
        }
        if let Some(track) = track {
            info!("Now playing {} on slot {slot}", track.display_name());
        }
    }

    fn apply_tick(&self, inner: &mut SessionInner, out: &mut Outbox, tick: TickOutput, now: Instant) {
        out.commands.extend(tick.commands);
        if tick.swapped {
            self.activate_current(inner, out, now);
        }
        if tick.completed.is_some() && inner.state == SessionState::Transitioning {
            inner.set_state(out, SessionState::Playing);
        }
    }

    fn advise_quality(inner: &SessionInner, out: &mut Outbox, tier: QualityTier) {
        let current = inner.transition.slots().current();
        if current
            .source()
            .is_some_and(|s| s.variant == SourceVariant::Adaptive)
        {
            out.commands
                .push((current.id(), MediaCommand::AdviseQuality(tier)));
        }
        out.emit(SessionEvent::QualityAdvised(tier));
        out.diagnostics = true;
    }

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------

    /// Run `f` under the session lock, then deliver what it collected.
    fn update<R>(&self, f: impl FnOnce(&mut SessionInner, &mut Outbox, Instant) -> R) -> R {
        let now = Instant::now();
        let mut outbox = Outbox::default();
        let (result, snapshot) = {
            let mut inner = self.shared.inner.lock();
            let result = f(&mut *inner, &mut outbox, now);
            let snapshot = outbox
                .diagnostics
                .then(|| self.snapshot(&inner, now));
            (result, snapshot)
        };
        self.flush(outbox, snapshot);
        result
    }

    fn flush(&self, outbox: Outbox, snapshot: Option<DiagnosticsSnapshot>) {
        for (slot, command) in outbox.commands {
            trace!("-> slot {slot}: {command:?}");
            if let Err(e) = self.shared.backend.send(slot, command) {
                warn!("Backend rejected command for slot {slot}: {e}");
            }
        }

        let mut events = outbox.events;
        if let Some(snapshot) = snapshot {
            events.push(SessionEvent::Diagnostics(Box::new(snapshot)));
        }
        if events.is_empty() {
            return;
        }
        let callbacks = self.shared.callbacks.lock().clone();
        for event in &events {
            callbacks.dispatch(event);
        }
        let mut subscribers = self.shared.subscribers.lock();
        if !subscribers.is_empty() {
            for event in &events {
                subscribers.broadcast(event);
            }
        }
    }

    fn snapshot(&self, inner: &SessionInner, now: Instant) -> DiagnosticsSnapshot {
        let retry = self.shared.retry.lock();
        let slots = inner.transition.slots();
        let current = slots.current();
        DiagnosticsSnapshot {
            session_id: self.shared.id,
            captured_at: Utc::now(),
            state: inner.state,
            generation: inner.generation,
            track_id: current.track_id().map(String::from),
            position: current.position(),
            duration: current.duration(),
            volume: inner.transition.volume().as_f32(),
            crossfade_mode: inner.transition.mode(),
            crossfade_duration_ms: u64::try_from(inner.transition.duration().as_millis())
                .unwrap_or(u64::MAX),
            network: inner.capabilities.network_class,
            roles: slots.roles(),
            slots: slots.iter().map(SlotSnapshot::from).collect(),
            transition: inner.transition.active(),
            retry: RetrySnapshot {
                breaker: retry.breaker().state(),
                consecutive_failures: retry.breaker().consecutive_failures(),
                trial_in_flight: retry.breaker().trial_in_flight(),
                total_retries: retry.total_retries(),
                recent: retry.history().cloned().collect(),
            },
            quality: inner.quality.state(),
            buffer: inner.governor.state(),
            stall: inner.stall.state(now),
            counters: inner.counters.clone(),
        }
    }

    #[cfg(test)]
    pub(crate) fn force_state(&self, state: SessionState) {
        self.update(|inner, out, _| inner.set_state(out, state));
    }
}
