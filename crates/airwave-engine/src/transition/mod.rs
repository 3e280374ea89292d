//! Dual-slot gapless transitions.
//!
//! The engine owns the [`SlotPair`] and every fade running on it. It never
//! talks to the backend directly: each operation returns the slot-addressed
//! commands the session forwards once its lock is released.

pub mod fade;
pub mod slots;

pub use fade::{Fade, FadeCurve};
pub use slots::{PlaybackSlot, SlotId, SlotPair, SlotPhase, SlotRoles};

use std::time::Duration;

use airwave_core::{CrossfadeMode, Error, ResolvedSource, Result, Track, Volume};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::backend::MediaCommand;

/// A command addressed to one slot.
pub type SlotCommand = (SlotId, MediaCommand);

/// Gain changes smaller than this are not forwarded.
const GAIN_STEP: f32 = 0.002;

/// Kind of hand-off in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionKind {
    Overlap,
    Sequential,
    Cut,
}

impl TransitionKind {
    const fn for_mode(mode: CrossfadeMode) -> Self {
        match mode {
            CrossfadeMode::Overlap => Self::Overlap,
            CrossfadeMode::Sequential => Self::Sequential,
            CrossfadeMode::None => Self::Cut,
        }
    }
}

/// What `play` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayStart {
    AlreadyPlaying,
    Resumed,
    /// The next slot started with nothing audible to hand off from.
    Started,
    Transition(TransitionKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FadeEnd {
    Hold,
    Pause,
    Release,
    /// Sequential mode: release the outgoing slot, swap, fade the next one in.
    SwapAndStart,
}

#[derive(Debug, Clone, Copy)]
struct ActiveFade {
    slot: SlotId,
    fade: Fade,
    end: FadeEnd,
    last_sent: f32,
}

/// Result of advancing fades.
#[derive(Debug, Default)]
pub struct TickOutput {
    pub commands: Vec<SlotCommand>,
    /// Set when a hand-off finished during this tick.
    pub completed: Option<TransitionKind>,
    /// Set when the current role moved during this tick.
    pub swapped: bool,
}

pub struct TransitionEngine {
    slots: SlotPair,
    mode: CrossfadeMode,
    duration: Duration,
    click_guard: Duration,
    curve: FadeCurve,
    target: Volume,
    fades: Vec<ActiveFade>,
    active: Option<TransitionKind>,
    completed: u64,
}

impl TransitionEngine {
    pub fn new(mode: CrossfadeMode, duration: Duration, click_guard: Duration) -> Self {
        Self {
            slots: SlotPair::new(),
            mode,
            duration,
            click_guard,
            curve: FadeCurve::default(),
            target: Volume::default(),
            fades: Vec::new(),
            active: None,
            completed: 0,
        }
    }

    pub const fn slots(&self) -> &SlotPair {
        &self.slots
    }

    pub const fn mode(&self) -> CrossfadeMode {
        self.mode
    }

    pub const fn duration(&self) -> Duration {
        self.duration
    }

    pub const fn volume(&self) -> Volume {
        self.target
    }

    pub const fn is_transitioning(&self) -> bool {
        self.active.is_some()
    }

    pub const fn active(&self) -> Option<TransitionKind> {
        self.active
    }

    pub const fn completed_transitions(&self) -> u64 {
        self.completed
    }

    pub fn set_mode(&mut self, mode: CrossfadeMode) {
        debug!("Crossfade mode {} -> {}", self.mode.as_str(), mode.as_str());
        self.mode = mode;
    }

    pub fn set_duration(&mut self, duration: Duration) {
        self.duration = duration;
    }

    /// Loads always target the non-current slot.
    pub const fn load_slot(&self) -> SlotId {
        self.slots.next_id()
    }

    pub(crate) fn begin_load(&mut self, slot: SlotId, track: &Track) {
        self.fades.retain(|f| f.slot != slot);
        let target = self.slots.get_mut(slot);
        target.clear();
        target.phase = SlotPhase::Loading;
        target.duration = track.duration;
        target.track = Some(track.clone());
    }

    pub(crate) fn set_source(&mut self, slot: SlotId, source: ResolvedSource) {
        self.slots.get_mut(slot).source = Some(source);
    }

    /// Move a slot's position without evaluating the ending latch.
    pub(crate) fn set_position(&mut self, slot: SlotId, position: f64) {
        self.slots.get_mut(slot).position = position;
    }

    /// The slot reached the minimum playable buffer. `claimed` is false for a
    /// prefetch nobody asked to play yet.
    pub(crate) fn mark_loaded(&mut self, slot: SlotId, duration: Option<f64>, claimed: bool) {
        let target = self.slots.get_mut(slot);
        target.phase = if claimed {
            SlotPhase::Ready
        } else {
            SlotPhase::Primed
        };
        if duration.is_some() {
            target.duration = duration;
        }
    }

    /// Promote a prefetched slot to ready.
    pub(crate) fn claim(&mut self, slot: SlotId) -> bool {
        let target = self.slots.get_mut(slot);
        if target.phase == SlotPhase::Primed {
            target.phase = SlotPhase::Ready;
            true
        } else {
            false
        }
    }

    /// Drop whatever a slot holds and release it.
    pub(crate) fn discard(&mut self, slot: SlotId) -> Vec<SlotCommand> {
        self.fades.retain(|f| f.slot != slot);
        let target = self.slots.get_mut(slot);
        if target.phase == SlotPhase::Idle && target.track.is_none() {
            return Vec::new();
        }
        target.clear();
        vec![(slot, MediaCommand::Release)]
    }

    /// Start or resume playback, handing off to a ready next slot if there is one.
    pub fn play(&mut self, now: Instant) -> Result<(PlayStart, Vec<SlotCommand>)> {
        if self.is_transitioning() {
            return Err(Error::TransitionInProgress);
        }
        let mut commands = Vec::new();

        if self.slots.next().phase == SlotPhase::Ready {
            let outgoing = self.slots.current_id();
            if !self.slots.current().phase.is_audible() {
                commands.extend(self.discard(outgoing));
                self.slots.swap();
                let incoming = self.slots.current_id();
                self.start_slot(incoming, 0.0, self.click_guard, now, &mut commands);
                return Ok((PlayStart::Started, commands));
            }

            let kind = TransitionKind::for_mode(self.mode);
            info!("Starting {kind:?} transition from slot {outgoing}");
            match kind {
                TransitionKind::Overlap => {
                    let length = self.duration.max(self.click_guard);
                    self.slots.swap();
                    let incoming = self.slots.current_id();
                    self.fade_out(outgoing, length, FadeEnd::Release, now);
                    self.start_slot(incoming, 0.0, length, now, &mut commands);
                }
                TransitionKind::Sequential => {
                    let length = self.duration.max(self.click_guard);
                    self.fade_out(outgoing, length, FadeEnd::SwapAndStart, now);
                }
                TransitionKind::Cut => {
                    self.slots.swap();
                    let incoming = self.slots.current_id();
                    self.fade_out(outgoing, self.click_guard, FadeEnd::Release, now);
                    self.start_slot(incoming, 0.0, self.click_guard, now, &mut commands);
                }
            }
            self.active = Some(kind);
            return Ok((PlayStart::Transition(kind), commands));
        }

        let current = self.slots.current_id();
        match self.slots.current().phase {
            SlotPhase::Playing => Ok((PlayStart::AlreadyPlaying, commands)),
            SlotPhase::Paused => {
                let from = self.gain_at(current, now);
                self.start_slot(current, from, self.click_guard, now, &mut commands);
                Ok((PlayStart::Resumed, commands))
            }
            SlotPhase::Ready => {
                self.start_slot(current, 0.0, self.click_guard, now, &mut commands);
                Ok((PlayStart::Started, commands))
            }
            _ => Err(Error::NoTrackLoaded),
        }
    }

    /// Fade the current slot out and pause it.
    pub fn pause(&mut self, now: Instant) -> Result<TickOutput> {
        let out = if self.is_transitioning() {
            self.finish_now(now)
        } else {
            TickOutput::default()
        };
        let current = self.slots.current_id();
        match self.slots.current().phase {
            SlotPhase::Playing => {
                self.fade_out(current, self.click_guard, FadeEnd::Pause, now);
                self.slots.get_mut(current).phase = SlotPhase::Paused;
                Ok(out)
            }
            SlotPhase::Paused => Ok(out),
            _ => Err(Error::NoTrackLoaded),
        }
    }

    /// Fade out whatever is audible and release both slots.
    pub fn stop(&mut self, now: Instant) -> Vec<SlotCommand> {
        self.fades.clear();
        self.active = None;
        let mut commands = Vec::new();

        let next = self.slots.next_id();
        commands.extend(self.discard(next));

        let current = self.slots.current_id();
        if self.slots.current().phase.is_audible() {
            self.fade_out(current, self.click_guard, FadeEnd::Release, now);
            self.slots.get_mut(current).phase = SlotPhase::Ended;
        } else {
            commands.extend(self.discard(current));
        }
        commands
    }

    pub fn set_volume(&mut self, volume: Volume) -> Vec<SlotCommand> {
        self.target = volume;
        let level = volume.as_f32();
        for active in &mut self.fades {
            if active.fade.is_fade_in() || active.end == FadeEnd::Hold {
                active.fade.to = level;
            }
        }

        let current = self.slots.current_id();
        let fading = self.fades.iter().any(|f| f.slot == current);
        if self.slots.current().phase.is_audible() && !fading {
            self.slots.get_mut(current).gain = level;
            vec![(current, MediaCommand::SetVolume(level))]
        } else {
            Vec::new()
        }
    }

    /// Gain a slot has at `now`, including any running fade.
    pub fn gain_at(&self, slot: SlotId, now: Instant) -> f32 {
        self.fades
            .iter()
            .find(|f| f.slot == slot)
            .map_or(self.slots.get(slot).gain, |f| f.fade.gain_at(now))
    }

    /// Record a position for `slot`. Returns true when the proactive
    /// "track ending" signal should fire.
    pub fn observe_time(&mut self, slot: SlotId, position: f64) -> bool {
        let overlap = self.mode == CrossfadeMode::Overlap;
        let lead = self.duration.as_secs_f64();
        let is_current = slot == self.slots.current_id();
        let target = self.slots.get_mut(slot);
        target.position = position;

        if !is_current || !overlap || target.ending_latched || !target.phase.is_audible() {
            return false;
        }
        let Some(duration) = target.duration else {
            return false;
        };
        if position > 0.0 && duration - position <= lead {
            debug!(
                "Slot {slot} has {:.2}s left, signalling track end early",
                duration - position
            );
            target.ending_latched = true;
            return true;
        }
        false
    }

    /// The backend reported end of media. Returns true when "track ended"
    /// should fire; false when the latch already fired it.
    pub fn on_natural_end(&mut self, slot: SlotId) -> bool {
        let is_current = slot == self.slots.current_id();
        let target = self.slots.get_mut(slot);
        if target.phase.is_audible() {
            target.phase = SlotPhase::Ended;
        }
        if !is_current {
            return false;
        }
        if target.ending_latched {
            debug!("Natural end on slot {slot} suppressed by ending latch");
            return false;
        }
        target.ending_latched = true;
        true
    }

    /// Advance fades to `now`.
    pub fn tick(&mut self, now: Instant) -> TickOutput {
        self.advance(now, false)
    }

    /// Complete every running fade immediately.
    pub fn finish_now(&mut self, now: Instant) -> TickOutput {
        self.advance(now, true)
    }

    fn advance(&mut self, now: Instant, force: bool) -> TickOutput {
        let mut out = TickOutput::default();
        // SwapAndStart adds a fade, so forced completion may need a second pass.
        loop {
            let mut finished = Vec::new();
            for active in &mut self.fades {
                let done = force || active.fade.is_complete(now);
                let gain = if done {
                    active.fade.to
                } else {
                    active.fade.gain_at(now)
                };
                if done || (gain - active.last_sent).abs() >= GAIN_STEP {
                    out.commands.push((active.slot, MediaCommand::SetVolume(gain)));
                    active.last_sent = gain;
                }
                self.slots.get_mut(active.slot).gain = gain;
                if done {
                    finished.push((active.slot, active.end));
                }
            }
            if finished.is_empty() {
                break;
            }
            self.fades
                .retain(|f| !finished.iter().any(|(slot, _)| *slot == f.slot));
            for (slot, end) in finished {
                self.run_end(slot, end, now, &mut out);
            }
            if !force {
                break;
            }
        }

        if let Some(kind) = self.active {
            if self.fades.is_empty() {
                info!("{kind:?} transition complete, current slot {}", self.slots.current_id());
                self.active = None;
                self.completed += 1;
                out.completed = Some(kind);
            }
        }
        out
    }

    fn run_end(&mut self, slot: SlotId, end: FadeEnd, now: Instant, out: &mut TickOutput) {
        match end {
            FadeEnd::Hold => {}
            FadeEnd::Pause => out.commands.push((slot, MediaCommand::Pause)),
            FadeEnd::Release => {
                let phase = self.slots.get(slot).phase;
                if matches!(phase, SlotPhase::Playing | SlotPhase::Paused | SlotPhase::Ended) {
                    out.commands.extend(self.discard(slot));
                }
            }
            FadeEnd::SwapAndStart => {
                out.commands.extend(self.discard(slot));
                self.slots.swap();
                out.swapped = true;
                let incoming = self.slots.current_id();
                let length = self.duration.max(self.click_guard);
                self.start_slot(incoming, 0.0, length, now, &mut out.commands);
            }
        }
    }

    fn start_slot(
        &mut self,
        slot: SlotId,
        from: f32,
        length: Duration,
        now: Instant,
        commands: &mut Vec<SlotCommand>,
    ) {
        self.fades.retain(|f| f.slot != slot);
        let target = self.slots.get_mut(slot);
        target.phase = SlotPhase::Playing;
        target.gain = from;
        commands.push((slot, MediaCommand::SetVolume(from)));
        commands.push((slot, MediaCommand::Play));
        self.fades.push(ActiveFade {
            slot,
            fade: Fade::new(from, self.target.as_f32(), now, length, self.curve),
            end: FadeEnd::Hold,
            last_sent: from,
        });
    }

    fn fade_out(&mut self, slot: SlotId, length: Duration, end: FadeEnd, now: Instant) {
        let from = self.gain_at(slot, now);
        self.fades.retain(|f| f.slot != slot);
        self.fades.push(ActiveFade {
            slot,
            fade: Fade::new(from, 0.0, now, length, self.curve),
            end,
            last_sent: from,
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const CLICK: Duration = Duration::from_millis(120);

    fn engine(mode: CrossfadeMode, millis: u64) -> TransitionEngine {
        TransitionEngine::new(mode, Duration::from_millis(millis), CLICK)
    }

    fn load(engine: &mut TransitionEngine, id: &str, duration: f64) -> SlotId {
        let slot = engine.load_slot();
        engine.begin_load(slot, &Track::new(id).with_duration(duration));
        engine.mark_loaded(slot, Some(duration), true);
        slot
    }

    /// Engine with one track playing at full target gain.
    fn playing(mode: CrossfadeMode, millis: u64) -> (TransitionEngine, Instant) {
        let mut engine = engine(mode, millis);
        let start = Instant::now();
        load(&mut engine, "t1", 180.0);
        let (started, _) = engine.play(start).unwrap();
        assert_eq!(started, PlayStart::Started);
        let settled = start + CLICK;
        engine.tick(settled);
        (engine, settled)
    }

    #[test]
    fn test_first_play_swaps_and_fades_in_from_silence() {
        let mut engine = engine(CrossfadeMode::Overlap, 3000);
        let now = Instant::now();
        let slot = load(&mut engine, "t1", 180.0);
        assert_eq!(slot, SlotId::B);

        let (_, commands) = engine.play(now).unwrap();
        assert_eq!(engine.slots().current_id(), SlotId::B);
        assert_eq!(
            &commands[..2],
            &[
                (SlotId::B, MediaCommand::SetVolume(0.0)),
                (SlotId::B, MediaCommand::Play)
            ]
        );
        assert!(!engine.is_transitioning());

        let out = engine.tick(now + CLICK);
        assert!(out
            .commands
            .contains(&(SlotId::B, MediaCommand::SetVolume(Volume::DEFAULT.as_f32()))));
    }

    #[test]
    fn test_play_is_idempotent() {
        let (mut engine, now) = playing(CrossfadeMode::Overlap, 3000);
        let (started, commands) = engine.play(now).unwrap();
        assert_eq!(started, PlayStart::AlreadyPlaying);
        assert!(commands.is_empty());
    }

    #[test]
    fn test_overlap_swaps_immediately_and_releases_outgoing() {
        let (mut engine, now) = playing(CrossfadeMode::Overlap, 500);
        let outgoing = engine.slots().current_id();
        load(&mut engine, "t2", 200.0);

        let (started, _) = engine.play(now).unwrap();
        assert_eq!(started, PlayStart::Transition(TransitionKind::Overlap));
        assert_ne!(engine.slots().current_id(), outgoing);
        assert!(matches!(engine.play(now), Err(Error::TransitionInProgress)));

        let out = engine.tick(now + Duration::from_millis(500));
        assert_eq!(out.completed, Some(TransitionKind::Overlap));
        assert!(out.commands.contains(&(outgoing, MediaCommand::Release)));
        assert_eq!(engine.slots().get(outgoing).phase(), SlotPhase::Idle);
        assert!(!engine.is_transitioning());
    }

    #[test]
    fn test_sequential_swaps_after_fade_out() {
        let (mut engine, now) = playing(CrossfadeMode::Sequential, 400);
        let outgoing = engine.slots().current_id();
        load(&mut engine, "t2", 200.0);

        engine.play(now).unwrap();
        assert_eq!(engine.slots().current_id(), outgoing);
        assert!(
            engine
                .gain_at(outgoing.other(), now + Duration::from_millis(200))
                .abs()
                < f32::EPSILON
        );

        let mid = engine.tick(now + Duration::from_millis(400));
        assert!(mid.swapped);
        assert!(mid.completed.is_none());
        assert_eq!(engine.slots().current_id(), outgoing.other());

        let done = engine.tick(now + Duration::from_millis(800));
        assert_eq!(done.completed, Some(TransitionKind::Sequential));
    }

    #[test]
    fn test_cut_uses_click_guard() {
        let (mut engine, now) = playing(CrossfadeMode::None, 3000);
        load(&mut engine, "t2", 200.0);
        engine.play(now).unwrap();
        let out = engine.tick(now + CLICK);
        assert_eq!(out.completed, Some(TransitionKind::Cut));
    }

    #[test]
    fn test_proactive_end_latch_suppresses_natural_end() {
        let (mut engine, _) = playing(CrossfadeMode::Overlap, 500);
        let current = engine.slots().current_id();
        assert!(!engine.observe_time(current, 170.0));
        assert!(engine.observe_time(current, 179.6));
        assert!(!engine.observe_time(current, 179.8));
        assert!(!engine.on_natural_end(current));
    }

    #[test]
    fn test_natural_end_fires_once_without_overlap() {
        let (mut engine, _) = playing(CrossfadeMode::Sequential, 500);
        let current = engine.slots().current_id();
        assert!(!engine.observe_time(current, 179.9));
        assert!(engine.on_natural_end(current));
        assert!(!engine.on_natural_end(current));
    }

    #[test]
    fn test_loading_next_does_not_rearm_outgoing_latch() {
        let (mut engine, now) = playing(CrossfadeMode::Overlap, 500);
        let first = engine.slots().current_id();
        assert!(engine.observe_time(first, 179.6));
        load(&mut engine, "t2", 200.0);
        engine.play(now).unwrap();
        // The outgoing slot's natural end arrives mid-crossfade.
        assert!(!engine.on_natural_end(first));
        assert!(!engine.slots().current().is_ending_latched());
    }

    #[test]
    fn test_pause_fades_then_pauses_and_resume_fades_in() {
        let (mut engine, now) = playing(CrossfadeMode::Overlap, 500);
        let current = engine.slots().current_id();
        engine.pause(now).unwrap();
        assert_eq!(engine.slots().current().phase(), SlotPhase::Paused);
        let out = engine.tick(now + CLICK);
        assert!(out.commands.contains(&(current, MediaCommand::Pause)));

        let (started, commands) = engine.play(now + CLICK).unwrap();
        assert_eq!(started, PlayStart::Resumed);
        assert!(commands.contains(&(current, MediaCommand::Play)));
    }

    #[test]
    fn test_stop_fades_then_releases() {
        let (mut engine, now) = playing(CrossfadeMode::Overlap, 500);
        let current = engine.slots().current_id();
        assert!(engine.stop(now).is_empty());
        let out = engine.tick(now + CLICK);
        assert!(out.commands.contains(&(current, MediaCommand::Release)));
        assert!(matches!(engine.play(now + CLICK), Err(Error::NoTrackLoaded)));
    }

    #[test]
    fn test_set_volume_applies_immediately_when_idle() {
        let (mut engine, _) = playing(CrossfadeMode::Overlap, 500);
        let current = engine.slots().current_id();
        let commands = engine.set_volume(Volume::new(0.4));
        assert_eq!(commands, vec![(current, MediaCommand::SetVolume(0.4))]);
    }

    proptest! {
        #[test]
        fn prop_overlap_conserves_volume(
            millis in 120u64..6_000,
            level in 0.05f32..=1.0,
            samples in prop::collection::vec(0.0f64..=1.0, 1..40),
        ) {
            let mut engine = engine(CrossfadeMode::Overlap, millis);
            engine.set_volume(Volume::new(level));
            let start = Instant::now();
            load(&mut engine, "t1", 300.0);
            engine.play(start).unwrap();
            let settled = start + CLICK;
            engine.tick(settled);

            let old = engine.slots().current_id();
            load(&mut engine, "t2", 300.0);
            engine.play(settled).unwrap();
            let new = engine.slots().current_id();
            let d = Duration::from_millis(millis);

            prop_assert!((engine.gain_at(old, settled) - level).abs() < 1e-5);
            prop_assert!(engine.gain_at(new, settled).abs() < 1e-6);
            for p in samples {
                let t = settled + d.mul_f64(p);
                let sum = engine.gain_at(old, t) + engine.gain_at(new, t);
                prop_assert!((sum - level).abs() < 1e-4, "sum {} at p={}", sum, p);
            }
            prop_assert!(engine.gain_at(old, settled + d).abs() < 1e-6);
            prop_assert!((engine.gain_at(new, settled + d) - level).abs() < 1e-6);
        }

        #[test]
        fn prop_exactly_one_current_slot(ops in prop::collection::vec(0u8..6, 1..60)) {
            let mut engine = engine(CrossfadeMode::Overlap, 300);
            let mut now = Instant::now();
            let mut n = 0u32;
            for op in ops {
                match op {
                    0 if !engine.is_transitioning() => {
                        n += 1;
                        load(&mut engine, &format!("t{n}"), 120.0);
                    }
                    1 => { let _ = engine.play(now); }
                    2 => { let _ = engine.pause(now); }
                    3 => { engine.stop(now); }
                    4 => { now += Duration::from_millis(100); engine.tick(now); }
                    5 => { engine.finish_now(now); }
                    _ => {}
                }
                let roles = engine.slots().roles();
                prop_assert_ne!(roles.current, roles.next);
                prop_assert_eq!(engine.slots().current().id(), roles.current);
                prop_assert_eq!(
                    engine.slots().iter().filter(|s| s.id() == roles.current).count(),
                    1
                );
                if !engine.is_transitioning() {
                    prop_assert_ne!(engine.slots().next().phase(), SlotPhase::Playing);
                }
            }
        }
    }
}
