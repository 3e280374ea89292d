//! Scripted radio playlist played against the simulated backend.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use airwave_core::{EngineConfig, Error, PlatformCapabilities, SourceHint, Track};
use airwave_engine::sim::{drive, LoadScript, SimulatedBackend, StaticResolver};
use airwave_engine::{DiagnosticsSnapshot, PlaybackSession, PrefetchOutcome, SessionEvent, SessionState};
use anyhow::{Context, Result};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use url::Url;

const BASE_URL: &str = "https://media.airwave.local/";

/// What to play and which faults to inject.
#[derive(Debug, Clone)]
pub struct ScenarioOptions {
    pub tracks: usize,
    pub track_length: Duration,
    pub capabilities: PlatformCapabilities,
    pub adaptive: bool,
    /// Network failures scripted ahead of the first load.
    pub fail_first: u32,
    /// Freeze playback this long after the run starts.
    pub stall_at: Option<Duration>,
    pub stall_for: Duration,
    pub tick: Duration,
    pub report_every: Duration,
    pub json: bool,
    pub seed: Option<u64>,
}

impl Default for ScenarioOptions {
    fn default() -> Self {
        Self {
            tracks: 3,
            track_length: Duration::from_secs(20),
            capabilities: PlatformCapabilities::default(),
            adaptive: false,
            fail_first: 0,
            stall_at: None,
            stall_for: Duration::from_secs(6),
            tick: Duration::from_millis(100),
            report_every: Duration::from_secs(1),
            json: false,
            seed: None,
        }
    }
}

#[derive(Debug)]
pub struct Outcome {
    pub played: usize,
    pub snapshot: DiagnosticsSnapshot,
}

/// Stall injection window.
#[derive(Debug, Default)]
struct StallScript {
    active: bool,
    done: bool,
}

impl StallScript {
    fn apply(&mut self, backend: &SimulatedBackend, options: &ScenarioOptions, elapsed: Duration) {
        let Some(at) = options.stall_at else {
            return;
        };
        if !self.active && !self.done && elapsed >= at {
            warn!("Injecting stall for {:?}", options.stall_for);
            backend.set_stalled(true);
            self.active = true;
        } else if self.active && elapsed >= at + options.stall_for {
            info!("Releasing injected stall");
            backend.set_stalled(false);
            self.active = false;
            self.done = true;
        }
    }
}

fn playlist(options: &ScenarioOptions) -> Vec<Track> {
    let seconds = options.track_length.as_secs_f64();
    (1..=options.tracks)
        .map(|n| Track::new(format!("track-{n:02}")).with_duration(seconds))
        .collect()
}

/// Play the scripted playlist to the end, or until `shutdown` resolves.
pub async fn run(
    config: EngineConfig,
    options: ScenarioOptions,
    shutdown: impl Future<Output = ()>,
) -> Result<Outcome> {
    let backend = Arc::new(SimulatedBackend::new());
    backend.set_default_duration(options.track_length.as_secs_f64());
    backend.script(
        (0..options.fail_first).map(|_| LoadScript::Fail(Error::Network("injected failure".into()))),
    );

    let mut resolver = StaticResolver::new(Url::parse(BASE_URL).context("Invalid media base URL")?);
    if options.adaptive {
        resolver = resolver.with_adaptive();
    }
    let mut builder = PlaybackSession::builder(Arc::new(resolver), backend.clone())
        .config(config)
        .capabilities(options.capabilities);
    if let Some(seed) = options.seed {
        builder = builder.seed(seed);
    }
    let session = builder.build().context("Failed to create playback session")?;
    info!("Session {} ready, {} tracks queued", session.id(), options.tracks);

    let pump = tokio::spawn(drive(session.clone(), backend.clone(), options.tick));
    let played = play_through(&session, &backend, &options, shutdown).await;
    pump.abort();

    Ok(Outcome {
        played: played?,
        snapshot: session.get_metrics(),
    })
}

async fn play_through(
    session: &PlaybackSession,
    backend: &SimulatedBackend,
    options: &ScenarioOptions,
    shutdown: impl Future<Output = ()>,
) -> Result<usize> {
    let events = session.subscribe();
    let mut queue = playlist(options).into_iter();
    let first = queue.next().context("Playlist is empty")?;
    start(session, first).await?;
    let mut played = 1;
    let mut upcoming = queue.next();
    let mut prefetched = false;

    let started = Instant::now();
    let mut stall = StallScript::default();
    let mut last_report = started;
    let mut poll = tokio::time::interval(options.tick);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = poll.tick() => {}
            () = &mut shutdown => {
                warn!("Interrupted, stopping playback");
                session.stop();
                return Ok(played);
            }
        }
        stall.apply(backend, options, started.elapsed());

        let mut advance = false;
        for event in events.try_iter() {
            match event {
                SessionEvent::TrackEnded { track_id } => {
                    info!("Track {} ending", track_id.as_deref().unwrap_or("?"));
                    advance = true;
                }
                SessionEvent::StateChanged { from, to } => info!("State {from} -> {to}"),
                SessionEvent::Recovery(recovery) => info!("Recovery: {recovery:?}"),
                SessionEvent::Error {
                    error,
                    category,
                    retryable,
                } => warn!("Session error ({}, retryable: {retryable}): {error}", category.as_str()),
                SessionEvent::Diagnostics(_) => {}
                other => debug!("{other:?}"),
            }
        }

        if !prefetched {
            if let Some(next) = &upcoming {
                prefetched = prefetch_when_halfway(session, next).await;
            }
        }

        if advance {
            if let Some(next) = upcoming.take() {
                start(session, next).await?;
                played += 1;
                upcoming = queue.next();
                prefetched = false;
            }
        }

        if last_report.elapsed() >= options.report_every {
            report(&session.get_metrics(), options.json)?;
            last_report = Instant::now();
        }

        match session.state() {
            SessionState::Stopped if upcoming.is_none() => {
                info!("Playlist finished");
                return Ok(played);
            }
            SessionState::Error => {
                warn!("Session entered the error state, giving up");
                return Ok(played);
            }
            _ => {}
        }
    }
}

async fn start(session: &PlaybackSession, track: Track) -> Result<()> {
    let id = track.id.clone();
    let loaded = session
        .load_track(track, SourceHint::Auto)
        .await
        .with_context(|| format!("Failed to load {id}"))?;
    info!(
        "Loaded {id} into slot {}{}",
        loaded.slot,
        if loaded.from_prefetch { " (prefetched)" } else { "" }
    );
    session.play().with_context(|| format!("Failed to play {id}"))?;
    Ok(())
}

/// Prefetch `next` once the current track is half played. Returns true once
/// no further attempt is needed.
async fn prefetch_when_halfway(session: &PlaybackSession, next: &Track) -> bool {
    let snapshot = session.get_metrics();
    let halfway = snapshot
        .duration
        .is_some_and(|duration| snapshot.position >= duration / 2.0);
    if !halfway {
        return false;
    }
    match session.prefetch_next(next.clone(), SourceHint::Auto).await {
        Ok(PrefetchOutcome::Deferred(reason)) => {
            debug!("Prefetch of {} deferred: {reason:?}", next.id);
            false
        }
        Ok(_) => true,
        Err(e) => {
            warn!("Prefetch of {} failed: {e}", next.id);
            true
        }
    }
}

fn report(snapshot: &DiagnosticsSnapshot, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(snapshot)?);
        return Ok(());
    }
    info!(
        "{} {} at {:.1}s | breaker {:?} | buffer {:?} | quality {}",
        snapshot.state,
        snapshot.track_id.as_deref().unwrap_or("-"),
        snapshot.position,
        snapshot.retry.breaker,
        snapshot.buffer.pressure,
        snapshot.quality.recommended_tier,
    );
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use airwave_core::CrossfadeMode;

    fn options(tracks: usize, seconds: u64) -> ScenarioOptions {
        ScenarioOptions {
            tracks,
            track_length: Duration::from_secs(seconds),
            tick: Duration::from_millis(50),
            report_every: Duration::from_secs(60),
            seed: Some(11),
            ..ScenarioOptions::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_playlist_runs_to_the_end_after_retries() {
        let mut config = EngineConfig::default();
        config.crossfade_mode = CrossfadeMode::Overlap;
        config.crossfade_duration_ms = 1_000;
        let options = ScenarioOptions {
            fail_first: 2,
            ..options(2, 8)
        };

        let outcome = run(config, options, std::future::pending()).await.unwrap();
        assert_eq!(outcome.played, 2);
        let snapshot = outcome.snapshot;
        assert_eq!(snapshot.state, SessionState::Stopped);
        assert_eq!(snapshot.retry.recent.len(), 2);
        assert_eq!(snapshot.counters.prefetches_adopted, 1);
        assert_eq!(snapshot.counters.transitions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_injected_stall_is_recovered() {
        let options = ScenarioOptions {
            stall_at: Some(Duration::from_secs(2)),
            stall_for: Duration::from_secs(5),
            ..options(1, 15)
        };

        let outcome = run(EngineConfig::default(), options, std::future::pending())
            .await
            .unwrap();
        let snapshot = outcome.snapshot;
        assert_eq!(snapshot.state, SessionState::Stopped);
        assert!(snapshot.counters.stall_actions >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_playback() {
        let outcome = run(
            EngineConfig::default(),
            options(3, 30),
            tokio::time::sleep(Duration::from_secs(2)),
        )
        .await
        .unwrap();
        assert_eq!(outcome.played, 1);
        assert_eq!(outcome.snapshot.state, SessionState::Stopped);
    }
}
