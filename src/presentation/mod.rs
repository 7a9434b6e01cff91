//! Presentation state machine: exactly one video surface active at a time.
//!
//! Owns the active-surface field. Switching is two-phase: every other surface
//! is paused (bounded by a fallback timeout) and rewound, then the target is
//! reloaded if its language changed and started. A periodic [`reconcile`]
//! re-issues the switch when the host surfaces drift from what was asked of
//! them.
//!
//! [`reconcile`]: PresentationStateMachine::reconcile

pub mod state;
pub mod surface;

pub use state::{PresentationInput, PresentationState, decide};
pub use surface::{MediaSurface, SurfaceId};

use crate::config::{LANGUAGE_PLACEHOLDER, PresentationConfig};
use crate::error::{Result, StageError};
use crate::stream::MediaStream;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const EVENT_CHANNEL_SIZE: usize = 64;

/// Typed notifications for observers of the presentation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresentationEvent {
    StateChanged {
        from: PresentationState,
        to: PresentationState,
    },
    /// Reconciliation found surfaces out of line and re-issued the switch.
    DriftHealed {
        state: PresentationState,
        /// Surfaces that were active when drift was detected.
        active: Vec<SurfaceId>,
    },
    PlaybackFailed {
        surface: SurfaceId,
        error: String,
    },
}

pub struct PresentationStateMachine {
    config: PresentationConfig,
    state: PresentationState,
    language: String,
    surfaces: BTreeMap<SurfaceId, Box<dyn MediaSurface>>,
    loaded: BTreeMap<SurfaceId, String>,
    events: broadcast::Sender<PresentationEvent>,
}

impl PresentationStateMachine {
    /// Build the machine over the host's surfaces. Call [`mount`](Self::mount)
    /// before feeding it inputs.
    pub fn new(config: PresentationConfig, surfaces: Vec<Box<dyn MediaSurface>>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let language = config.default_language.clone();
        let surfaces = surfaces.into_iter().map(|s| (s.id(), s)).collect();
        Self {
            config,
            state: PresentationState::Idle,
            language,
            surfaces,
            loaded: BTreeMap::new(),
            events,
        }
    }

    pub fn state(&self) -> PresentationState {
        self.state
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    /// Whether the current state keeps the microphone closed.
    pub fn demands_mute(&self) -> bool {
        self.state.demands_mute()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PresentationEvent> {
        self.events.subscribe()
    }

    /// Sender half, for handing out subscriptions after the machine moved.
    pub(crate) fn event_sender(&self) -> broadcast::Sender<PresentationEvent> {
        self.events.clone()
    }

    /// Surfaces currently reporting themselves active.
    pub fn active_surfaces(&self) -> Vec<SurfaceId> {
        self.surfaces
            .iter()
            .filter(|(_, s)| s.is_active())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Load the idle loop and start it.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::Playback`] if the idle surface is missing or
    /// refuses to play.
    pub async fn mount(&mut self) -> Result<()> {
        info!(language = %self.language, "presentation mounted");
        self.switch_to(PresentationState::Idle).await
    }

    /// Bind or clear the live stream on the stream sink.
    pub fn attach_stream(&mut self, stream: Option<MediaStream>) {
        if let Some(surface) = self.surfaces.get_mut(&SurfaceId::Stream) {
            surface.attach_stream(stream);
        }
    }

    /// Feed one input through the transition table and switch surfaces.
    ///
    /// Returns the new state, or `None` if the input did not apply. A surface
    /// that fails to play is reported and the presentation falls back to idle.
    pub async fn apply(&mut self, input: PresentationInput) -> Option<PresentationState> {
        if let Some(language) = input.language()
            && language != self.language
        {
            debug!(from = %self.language, to = %language, "presentation language changed");
            self.language = language.to_owned();
        }

        let target = decide(self.state, &input)?;
        if target == self.state && target != PresentationState::Intro {
            return None;
        }
        Some(self.transition(target).await)
    }

    async fn transition(&mut self, target: PresentationState) -> PresentationState {
        let from = self.state;
        let reached = match self.switch_to(target).await {
            Ok(()) => target,
            Err(e) => {
                warn!(%target, "playback failed, falling back to idle: {e}");
                let _ = self.events.send(PresentationEvent::PlaybackFailed {
                    surface: target.surface(),
                    error: e.to_string(),
                });
                if target != PresentationState::Idle
                    && let Err(e) = self.switch_to(PresentationState::Idle).await
                {
                    warn!("idle surface failed as well: {e}");
                }
                PresentationState::Idle
            }
        };
        if reached != from {
            info!(%from, to = %reached, "presentation state changed");
            let _ = self.events.send(PresentationEvent::StateChanged { from, to: reached });
        }
        reached
    }

    /// Two-phase switch: silence everything else, then start `target`.
    async fn switch_to(&mut self, target: PresentationState) -> Result<()> {
        let target_id = target.surface();
        let fallback = Duration::from_millis(self.config.pause_fallback_ms);

        for (id, surface) in &mut self.surfaces {
            if *id == target_id {
                continue;
            }
            if surface.is_active()
                && tokio::time::timeout(fallback, surface.pause()).await.is_err()
            {
                warn!(surface = %id, "pause not confirmed within fallback, continuing");
            }
            surface.seek_to_start();
        }

        self.state = target;

        let source = self.source_for(target_id);
        let Some(surface) = self.surfaces.get_mut(&target_id) else {
            return Err(StageError::Playback(format!("no {target_id} surface mounted")));
        };

        if let Some(source) = source
            && self.loaded.get(&target_id) != Some(&source)
        {
            surface.load(&source).await?;
            debug!(surface = %target_id, %source, "surface source loaded");
            self.loaded.insert(target_id, source);
        }

        // Clips always start from the top; the idle loop and the live stream
        // carry on if they are already running.
        if !matches!(target, PresentationState::Idle | PresentationState::Streaming)
            || !surface.is_active()
        {
            if target != PresentationState::Streaming {
                surface.seek_to_start();
            }
            surface.play().await?;
        }
        Ok(())
    }

    fn source_for(&self, surface: SurfaceId) -> Option<String> {
        let template = match surface {
            SurfaceId::Idle => return Some(self.config.idle_source.clone()),
            SurfaceId::Stream => return None,
            SurfaceId::Intro => &self.config.intro_source,
            SurfaceId::Ending => &self.config.ending_source,
            SurfaceId::Error => &self.config.error_source,
        };
        Some(template.replace(LANGUAGE_PLACEHOLDER, &self.language))
    }

    /// A surface reached the natural end of its source.
    ///
    /// The idle loop rewinds and replays without a state change; the intro,
    /// ending and error clips feed their playback-ended input.
    pub async fn on_surface_ended(&mut self, surface: SurfaceId) -> Option<PresentationState> {
        let input = match surface {
            SurfaceId::Idle => {
                if self.state == PresentationState::Idle
                    && let Some(idle) = self.surfaces.get_mut(&SurfaceId::Idle)
                {
                    idle.seek_to_start();
                    if let Err(e) = idle.play().await {
                        warn!("idle loop restart failed: {e}");
                    }
                }
                return None;
            }
            SurfaceId::Stream => {
                debug!("stream sink ended");
                return None;
            }
            SurfaceId::Intro => PresentationInput::IntroEnded,
            SurfaceId::Ending => PresentationInput::EndingEnded,
            SurfaceId::Error => PresentationInput::ErrorEnded,
        };
        self.apply(input).await
    }

    /// Surfaces that are active but should not be, or `None` when in line.
    ///
    /// Drift is any surface other than the current one being active, or the
    /// current non-idle surface being neither active nor finished.
    pub fn drift(&self) -> Option<Vec<SurfaceId>> {
        let target = self.state.surface();
        let active = self.active_surfaces();
        let stray = active.iter().any(|id| *id != target);
        let stalled = self.state != PresentationState::Idle
            && self
                .surfaces
                .get(&target)
                .is_some_and(|s| !s.is_active() && !s.is_ended());
        (stray || stalled).then_some(active)
    }

    /// Detect drift and heal it by re-issuing the switch. Returns whether
    /// anything had to be healed.
    pub async fn reconcile(&mut self) -> bool {
        let Some(active) = self.drift() else {
            return false;
        };
        let state = self.state;
        warn!(%state, ?active, "presentation drift detected, re-issuing switch");
        let _ = self.events.send(PresentationEvent::DriftHealed { state, active });
        if let Err(e) = self.switch_to(state).await {
            warn!(%state, "drift heal failed: {e}");
            let _ = self.events.send(PresentationEvent::PlaybackFailed {
                surface: state.surface(),
                error: e.to_string(),
            });
        }
        true
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::test_utils::FakeSurface;

    struct Stage {
        machine: PresentationStateMachine,
        surfaces: BTreeMap<SurfaceId, FakeSurface>,
    }

    impl Stage {
        async fn mounted() -> Self {
            let surfaces: BTreeMap<SurfaceId, FakeSurface> =
                SurfaceId::ALL.iter().map(|id| (*id, FakeSurface::new(*id))).collect();
            let boxed = surfaces
                .values()
                .map(|s| Box::new(s.clone()) as Box<dyn MediaSurface>)
                .collect();
            let mut machine = PresentationStateMachine::new(PresentationConfig::default(), boxed);
            machine.mount().await.unwrap();
            Self { machine, surfaces }
        }

        fn surface(&self, id: SurfaceId) -> &FakeSurface {
            &self.surfaces[&id]
        }

        fn assert_exclusive(&self, expected: SurfaceId) {
            assert_eq!(self.machine.active_surfaces(), vec![expected]);
            assert!(self.machine.drift().is_none());
        }
    }

    fn starting(language: &str) -> PresentationInput {
        PresentationInput::SessionStarting {
            language: language.into(),
        }
    }

    #[tokio::test]
    async fn mount_plays_idle_loop() {
        let stage = Stage::mounted().await;
        assert_eq!(stage.machine.state(), PresentationState::Idle);
        stage.assert_exclusive(SurfaceId::Idle);
        assert_eq!(stage.surface(SurfaceId::Idle).loads(), vec!["media/idle.mp4"]);
    }

    #[tokio::test]
    async fn intro_then_stream_is_exclusive() {
        let mut stage = Stage::mounted().await;
        assert_eq!(
            stage.machine.apply(starting("tr")).await,
            Some(PresentationState::Intro)
        );
        stage.assert_exclusive(SurfaceId::Intro);
        assert_eq!(stage.surface(SurfaceId::Intro).loads(), vec!["media/intro_tr.mp4"]);

        assert_eq!(
            stage.machine.apply(PresentationInput::AvatarStartedSpeaking).await,
            Some(PresentationState::Streaming)
        );
        stage.assert_exclusive(SurfaceId::Stream);
        assert!(stage.surface(SurfaceId::Intro).seeks() > 0);
        assert!(!stage.machine.demands_mute());
    }

    #[tokio::test]
    async fn language_reload_only_when_changed() {
        let mut stage = Stage::mounted().await;
        stage.machine.apply(starting("tr")).await;
        stage.machine.apply(PresentationInput::SessionInactive).await;
        stage.machine.apply(starting("tr")).await;
        assert_eq!(stage.surface(SurfaceId::Intro).loads().len(), 1);

        stage.machine.apply(starting("en")).await;
        assert_eq!(
            stage.surface(SurfaceId::Intro).loads(),
            vec!["media/intro_tr.mp4", "media/intro_en.mp4"]
        );
        assert_eq!(stage.machine.language(), "en");
    }

    #[tokio::test]
    async fn ending_plays_then_returns_to_idle() {
        let mut stage = Stage::mounted().await;
        stage.machine.apply(starting("tr")).await;
        stage.machine.apply(PresentationInput::StreamReady).await;
        stage
            .machine
            .apply(PresentationInput::SessionEnding {
                language: "tr".into(),
            })
            .await;
        stage.assert_exclusive(SurfaceId::Ending);
        assert_eq!(stage.surface(SurfaceId::Ending).loads(), vec!["media/ending_tr.mp4"]);

        // The session going inactive must not cut the clip short.
        assert_eq!(stage.machine.apply(PresentationInput::SessionInactive).await, None);

        stage.surface(SurfaceId::Ending).finish();
        assert!(stage.machine.drift().is_none());
        assert_eq!(
            stage.machine.on_surface_ended(SurfaceId::Ending).await,
            Some(PresentationState::Idle)
        );
        stage.assert_exclusive(SurfaceId::Idle);
    }

    #[tokio::test]
    async fn error_clip_and_back() {
        let mut stage = Stage::mounted().await;
        stage.machine.apply(starting("tr")).await;
        stage
            .machine
            .apply(PresentationInput::SessionError {
                language: "tr".into(),
                error: "MISSING_TOKEN".into(),
            })
            .await;
        stage.assert_exclusive(SurfaceId::Error);
        stage.surface(SurfaceId::Error).finish();
        stage.machine.on_surface_ended(SurfaceId::Error).await;
        assert_eq!(stage.machine.state(), PresentationState::Idle);
    }

    #[tokio::test]
    async fn idle_loop_restarts_itself() {
        let mut stage = Stage::mounted().await;
        let mut events = stage.machine.subscribe();
        stage.surface(SurfaceId::Idle).finish();
        assert_eq!(stage.machine.on_surface_ended(SurfaceId::Idle).await, None);
        stage.assert_exclusive(SurfaceId::Idle);
        assert_eq!(stage.surface(SurfaceId::Idle).plays(), 2);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn intro_end_buffers_on_idle() {
        let mut stage = Stage::mounted().await;
        stage.machine.apply(starting("tr")).await;
        stage.surface(SurfaceId::Intro).finish();
        assert_eq!(
            stage.machine.on_surface_ended(SurfaceId::Intro).await,
            Some(PresentationState::Idle)
        );
        assert_eq!(
            stage.machine.apply(PresentationInput::StreamReady).await,
            Some(PresentationState::Streaming)
        );
        stage.assert_exclusive(SurfaceId::Stream);
    }

    #[tokio::test]
    async fn playback_failure_falls_back_to_idle() {
        let mut stage = Stage::mounted().await;
        let mut events = stage.machine.subscribe();
        stage.surface(SurfaceId::Intro).fail_play(true);
        assert_eq!(
            stage.machine.apply(starting("tr")).await,
            Some(PresentationState::Idle)
        );
        stage.assert_exclusive(SurfaceId::Idle);
        assert!(matches!(
            events.try_recv().unwrap(),
            PresentationEvent::PlaybackFailed {
                surface: SurfaceId::Intro,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn unconfirmed_pause_is_bounded() {
        let mut stage = Stage::mounted().await;
        stage.surface(SurfaceId::Idle).hang_pause(true);
        let started = tokio::time::Instant::now();
        stage.machine.apply(starting("tr")).await;
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert_eq!(stage.machine.state(), PresentationState::Intro);
    }

    #[tokio::test]
    async fn reconcile_heals_stray_surface() {
        let mut stage = Stage::mounted().await;
        stage.machine.apply(starting("tr")).await;
        stage.machine.apply(PresentationInput::StreamReady).await;
        let mut events = stage.machine.subscribe();

        // The host ignored the pause and the intro kept playing.
        stage.surface(SurfaceId::Intro).force_active(true);
        assert!(stage.machine.drift().is_some());
        assert!(stage.machine.reconcile().await);
        stage.assert_exclusive(SurfaceId::Stream);
        assert!(!stage.machine.reconcile().await);

        assert_eq!(
            events.try_recv().unwrap(),
            PresentationEvent::DriftHealed {
                state: PresentationState::Streaming,
                active: vec![SurfaceId::Intro, SurfaceId::Stream],
            }
        );
    }

    #[tokio::test]
    async fn reconcile_restarts_stalled_target() {
        let mut stage = Stage::mounted().await;
        stage.machine.apply(starting("tr")).await;
        stage.surface(SurfaceId::Intro).force_active(false);
        assert_eq!(stage.machine.drift(), Some(vec![]));
        assert!(stage.machine.reconcile().await);
        stage.assert_exclusive(SurfaceId::Intro);
    }

    #[tokio::test]
    async fn state_changes_are_published() {
        let mut stage = Stage::mounted().await;
        let mut events = stage.machine.subscribe();
        stage.machine.apply(starting("tr")).await;
        stage.machine.apply(PresentationInput::StreamReady).await;
        assert_eq!(
            events.try_recv().unwrap(),
            PresentationEvent::StateChanged {
                from: PresentationState::Idle,
                to: PresentationState::Intro,
            }
        );
        assert_eq!(
            events.try_recv().unwrap(),
            PresentationEvent::StateChanged {
                from: PresentationState::Intro,
                to: PresentationState::Streaming,
            }
        );
    }

    #[tokio::test]
    async fn any_sequence_leaves_one_surface_active() {
        let mut stage = Stage::mounted().await;
        let inputs = [
            starting("tr"),
            PresentationInput::IntroEnded,
            PresentationInput::StreamReady,
            PresentationInput::AvatarStartedSpeaking,
            starting("en"),
            PresentationInput::SessionError {
                language: "en".into(),
                error: "x".into(),
            },
            PresentationInput::AvatarStartedSpeaking,
            PresentationInput::SessionEnding {
                language: "en".into(),
            },
            PresentationInput::SessionInactive,
            PresentationInput::EndingEnded,
            PresentationInput::SessionInactive,
        ];
        for input in inputs {
            stage.machine.apply(input).await;
            let expected = stage.machine.state().surface();
            stage.assert_exclusive(expected);
        }
    }
}
