//! The stage director: one select loop that owns every component.
//!
//! All state changes happen on this task. Transport events, timer fires,
//! volume-gate actions, surface notifications and user commands are
//! serialised through a single `tokio::select!`, so components never race
//! each other; they only return intents that the director carries out.

use crate::config::StageConfig;
use crate::ending::{EndingIntent, EndingSequencer};
use crate::error::{Result, StageError};
use crate::presentation::{
    MediaSurface, PresentationEvent, PresentationInput, PresentationState,
    PresentationStateMachine, SurfaceId,
};
use crate::runtime::{AppSignal, StageEvent};
use crate::services::{SessionRegistry, TokenService, sweep_sessions};
use crate::session::{
    MuteSource, SessionEvent, SessionLifecycle, SessionState, TransportEvent, TransportFactory,
};
use crate::speech::SharedSpeechActivity;
use crate::timer::{TimerFired, Timers};
use crate::volume::{GateAction, GateSignal, VolumeGate};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const EVENT_CHANNEL_SIZE: usize = 128;

/// Requests from the UI shell.
#[derive(Debug, Clone)]
pub enum StageCommand {
    /// Start a session; `None` uses the configured avatar language.
    StartSession { language: Option<String> },
    StopSession,
    /// The user's own microphone toggle.
    SetMicrophoneMuted(bool),
    /// A surface reached the natural end of its source.
    SurfaceEnded(SurfaceId),
    /// A signal raised by the shell itself.
    Signal(AppSignal),
    Shutdown,
}

/// External collaborators the director drives.
pub struct StageParts {
    pub transports: Arc<dyn TransportFactory>,
    pub tokens: Arc<dyn TokenService>,
    pub registry: Arc<dyn SessionRegistry>,
    pub surfaces: Vec<Box<dyn MediaSurface>>,
}

/// Cloneable handle for talking to a running director.
#[derive(Clone)]
pub struct StageHandle {
    commands: mpsc::UnboundedSender<StageCommand>,
    events: broadcast::Sender<StageEvent>,
    presentation: broadcast::Sender<PresentationEvent>,
    cancel: CancellationToken,
}

impl StageHandle {
    pub fn send(&self, command: StageCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn start_session(&self, language: Option<&str>) -> bool {
        self.send(StageCommand::StartSession {
            language: language.map(str::to_owned),
        })
    }

    pub fn stop_session(&self) -> bool {
        self.send(StageCommand::StopSession)
    }

    pub fn set_microphone_muted(&self, muted: bool) -> bool {
        self.send(StageCommand::SetMicrophoneMuted(muted))
    }

    pub fn surface_ended(&self, surface: SurfaceId) -> bool {
        self.send(StageCommand::SurfaceEnded(surface))
    }

    pub fn signal(&self, signal: AppSignal) -> bool {
        self.send(StageCommand::Signal(signal))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StageEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_presentation(&self) -> broadcast::Receiver<PresentationEvent> {
        self.presentation.subscribe()
    }

    /// Stop the loop after it tears the session down.
    pub fn shutdown(&self) {
        if !self.send(StageCommand::Shutdown) {
            self.cancel.cancel();
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

pub struct StageDirector {
    config: StageConfig,
    session: SessionLifecycle,
    ending: EndingSequencer,
    presentation: PresentationStateMachine,
    tokens: Arc<dyn TokenService>,
    registry: Arc<dyn SessionRegistry>,
    gate: Option<VolumeGate>,
    gate_generation: u64,
    gate_tx: mpsc::UnboundedSender<GateSignal>,
    gate_rx: mpsc::UnboundedReceiver<GateSignal>,
    timer_rx: mpsc::UnboundedReceiver<TimerFired>,
    commands: mpsc::UnboundedReceiver<StageCommand>,
    events: broadcast::Sender<StageEvent>,
    cancel: CancellationToken,
    language: String,
}

impl StageDirector {
    pub fn new(config: StageConfig, parts: StageParts) -> (Self, StageHandle) {
        let (timers, timer_rx) = Timers::channel();
        let (gate_tx, gate_rx) = mpsc::unbounded_channel();
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let cancel = CancellationToken::new();
        let speech = SharedSpeechActivity::new();
        let language = config.session.avatar.language.clone();

        let session = SessionLifecycle::new(
            config.session.clone(),
            parts.transports,
            timers.clone(),
            speech.clone(),
        );
        let ending = EndingSequencer::new(config.ending.clone(), timers, speech, &language);
        let presentation =
            PresentationStateMachine::new(config.presentation.clone(), parts.surfaces);

        let handle = StageHandle {
            commands: command_tx,
            events: events.clone(),
            presentation: presentation.event_sender(),
            cancel: cancel.clone(),
        };
        let director = Self {
            config,
            session,
            ending,
            presentation,
            tokens: parts.tokens,
            registry: parts.registry,
            gate: None,
            gate_generation: 0,
            gate_tx,
            gate_rx,
            timer_rx,
            commands,
            events,
            cancel,
            language,
        };
        (director, handle)
    }

    /// Run until shutdown.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::Playback`] if the idle loop cannot be mounted.
    pub async fn run(mut self) -> Result<()> {
        self.presentation.mount().await?;
        self.sync_presentation_mute();

        let mut reconcile = tokio::time::interval(Duration::from_millis(
            self.config.presentation.reconcile_interval_ms,
        ));
        reconcile.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("stage director running");

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                command = self.commands.recv() => match command {
                    None | Some(StageCommand::Shutdown) => break,
                    Some(command) => self.on_command(command).await,
                },
                event = self.session.next_event() => self.on_transport_event(event).await,
                Some(fired) = self.timer_rx.recv() => self.on_timer(fired).await,
                Some(signal) = self.gate_rx.recv() => self.on_gate_signal(signal),
                _ = reconcile.tick() => {
                    if self.presentation.reconcile().await {
                        self.sync_presentation_mute();
                    }
                }
            }
        }

        self.ending.reset();
        self.teardown().await;
        info!("stage director stopped");
        Ok(())
    }

    async fn on_command(&mut self, command: StageCommand) {
        debug!(?command, "stage command");
        match command {
            StageCommand::StartSession { language } => {
                let language =
                    language.unwrap_or_else(|| self.config.session.avatar.language.clone());
                if let Err(e) = self.start_session(&language).await {
                    warn!(code = e.code(), "session start failed: {e}");
                }
            }
            StageCommand::StopSession => {
                self.ending.reset();
                self.teardown().await;
            }
            StageCommand::SetMicrophoneMuted(muted) => self.set_mute(MuteSource::User, muted),
            StageCommand::SurfaceEnded(surface) => {
                self.presentation.on_surface_ended(surface).await;
                self.sync_presentation_mute();
            }
            StageCommand::Signal(signal) => self.present(signal.to_presentation_input()).await,
            StageCommand::Shutdown => {}
        }
    }

    async fn start_session(&mut self, language: &str) -> Result<()> {
        if self.session.state() != SessionState::Inactive {
            return Err(StageError::AlreadyActive);
        }
        // A settle timer left by the previous session must not end this one.
        self.ending.reset();
        self.language = language.to_owned();
        self.ending.set_language(language);
        self.signal(AppSignal::SessionStarting {
            language: language.to_owned(),
        })
        .await;

        let started = match self.tokens.fetch_token().await {
            Ok(token) => {
                let avatar = self.config.session.avatar.with_language(language);
                self.session.start(&avatar, Some(&token)).await
            }
            Err(e) => Err(e),
        };

        match started {
            Ok(()) => {
                self.publish(StageEvent::SessionStateChanged {
                    from: SessionState::Inactive,
                    to: self.session.state(),
                });
                Ok(())
            }
            Err(e) => {
                self.signal(AppSignal::SessionError {
                    language: language.to_owned(),
                    error: e.code().to_owned(),
                })
                .await;
                Err(e)
            }
        }
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        let before = self.session.state();
        if let Some(event) = self.session.handle_transport_event(event) {
            self.on_session_event(before, event).await;
        }
    }

    async fn on_session_event(&mut self, before: SessionState, event: SessionEvent) {
        match event {
            SessionEvent::StreamReady(stream) => {
                if before != SessionState::Connected {
                    self.publish(StageEvent::SessionStateChanged {
                        from: before,
                        to: SessionState::Connected,
                    });
                }
                self.presentation.attach_stream(Some(stream.clone()));
                if let Some(mut old) = self.gate.take() {
                    old.stop();
                    self.set_mute(MuteSource::VolumeGate, false);
                }
                self.gate_generation += 1;
                self.gate = Some(VolumeGate::start(
                    &self.config.volume,
                    self.gate_generation,
                    stream.audio_source(),
                    self.gate_tx.clone(),
                ));
                self.present(PresentationInput::StreamReady).await;
            }
            SessionEvent::ConnectionQuality(quality) => {
                self.publish(StageEvent::ConnectionQuality(quality));
            }
            SessionEvent::UserStartedSpeaking => self.ending.on_activity(),
            SessionEvent::UserStoppedSpeaking => debug!("user stopped speaking"),
            SessionEvent::AvatarStartedSpeaking => {
                self.ending.on_activity();
                self.signal(AppSignal::AvatarStartTalking).await;
            }
            SessionEvent::AvatarStoppedSpeaking => self.ending.on_avatar_stopped(),
            SessionEvent::AvatarTalking(text) => self.publish(StageEvent::AvatarTalking { text }),
            SessionEvent::MessageCommitted(message) => {
                self.publish(StageEvent::MessageCommitted(message));
            }
            SessionEvent::DisconnectDeferred { attempt } => {
                debug!(attempt, "disconnect deferred while the avatar is speaking");
                self.ending.on_session_stopped();
            }
            SessionEvent::Disconnected => self.teardown().await,
        }
    }

    async fn on_timer(&mut self, fired: TimerFired) {
        let before = self.session.state();
        if let Some(event) = self.session.on_timer(&fired) {
            self.on_session_event(before, event).await;
            return;
        }
        match self.ending.on_timer(&fired, Instant::now()) {
            Some(EndingIntent::StopSession) => self.teardown().await,
            Some(EndingIntent::ShowEnding { language }) => {
                self.signal(AppSignal::SessionEnding { language }).await;
            }
            None => {}
        }
    }

    fn on_gate_signal(&mut self, signal: GateSignal) {
        if !self.gate.as_ref().is_some_and(|gate| gate.accepts(&signal)) {
            debug!(?signal, "stale gate action, ignoring");
            return;
        }
        self.set_mute(MuteSource::VolumeGate, signal.action == GateAction::Mute);
    }

    /// Local teardown; spawns the remote sweep if a session was actually torn down.
    async fn teardown(&mut self) {
        if let Some(mut gate) = self.gate.take() {
            gate.stop();
        }
        self.presentation.attach_stream(None);
        self.ending.on_session_stopped();

        let before = self.session.state();
        let was_muted = self.session.is_muted();
        if !self.session.stop().await {
            return;
        }
        self.publish(StageEvent::SessionStateChanged {
            from: before,
            to: SessionState::Inactive,
        });
        if self.session.is_muted() != was_muted {
            self.publish(StageEvent::MicrophoneMuted { muted: true });
        }
        self.present(PresentationInput::SessionInactive).await;
        self.spawn_cleanup();
    }

    fn spawn_cleanup(&self) {
        let registry = Arc::clone(&self.registry);
        let config = self.config.services.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let report = sweep_sessions(registry.as_ref(), &config).await;
            let _ = events.send(StageEvent::CleanupFinished(report));
        });
    }

    /// Broadcast a signal and feed it to the presentation.
    async fn signal(&mut self, signal: AppSignal) {
        let input = signal.to_presentation_input();
        self.publish(StageEvent::Signal(signal));
        self.present(input).await;
    }

    async fn present(&mut self, input: PresentationInput) {
        self.presentation.apply(input).await;
        self.sync_presentation_mute();
    }

    fn sync_presentation_mute(&mut self) {
        let demand = self.presentation.demands_mute();
        self.set_mute(MuteSource::Presentation, demand);
    }

    fn set_mute(&mut self, source: MuteSource, muted: bool) {
        let before = self.session.is_muted();
        self.session.set_mute(source, muted);
        let after = self.session.is_muted();
        if before != after {
            debug!(?source, muted = after, "microphone mute changed");
            self.publish(StageEvent::MicrophoneMuted { muted: after });
        }
    }

    fn publish(&self, event: StageEvent) {
        let _ = self.events.send(event);
    }

    pub fn presentation_state(&self) -> PresentationState {
        self.presentation.state()
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    pub fn language(&self) -> &str {
        &self.language
    }
}
