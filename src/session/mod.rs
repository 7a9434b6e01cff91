//! Avatar session lifecycle: INACTIVE → CONNECTING → CONNECTED → INACTIVE.
//!
//! Wraps the transport handle, owns the authoritative microphone mute flag,
//! records avatar speech activity, and turns raw transport events into
//! [`SessionEvent`]s for the director.

pub mod mute;
pub mod transport;

pub use mute::{MuteIntent, MuteSource};
pub use transport::{AvatarTransport, ConnectionQuality, TransportEvent, TransportFactory};

use crate::config::{AvatarStartConfig, SessionConfig};
use crate::error::{Result, StageError};
use crate::speech::SharedSpeechActivity;
use crate::stream::MediaStream;
use crate::timer::{self, TimerFired, TimerHandle, TimerKind, Timers};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Session connection state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Inactive,
    Connecting,
    Connected,
}

/// Who said something in the conversation history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    Avatar,
}

/// One committed message of the conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub speaker: Speaker,
    pub text: String,
}

/// What the director needs to hear about after a transport event or timer.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Stream negotiated; the session is now connected.
    StreamReady(MediaStream),
    ConnectionQuality(ConnectionQuality),
    UserStartedSpeaking,
    UserStoppedSpeaking,
    AvatarStartedSpeaking,
    AvatarStoppedSpeaking,
    /// Partial transcript; carries the accumulated text so far.
    AvatarTalking(String),
    /// A full avatar message was committed to the history.
    MessageCommitted(ChatMessage),
    /// Disconnect received mid-utterance; re-checked after the grace window.
    DisconnectDeferred { attempt: u32 },
    /// The connection is gone and the session must be stopped.
    Disconnected,
}

/// Owner of the transport handle and the session state.
pub struct SessionLifecycle {
    config: SessionConfig,
    factory: Arc<dyn TransportFactory>,
    timers: Timers,
    speech: SharedSpeechActivity,
    state: SessionState,
    transport: Option<Box<dyn AvatarTransport>>,
    events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    stream: Option<MediaStream>,
    quality: ConnectionQuality,
    history: Vec<ChatMessage>,
    pending_message: String,
    mute: MuteIntent,
    applied_mute: Option<bool>,
    disconnect_recheck: Option<TimerHandle>,
    disconnect_attempts: u32,
}

impl SessionLifecycle {
    pub fn new(
        config: SessionConfig,
        factory: Arc<dyn TransportFactory>,
        timers: Timers,
        speech: SharedSpeechActivity,
    ) -> Self {
        Self {
            config,
            factory,
            timers,
            speech,
            state: SessionState::Inactive,
            transport: None,
            events: None,
            stream: None,
            quality: ConnectionQuality::Unknown,
            history: Vec::new(),
            pending_message: String::new(),
            mute: MuteIntent::default(),
            applied_mute: None,
            disconnect_recheck: None,
            disconnect_attempts: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stream(&self) -> Option<&MediaStream> {
        self.stream.as_ref()
    }

    pub fn quality(&self) -> ConnectionQuality {
        self.quality
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    pub fn speech(&self) -> &SharedSpeechActivity {
        &self.speech
    }

    /// The single authoritative "is the microphone muted" flag.
    pub fn is_muted(&self) -> bool {
        self.mute.is_muted()
    }

    pub fn mute_intent(&self) -> MuteIntent {
        self.mute
    }

    /// Start a session.
    ///
    /// A supplied `token` always builds a fresh transport handle; without one
    /// the previous handle is reused.
    ///
    /// # Errors
    ///
    /// - [`StageError::AlreadyActive`] unless the session is INACTIVE.
    /// - [`StageError::MissingToken`] if there is no handle and no token.
    /// - Transport construction/start failures are propagated after the
    ///   state has been returned to INACTIVE.
    pub async fn start(&mut self, config: &AvatarStartConfig, token: Option<&str>) -> Result<()> {
        if self.state != SessionState::Inactive {
            return Err(StageError::AlreadyActive);
        }
        if token.is_none() && self.transport.is_none() {
            return Err(StageError::MissingToken);
        }

        self.state = SessionState::Connecting;
        info!(avatar = %config.avatar_name, language = %config.language, "session connecting");

        if let Some(token) = token {
            match self.factory.construct(token, &self.config.base_path) {
                Ok(handle) => self.transport = Some(handle),
                Err(e) => {
                    self.state = SessionState::Inactive;
                    warn!("transport construction failed: {e}");
                    return Err(e);
                }
            }
        }

        let Some(transport) = self.transport.as_mut() else {
            self.state = SessionState::Inactive;
            return Err(StageError::MissingToken);
        };
        self.events = Some(transport.subscribe());

        if let Err(e) = transport.start(config).await {
            self.events = None;
            self.state = SessionState::Inactive;
            warn!("transport start failed: {e}");
            return Err(match e {
                StageError::TransportInit(_) => e,
                other if other.is_network() => other,
                other => StageError::TransportInit(other.to_string()),
            });
        }

        // A fresh handle has never been told about the mute state.
        self.applied_mute = None;
        self.apply_mute();
        Ok(())
    }

    /// Stop the session. Returns `false` if it was already INACTIVE.
    ///
    /// Teardown always completes locally; a failing transport stop is logged.
    pub async fn stop(&mut self) -> bool {
        if self.state == SessionState::Inactive {
            debug!("stop requested while inactive, ignoring");
            return false;
        }

        self.history.clear();
        self.pending_message.clear();
        self.mute.force();
        self.apply_mute();
        self.stream = None;
        self.events = None;
        self.disconnect_recheck = None;
        self.disconnect_attempts = 0;
        self.quality = ConnectionQuality::Unknown;

        if let Some(transport) = self.transport.as_mut()
            && let Err(e) = transport.stop().await
        {
            warn!("transport stop failed, continuing teardown: {e}");
        }

        self.speech.reset();
        self.state = SessionState::Inactive;
        info!("session stopped");
        true
    }

    /// Record a mute demand and push the resulting flag to the transport.
    pub fn set_mute(&mut self, source: MuteSource, muted: bool) {
        self.mute.set(source, muted);
        self.apply_mute();
    }

    fn apply_mute(&mut self) {
        let muted = self.mute.is_muted();
        if self.applied_mute == Some(muted) {
            return;
        }
        if let Some(transport) = self.transport.as_mut() {
            if muted {
                transport.mute();
            } else {
                transport.unmute();
            }
            self.applied_mute = Some(muted);
            debug!(muted, "microphone mute applied");
        }
    }

    /// Next upstream event. Pends forever while no subscription is live.
    pub async fn next_event(&mut self) -> TransportEvent {
        loop {
            let received = match self.events.as_mut() {
                Some(rx) => rx.recv().await,
                None => std::future::pending().await,
            };
            match received {
                Some(event) => return event,
                None => {
                    debug!("transport event channel closed");
                    self.events = None;
                }
            }
        }
    }

    /// Fold one upstream event into session state.
    pub fn handle_transport_event(&mut self, event: TransportEvent) -> Option<SessionEvent> {
        let now = Instant::now();
        match event {
            TransportEvent::StreamReady(stream) => {
                if self.state == SessionState::Inactive {
                    debug!("stream ready after stop, ignoring");
                    return None;
                }
                self.state = SessionState::Connected;
                self.stream = Some(stream.clone());
                info!(stream = %stream.id, "session connected");
                Some(SessionEvent::StreamReady(stream))
            }
            TransportEvent::StreamDisconnected => self.on_disconnected(),
            TransportEvent::ConnectionQualityChanged(quality) => {
                self.quality = quality;
                Some(SessionEvent::ConnectionQuality(quality))
            }
            TransportEvent::UserStartedSpeaking => Some(SessionEvent::UserStartedSpeaking),
            TransportEvent::UserStoppedSpeaking => Some(SessionEvent::UserStoppedSpeaking),
            TransportEvent::AvatarStartedSpeaking => {
                self.speech.avatar_started(now);
                Some(SessionEvent::AvatarStartedSpeaking)
            }
            TransportEvent::AvatarStoppedSpeaking => {
                self.speech.avatar_stopped(now);
                Some(SessionEvent::AvatarStoppedSpeaking)
            }
            TransportEvent::TalkingMessage(fragment) => {
                self.speech.touch(now);
                self.pending_message.push_str(&fragment);
                Some(SessionEvent::AvatarTalking(self.pending_message.clone()))
            }
            TransportEvent::EndMessage => {
                let text = std::mem::take(&mut self.pending_message);
                if text.trim().is_empty() {
                    return None;
                }
                let message = ChatMessage {
                    speaker: Speaker::Avatar,
                    text,
                };
                self.history.push(message.clone());
                Some(SessionEvent::MessageCommitted(message))
            }
        }
    }

    fn on_disconnected(&mut self) -> Option<SessionEvent> {
        if self.state == SessionState::Inactive {
            return None;
        }
        if self.disconnect_recheck.is_some() {
            debug!(
                attempt = self.disconnect_attempts,
                "stream disconnected again, recheck already pending"
            );
            return None;
        }
        if self.speech.is_avatar_speaking() {
            self.disconnect_attempts = 1;
            self.arm_disconnect_recheck();
            info!("stream disconnected mid-utterance, deferring stop");
            return Some(SessionEvent::DisconnectDeferred { attempt: 1 });
        }
        info!("stream disconnected");
        Some(SessionEvent::Disconnected)
    }

    fn arm_disconnect_recheck(&mut self) {
        let grace = Duration::from_millis(self.config.disconnect_grace_ms);
        self.disconnect_recheck = Some(self.timers.arm(TimerKind::DisconnectRecheck, grace));
    }

    /// Handle a timer owned by the session. Returns `None` for stale fires.
    pub fn on_timer(&mut self, fired: &TimerFired) -> Option<SessionEvent> {
        if !timer::claim(&mut self.disconnect_recheck, fired) {
            return None;
        }
        if self.state == SessionState::Inactive {
            return None;
        }
        if !self.speech.is_avatar_speaking() {
            info!("avatar silent at disconnect recheck, stopping");
            return Some(SessionEvent::Disconnected);
        }
        if self.disconnect_attempts >= self.config.max_disconnect_rechecks {
            warn!(
                attempts = self.disconnect_attempts,
                "avatar still flagged as speaking after disconnect, stopping anyway"
            );
            return Some(SessionEvent::Disconnected);
        }
        self.disconnect_attempts += 1;
        self.arm_disconnect_recheck();
        Some(SessionEvent::DisconnectDeferred {
            attempt: self.disconnect_attempts,
        })
    }

    pub fn disconnect_recheck_armed(&self) -> bool {
        self.disconnect_recheck.is_some()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::test_utils::{FakeTransportFactory, TransportCall};
    use tokio::sync::mpsc::error::TryRecvError;

    fn lifecycle(factory: &FakeTransportFactory) -> (SessionLifecycle, mpsc::UnboundedReceiver<TimerFired>) {
        let (timers, rx) = Timers::channel();
        let session = SessionLifecycle::new(
            SessionConfig::default(),
            Arc::new(factory.clone()),
            timers,
            SharedSpeechActivity::new(),
        );
        (session, rx)
    }

    #[tokio::test]
    async fn start_without_token_or_handle_fails() {
        let factory = FakeTransportFactory::new();
        let (mut session, _rx) = lifecycle(&factory);
        let err = session
            .start(&AvatarStartConfig::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::MissingToken));
        assert_eq!(session.state(), SessionState::Inactive);
    }

    #[tokio::test]
    async fn start_moves_to_connecting_then_connected_on_stream() {
        let factory = FakeTransportFactory::new();
        let (mut session, _rx) = lifecycle(&factory);
        session
            .start(&AvatarStartConfig::default(), Some("tok"))
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Connecting);
        assert_eq!(factory.tokens(), vec!["tok".to_owned()]);

        let event = session.handle_transport_event(TransportEvent::StreamReady(
            MediaStream::video_only("s1"),
        ));
        assert!(matches!(event, Some(SessionEvent::StreamReady(_))));
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.stream().map(|s| s.id.as_str()), Some("s1"));
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let factory = FakeTransportFactory::new();
        let (mut session, _rx) = lifecycle(&factory);
        let config = AvatarStartConfig::default();
        session.start(&config, Some("tok")).await.unwrap();
        let err = session.start(&config, Some("tok")).await.unwrap_err();
        assert!(matches!(err, StageError::AlreadyActive));
    }

    #[tokio::test]
    async fn failing_transport_start_returns_to_inactive() {
        let factory = FakeTransportFactory::new();
        factory.fail_next_start("ice negotiation failed");
        let (mut session, _rx) = lifecycle(&factory);
        let err = session
            .start(&AvatarStartConfig::default(), Some("tok"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "TRANSPORT_INIT");
        assert_eq!(session.state(), SessionState::Inactive);
    }

    #[tokio::test]
    async fn construct_failure_propagates() {
        let factory = FakeTransportFactory::new();
        factory.fail_construct("bad base path");
        let (mut session, _rx) = lifecycle(&factory);
        let err = session
            .start(&AvatarStartConfig::default(), Some("tok"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "TRANSPORT_INIT");
        assert_eq!(session.state(), SessionState::Inactive);
    }

    #[tokio::test]
    async fn restart_without_token_reuses_handle() {
        let factory = FakeTransportFactory::new();
        let (mut session, _rx) = lifecycle(&factory);
        let config = AvatarStartConfig::default();
        session.start(&config, Some("tok")).await.unwrap();
        assert!(session.stop().await);
        session.start(&config, None).await.unwrap();
        assert_eq!(factory.tokens().len(), 1);
        assert_eq!(factory.count(TransportCall::Start), 2);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let factory = FakeTransportFactory::new();
        let (mut session, _rx) = lifecycle(&factory);
        session
            .start(&AvatarStartConfig::default(), Some("tok"))
            .await
            .unwrap();
        session.handle_transport_event(TransportEvent::TalkingMessage("Hello".into()));
        session.handle_transport_event(TransportEvent::EndMessage);
        assert_eq!(session.history().len(), 1);

        assert!(session.stop().await);
        assert!(!session.stop().await);
        assert_eq!(factory.count(TransportCall::Stop), 1);
        assert!(session.history().is_empty());
        assert!(session.is_muted());
        assert!(session.stream().is_none());
        assert_eq!(session.state(), SessionState::Inactive);
    }

    #[tokio::test]
    async fn stop_survives_transport_failure() {
        let factory = FakeTransportFactory::new();
        factory.fail_stop("socket already closed");
        let (mut session, _rx) = lifecycle(&factory);
        session
            .start(&AvatarStartConfig::default(), Some("tok"))
            .await
            .unwrap();
        assert!(session.stop().await);
        assert_eq!(session.state(), SessionState::Inactive);
    }

    #[tokio::test]
    async fn mute_changes_reach_transport_once() {
        let factory = FakeTransportFactory::new();
        let (mut session, _rx) = lifecycle(&factory);
        session
            .start(&AvatarStartConfig::default(), Some("tok"))
            .await
            .unwrap();
        assert_eq!(factory.count(TransportCall::Mute), 1);

        session.set_mute(MuteSource::Presentation, false);
        assert!(!session.is_muted());
        session.set_mute(MuteSource::VolumeGate, true);
        session.set_mute(MuteSource::User, true);
        assert!(session.is_muted());
        assert_eq!(factory.count(TransportCall::Unmute), 1);
        assert_eq!(factory.count(TransportCall::Mute), 2);
    }

    #[tokio::test]
    async fn talking_fragments_accumulate_until_end_message() {
        let factory = FakeTransportFactory::new();
        let (mut session, _rx) = lifecycle(&factory);
        session
            .start(&AvatarStartConfig::default(), Some("tok"))
            .await
            .unwrap();
        session.handle_transport_event(TransportEvent::TalkingMessage("Merhaba, ".into()));
        let partial = session.handle_transport_event(TransportEvent::TalkingMessage("nasılsınız?".into()));
        assert!(matches!(partial, Some(SessionEvent::AvatarTalking(ref t)) if t == "Merhaba, nasılsınız?"));
        let committed = session.handle_transport_event(TransportEvent::EndMessage);
        assert!(matches!(committed, Some(SessionEvent::MessageCommitted(_))));
        assert!(session.handle_transport_event(TransportEvent::EndMessage).is_none());
    }

    #[tokio::test]
    async fn events_are_forwarded_from_subscription() {
        let factory = FakeTransportFactory::new();
        let (mut session, _rx) = lifecycle(&factory);
        session
            .start(&AvatarStartConfig::default(), Some("tok"))
            .await
            .unwrap();
        factory.emit(TransportEvent::AvatarStartedSpeaking);
        let event = session.next_event().await;
        assert!(matches!(event, TransportEvent::AvatarStartedSpeaking));
        session.handle_transport_event(event);
        assert!(session.speech().is_avatar_speaking());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_while_silent_stops_immediately() {
        let factory = FakeTransportFactory::new();
        let (mut session, mut rx) = lifecycle(&factory);
        session
            .start(&AvatarStartConfig::default(), Some("tok"))
            .await
            .unwrap();
        let event = session.handle_transport_event(TransportEvent::StreamDisconnected);
        assert!(matches!(event, Some(SessionEvent::Disconnected)));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_mid_utterance_is_deferred_then_proceeds() {
        let factory = FakeTransportFactory::new();
        let (mut session, mut rx) = lifecycle(&factory);
        session
            .start(&AvatarStartConfig::default(), Some("tok"))
            .await
            .unwrap();
        session.handle_transport_event(TransportEvent::AvatarStartedSpeaking);
        let event = session.handle_transport_event(TransportEvent::StreamDisconnected);
        assert!(matches!(event, Some(SessionEvent::DisconnectDeferred { attempt: 1 })));

        tokio::time::sleep(Duration::from_millis(1000)).await;
        session.handle_transport_event(TransportEvent::AvatarStoppedSpeaking);

        tokio::time::sleep(Duration::from_millis(2001)).await;
        let fired = rx.recv().await.unwrap();
        assert!(matches!(session.on_timer(&fired), Some(SessionEvent::Disconnected)));
        assert!(!session.disconnect_recheck_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn deferred_disconnect_gives_up_after_max_rechecks() {
        let factory = FakeTransportFactory::new();
        let (mut session, mut rx) = lifecycle(&factory);
        session
            .start(&AvatarStartConfig::default(), Some("tok"))
            .await
            .unwrap();
        session.handle_transport_event(TransportEvent::AvatarStartedSpeaking);
        session.handle_transport_event(TransportEvent::StreamDisconnected);

        let mut outcomes = Vec::new();
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(3001)).await;
            let fired = rx.recv().await.unwrap();
            outcomes.push(session.on_timer(&fired));
        }
        assert!(matches!(outcomes[0], Some(SessionEvent::DisconnectDeferred { attempt: 2 })));
        assert!(matches!(outcomes[1], Some(SessionEvent::DisconnectDeferred { attempt: 3 })));
        assert!(matches!(outcomes[2], Some(SessionEvent::Disconnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_disconnects_do_not_extend_the_grace_window() {
        let factory = FakeTransportFactory::new();
        let (mut session, mut rx) = lifecycle(&factory);
        session
            .start(&AvatarStartConfig::default(), Some("tok"))
            .await
            .unwrap();
        session.handle_transport_event(TransportEvent::AvatarStartedSpeaking);
        let first = session.handle_transport_event(TransportEvent::StreamDisconnected);
        assert!(matches!(first, Some(SessionEvent::DisconnectDeferred { attempt: 1 })));

        let mut outcomes = Vec::new();
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            assert!(session
                .handle_transport_event(TransportEvent::StreamDisconnected)
                .is_none());
            tokio::time::sleep(Duration::from_millis(1501)).await;
            let fired = rx.recv().await.unwrap();
            outcomes.push(session.on_timer(&fired));
        }
        assert!(matches!(outcomes[0], Some(SessionEvent::DisconnectDeferred { attempt: 2 })));
        assert!(matches!(outcomes[1], Some(SessionEvent::DisconnectDeferred { attempt: 3 })));
        assert!(matches!(outcomes[2], Some(SessionEvent::Disconnected)));
        assert!(!session.disconnect_recheck_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_pending_disconnect_recheck() {
        let factory = FakeTransportFactory::new();
        let (mut session, mut rx) = lifecycle(&factory);
        session
            .start(&AvatarStartConfig::default(), Some("tok"))
            .await
            .unwrap();
        session.handle_transport_event(TransportEvent::AvatarStartedSpeaking);
        session.handle_transport_event(TransportEvent::StreamDisconnected);
        session.stop().await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
        assert!(!session.speech().is_avatar_speaking());
    }
}
