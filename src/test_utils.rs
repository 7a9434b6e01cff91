//! Fakes for the stage's external collaborators, shared by unit and
//! integration tests.
//!
//! Every fake is a cheap handle over shared state: hand one clone to the
//! code under test and keep another to script failures and inspect calls.

use crate::config::AvatarStartConfig;
use crate::error::{Result, StageError};
use crate::presentation::{MediaSurface, SurfaceId};
use crate::services::{RemoteSession, SessionRegistry, TokenService};
use crate::session::{AvatarTransport, TransportEvent, TransportFactory};
use crate::stream::MediaStream;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Deterministic broadband noise in `-amplitude..amplitude`.
pub fn noise_frame(amplitude: f32, len: usize) -> Vec<f32> {
    let mut seed: u32 = 0x1234_5678;
    (0..len)
        .map(|_| {
            seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            let unit = (seed >> 8) as f32 / (1u32 << 24) as f32;
            amplitude * (unit * 2.0 - 1.0)
        })
        .collect()
}

// ── Transport ─────────────────────────────────────────────────────

/// Calls observed by [`FakeTransportFactory`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportCall {
    Start,
    Stop,
    Mute,
    Unmute,
}

#[derive(Default)]
struct TransportState {
    tokens: Vec<String>,
    calls: Vec<TransportCall>,
    fail_construct: Option<String>,
    fail_next_start: Option<String>,
    fail_stop: Option<String>,
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
    last_start: Option<AvatarStartConfig>,
}

/// Transport factory whose handles all share one recorded state.
#[derive(Clone, Default)]
pub struct FakeTransportFactory {
    state: Arc<Mutex<TransportState>>,
}

impl FakeTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tokens passed to `construct`, in order.
    pub fn tokens(&self) -> Vec<String> {
        lock(&self.state).tokens.clone()
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        lock(&self.state).calls.clone()
    }

    pub fn count(&self, call: TransportCall) -> usize {
        lock(&self.state).calls.iter().filter(|c| **c == call).count()
    }

    /// Last mute state pushed to the transport, if any.
    pub fn is_muted(&self) -> Option<bool> {
        lock(&self.state).calls.iter().rev().find_map(|c| match c {
            TransportCall::Mute => Some(true),
            TransportCall::Unmute => Some(false),
            _ => None,
        })
    }

    pub fn last_start_config(&self) -> Option<AvatarStartConfig> {
        lock(&self.state).last_start.clone()
    }

    pub fn fail_construct(&self, message: &str) {
        lock(&self.state).fail_construct = Some(message.to_owned());
    }

    pub fn fail_next_start(&self, message: &str) {
        lock(&self.state).fail_next_start = Some(message.to_owned());
    }

    pub fn fail_stop(&self, message: &str) {
        lock(&self.state).fail_stop = Some(message.to_owned());
    }

    /// Deliver an upstream event. Returns `false` if nobody is subscribed.
    pub fn emit(&self, event: TransportEvent) -> bool {
        lock(&self.state)
            .events
            .as_ref()
            .is_some_and(|tx| tx.send(event).is_ok())
    }
}

impl TransportFactory for FakeTransportFactory {
    fn construct(&self, token: &str, _base_path: &str) -> Result<Box<dyn AvatarTransport>> {
        let mut state = lock(&self.state);
        if let Some(message) = state.fail_construct.clone() {
            return Err(StageError::TransportInit(message));
        }
        state.tokens.push(token.to_owned());
        Ok(Box::new(FakeTransport {
            state: Arc::clone(&self.state),
        }))
    }
}

/// Handle produced by [`FakeTransportFactory`].
pub struct FakeTransport {
    state: Arc<Mutex<TransportState>>,
}

#[async_trait]
impl AvatarTransport for FakeTransport {
    async fn start(&mut self, config: &AvatarStartConfig) -> Result<()> {
        let mut state = lock(&self.state);
        state.calls.push(TransportCall::Start);
        if let Some(message) = state.fail_next_start.take() {
            return Err(StageError::TransportInit(message));
        }
        state.last_start = Some(config.clone());
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        let mut state = lock(&self.state);
        state.calls.push(TransportCall::Stop);
        state.events = None;
        match state.fail_stop.clone() {
            Some(message) => Err(StageError::TransportInit(message)),
            None => Ok(()),
        }
    }

    fn mute(&mut self) {
        lock(&self.state).calls.push(TransportCall::Mute);
    }

    fn unmute(&mut self) {
        lock(&self.state).calls.push(TransportCall::Unmute);
    }

    fn subscribe(&mut self) -> mpsc::UnboundedReceiver<TransportEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.state).events = Some(tx);
        rx
    }
}

// ── Surfaces ──────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct SurfaceState {
    active: bool,
    ended: bool,
    loads: Vec<String>,
    plays: usize,
    pauses: usize,
    seeks: usize,
    fail_play: bool,
    hang_pause: bool,
    stream: Option<String>,
}

/// In-memory media surface.
#[derive(Debug, Clone)]
pub struct FakeSurface {
    id: SurfaceId,
    state: Arc<Mutex<SurfaceState>>,
}

impl FakeSurface {
    pub fn new(id: SurfaceId) -> Self {
        Self {
            id,
            state: Arc::default(),
        }
    }

    /// One fake per surface id, in [`SurfaceId::ALL`] order.
    pub fn full_set() -> Vec<FakeSurface> {
        SurfaceId::ALL.iter().map(|id| Self::new(*id)).collect()
    }

    pub fn boxed(&self) -> Box<dyn MediaSurface> {
        Box::new(self.clone())
    }

    pub fn id(&self) -> SurfaceId {
        self.id
    }

    /// Simulate natural end of playback.
    pub fn finish(&self) {
        let mut state = lock(&self.state);
        state.active = false;
        state.ended = true;
    }

    /// Simulate the host ignoring a play or pause call.
    pub fn force_active(&self, active: bool) {
        lock(&self.state).active = active;
    }

    pub fn fail_play(&self, fail: bool) {
        lock(&self.state).fail_play = fail;
    }

    /// Make `pause` never confirm.
    pub fn hang_pause(&self, hang: bool) {
        lock(&self.state).hang_pause = hang;
    }

    pub fn active(&self) -> bool {
        lock(&self.state).active
    }

    pub fn loads(&self) -> Vec<String> {
        lock(&self.state).loads.clone()
    }

    pub fn plays(&self) -> usize {
        lock(&self.state).plays
    }

    pub fn pauses(&self) -> usize {
        lock(&self.state).pauses
    }

    pub fn seeks(&self) -> usize {
        lock(&self.state).seeks
    }

    pub fn attached_stream(&self) -> Option<String> {
        lock(&self.state).stream.clone()
    }
}

#[async_trait]
impl MediaSurface for FakeSurface {
    fn id(&self) -> SurfaceId {
        self.id
    }

    async fn load(&mut self, source: &str) -> Result<()> {
        let mut state = lock(&self.state);
        state.loads.push(source.to_owned());
        state.ended = false;
        Ok(())
    }

    async fn play(&mut self) -> Result<()> {
        let mut state = lock(&self.state);
        if state.fail_play {
            return Err(StageError::Playback(format!("{} refused to play", self.id)));
        }
        state.active = true;
        state.ended = false;
        state.plays += 1;
        Ok(())
    }

    async fn pause(&mut self) {
        let hang = {
            let mut state = lock(&self.state);
            state.pauses += 1;
            if !state.hang_pause {
                state.active = false;
            }
            state.hang_pause
        };
        if hang {
            std::future::pending::<()>().await;
        }
    }

    fn seek_to_start(&mut self) {
        let mut state = lock(&self.state);
        state.seeks += 1;
        state.ended = false;
    }

    fn is_active(&self) -> bool {
        lock(&self.state).active
    }

    fn is_ended(&self) -> bool {
        lock(&self.state).ended
    }

    fn attach_stream(&mut self, stream: Option<MediaStream>) {
        lock(&self.state).stream = stream.map(|s| s.id);
    }
}

// ── Services ──────────────────────────────────────────────────────

/// Token service returning a fixed answer.
#[derive(Debug, Default)]
pub struct StaticTokens {
    token: Option<String>,
    fetches: Mutex<usize>,
}

impl StaticTokens {
    pub fn ok(token: &str) -> Self {
        Self {
            token: Some(token.to_owned()),
            fetches: Mutex::new(0),
        }
    }

    /// Every fetch fails with [`StageError::AuthFailed`].
    pub fn rejecting() -> Self {
        Self::default()
    }

    pub fn fetches(&self) -> usize {
        *lock(&self.fetches)
    }
}

#[async_trait]
impl TokenService for StaticTokens {
    async fn fetch_token(&self) -> Result<String> {
        *lock(&self.fetches) += 1;
        self.token
            .clone()
            .ok_or_else(|| StageError::AuthFailed("token rejected".into()))
    }
}

/// Registry over an in-memory list of remote sessions.
#[derive(Debug, Default)]
pub struct RecordingRegistry {
    live: Mutex<Vec<String>>,
    closed: Mutex<Vec<String>>,
    listings: Mutex<usize>,
}

impl RecordingRegistry {
    pub fn with_sessions(ids: &[&str]) -> Self {
        Self {
            live: Mutex::new(ids.iter().map(|id| (*id).to_owned()).collect()),
            ..Self::default()
        }
    }

    pub fn closed(&self) -> Vec<String> {
        lock(&self.closed).clone()
    }

    pub fn listings(&self) -> usize {
        *lock(&self.listings)
    }

    fn close(&self, session_id: &str) {
        lock(&self.live).retain(|id| id != session_id);
        lock(&self.closed).push(session_id.to_owned());
    }
}

#[async_trait]
impl SessionRegistry for RecordingRegistry {
    async fn list_sessions(&self) -> Result<Vec<RemoteSession>> {
        *lock(&self.listings) += 1;
        Ok(lock(&self.live)
            .iter()
            .map(|id| RemoteSession {
                session_id: id.clone(),
                status: "connected".into(),
                created_at: chrono::Utc::now(),
            })
            .collect())
    }

    async fn close_session(&self, session_id: &str) -> Result<()> {
        self.close(session_id);
        Ok(())
    }

    async fn force_close_session(&self, session_id: &str) -> Result<()> {
        self.close(session_id);
        Ok(())
    }
}
