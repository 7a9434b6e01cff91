//! Seam to the third-party avatar streaming SDK.
//!
//! The SDK is consumed only through these traits: a factory that turns an
//! access token into a session handle, and the handle's start/stop/mute calls
//! plus an event subscription.

use crate::config::AvatarStartConfig;
use crate::error::Result;
use crate::stream::MediaStream;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Connection quality reported by the transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionQuality {
    #[default]
    Unknown,
    Good,
    Bad,
}

/// Upstream signals delivered by the transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Media negotiation finished; the stream can be presented.
    StreamReady(MediaStream),
    /// The media connection dropped.
    StreamDisconnected,
    ConnectionQualityChanged(ConnectionQuality),
    UserStartedSpeaking,
    UserStoppedSpeaking,
    AvatarStartedSpeaking,
    AvatarStoppedSpeaking,
    /// Partial transcript of what the avatar is saying.
    TalkingMessage(String),
    /// The avatar finished the current message.
    EndMessage,
}

/// A constructed avatar session handle.
#[async_trait]
pub trait AvatarTransport: Send {
    /// Open the session and begin media negotiation.
    async fn start(&mut self, config: &AvatarStartConfig) -> Result<()>;

    /// Tear down the remote session.
    async fn stop(&mut self) -> Result<()>;

    fn mute(&mut self);

    fn unmute(&mut self);

    /// Subscribe to upstream events, replacing any previous subscription.
    fn subscribe(&mut self) -> mpsc::UnboundedReceiver<TransportEvent>;
}

/// Builds transport handles from an access token.
pub trait TransportFactory: Send + Sync {
    /// # Errors
    ///
    /// Returns [`crate::StageError::TransportInit`] if the handle cannot be built.
    fn construct(&self, token: &str, base_path: &str) -> Result<Box<dyn AvatarTransport>>;
}
