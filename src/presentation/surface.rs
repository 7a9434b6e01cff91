//! Media playback surfaces driven by the presentation state machine.

use crate::error::Result;
use crate::stream::MediaStream;
use async_trait::async_trait;
use std::fmt;

/// One addressable video presentation channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SurfaceId {
    /// Looping background clip.
    Idle,
    /// Language-specific intro clip.
    Intro,
    /// Sink for the live avatar stream.
    Stream,
    /// Language-specific ending clip.
    Ending,
    /// Language-specific error clip.
    Error,
}

impl SurfaceId {
    pub const ALL: [SurfaceId; 5] = [
        SurfaceId::Idle,
        SurfaceId::Intro,
        SurfaceId::Stream,
        SurfaceId::Ending,
        SurfaceId::Error,
    ];

    /// Whether the surface's source depends on the active language.
    pub fn is_language_dependent(self) -> bool {
        matches!(self, Self::Intro | Self::Ending | Self::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Intro => "intro",
            Self::Stream => "stream",
            Self::Ending => "ending",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A host video element (or anything that behaves like one).
///
/// Natural end of playback is reported to the director out of band, as a
/// surface-ended notification carrying the [`SurfaceId`].
#[async_trait]
pub trait MediaSurface: Send {
    fn id(&self) -> SurfaceId;

    /// Replace the source. Does not start playback.
    async fn load(&mut self, source: &str) -> Result<()>;

    /// Start playback from the current position.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StageError::Playback`] if the host refused to play.
    async fn play(&mut self) -> Result<()>;

    /// Pause. Resolves once the host confirms the pause, which may be never;
    /// callers bound the wait.
    async fn pause(&mut self);

    fn seek_to_start(&mut self);

    /// Playing, audible or interactive.
    fn is_active(&self) -> bool;

    /// Playback reached the natural end of the source.
    fn is_ended(&self) -> bool;

    /// Bind (or clear) the live stream. Only meaningful for the stream sink.
    fn attach_stream(&mut self, _stream: Option<MediaStream>) {}
}
