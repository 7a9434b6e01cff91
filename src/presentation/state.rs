//! Presentation states and the pure transition table.

use super::surface::SurfaceId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The mutually exclusive visual states.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresentationState {
    #[default]
    Idle,
    Intro,
    Streaming,
    Ending,
    Error,
}

impl PresentationState {
    /// The surface that must be the only active one in this state.
    pub fn surface(self) -> SurfaceId {
        match self {
            Self::Idle => SurfaceId::Idle,
            Self::Intro => SurfaceId::Intro,
            Self::Streaming => SurfaceId::Stream,
            Self::Ending => SurfaceId::Ending,
            Self::Error => SurfaceId::Error,
        }
    }

    /// Every state except the live stream keeps the microphone closed.
    pub fn demands_mute(self) -> bool {
        self != Self::Streaming
    }
}

impl fmt::Display for PresentationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Intro => "intro",
            Self::Streaming => "streaming",
            Self::Ending => "ending",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Everything that can move the presentation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresentationInput {
    SessionStarting { language: String },
    AvatarStartedSpeaking,
    StreamReady,
    IntroEnded,
    SessionEnding { language: String },
    EndingEnded,
    SessionError { language: String, error: String },
    ErrorEnded,
    SessionInactive,
}

impl PresentationInput {
    /// Language carried by the input, if any.
    pub fn language(&self) -> Option<&str> {
        match self {
            Self::SessionStarting { language }
            | Self::SessionEnding { language }
            | Self::SessionError { language, .. } => Some(language),
            _ => None,
        }
    }
}

/// Transition table. Returns the target state, or `None` if the input does
/// not apply in `current`.
///
/// `SessionInactive` leaves `Ending` alone so the closing clip plays out;
/// `EndingEnded` brings the presentation back to idle.
pub fn decide(current: PresentationState, input: &PresentationInput) -> Option<PresentationState> {
    use PresentationState as S;

    let target = match input {
        PresentationInput::SessionStarting { .. } => S::Intro,
        PresentationInput::AvatarStartedSpeaking if current != S::Streaming => S::Streaming,
        PresentationInput::StreamReady if matches!(current, S::Idle | S::Intro) => S::Streaming,
        // The stream has not been presented yet: buffer on the idle loop.
        PresentationInput::IntroEnded if current == S::Intro => S::Idle,
        PresentationInput::SessionEnding { .. } if current != S::Ending => S::Ending,
        PresentationInput::EndingEnded if current == S::Ending => S::Idle,
        PresentationInput::SessionError { .. } => S::Error,
        PresentationInput::ErrorEnded if current == S::Error => S::Idle,
        PresentationInput::SessionInactive
            if !matches!(current, S::Ending | S::Idle) =>
        {
            S::Idle
        }
        _ => return None,
    };
    Some(target)
}
