//! Events the stage publishes for a UI shell and for observability.
//!
//! [`AppSignal`] is the wire contract shared with the shell: the director
//! broadcasts it and also accepts it as input. [`StageEvent`] wraps it with
//! the rest of what the stage is doing "right now".

use crate::error::{Result, StageError};
use crate::presentation::PresentationInput;
use crate::services::CleanupReport;
use crate::session::{ChatMessage, ConnectionQuality, SessionState};
use serde::{Deserialize, Serialize};

/// Application-level signals exchanged with the UI shell.
///
/// Serialised as JSON objects tagged by `type`, e.g.
/// `{"type":"session-starting","language":"tr"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AppSignal {
    SessionStarting { language: String },
    SessionEnding { language: String },
    SessionError { language: String, error: String },
    AvatarStartTalking,
}

impl AppSignal {
    /// # Errors
    ///
    /// Returns [`StageError::Config`] if `raw` is not a known signal.
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| StageError::Config(format!("bad app signal: {e}")))
    }

    pub fn to_json(&self) -> String {
        // Plain enum of strings; serialisation cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// The presentation input this signal stands for.
    pub fn to_presentation_input(&self) -> PresentationInput {
        match self {
            Self::SessionStarting { language } => PresentationInput::SessionStarting {
                language: language.clone(),
            },
            Self::SessionEnding { language } => PresentationInput::SessionEnding {
                language: language.clone(),
            },
            Self::SessionError { language, error } => PresentationInput::SessionError {
                language: language.clone(),
                error: error.clone(),
            },
            Self::AvatarStartTalking => PresentationInput::AvatarStartedSpeaking,
        }
    }
}

/// Everything the director publishes.
#[derive(Debug, Clone)]
pub enum StageEvent {
    Signal(AppSignal),
    SessionStateChanged {
        from: SessionState,
        to: SessionState,
    },
    /// The authoritative microphone flag changed.
    MicrophoneMuted { muted: bool },
    ConnectionQuality(ConnectionQuality),
    /// Partial avatar transcript, accumulated so far.
    AvatarTalking { text: String },
    MessageCommitted(ChatMessage),
    /// Remote session sweep finished after a teardown.
    CleanupFinished(CleanupReport),
}
