//! Error types for the avatar stage.
//!
//! Each variant carries a stable code (SCREAMING_SNAKE_CASE) accessible via
//! [`StageError::code()`]. Codes are part of the public contract with UI
//! shells and will not change.

/// Top-level error type for session, presentation and service failures.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// `start` was called while a session is connecting or connected.
    #[error("session already active")]
    AlreadyActive,

    /// No transport handle exists yet and no access token was supplied.
    #[error("no access token available to create a session")]
    MissingToken,

    /// The avatar transport could not be constructed or started.
    #[error("transport init error: {0}")]
    TransportInit(String),

    /// A service request timed out.
    #[error("network timeout: {0}")]
    NetworkTimeout(String),

    /// A service could not be reached at all.
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    /// The token service rejected our credentials.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The token service refused access.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// A service answered with a server error or an unreadable body.
    #[error("server error: {0}")]
    Server(String),

    /// A presentation surface failed to load or play.
    #[error("playback error: {0}")]
    Playback(String),

    /// A remote session could not be closed.
    #[error("cleanup error: {0}")]
    Cleanup(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StageError {
    /// Returns the stable error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AlreadyActive => "ALREADY_ACTIVE",
            Self::MissingToken => "MISSING_TOKEN",
            Self::TransportInit(_) => "TRANSPORT_INIT",
            Self::NetworkTimeout(_) => "NETWORK_TIMEOUT",
            Self::NetworkUnreachable(_) => "NETWORK_UNREACHABLE",
            Self::AuthFailed(_) => "AUTH_FAILED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::Server(_) => "SERVER_ERROR",
            Self::Playback(_) => "PLAYBACK_ERROR",
            Self::Cleanup(_) => "CLEANUP_ERROR",
            Self::Config(_) => "CONFIG_INVALID",
            Self::Io(_) => "IO_ERROR",
        }
    }

    /// Classify a transport-level `reqwest` failure.
    ///
    /// Status-code classification happens where the response is inspected;
    /// this only covers requests that never produced a usable response.
    pub fn from_http(context: &str, err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::NetworkTimeout(format!("{context}: {err}"))
        } else if err.is_connect() || err.is_request() {
            Self::NetworkUnreachable(format!("{context}: {err}"))
        } else if err.is_decode() || err.is_body() {
            Self::Server(format!("{context}: malformed response: {err}"))
        } else {
            Self::Server(format!("{context}: {err}"))
        }
    }

    /// Whether this error came from a network round-trip rather than local state.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            Self::NetworkTimeout(_)
                | Self::NetworkUnreachable(_)
                | Self::AuthFailed(_)
                | Self::Forbidden(_)
                | Self::Server(_)
        )
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, StageError>;
