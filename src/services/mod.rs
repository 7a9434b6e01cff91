//! HTTP collaborators: the token service and the remote session registry.

pub mod registry;
pub mod token;

pub use registry::{
    CleanupReport, HttpSessionRegistry, RemoteSession, SessionRegistry, sweep_sessions,
};
pub use token::{HttpTokenService, TokenService};

use crate::config::ServiceConfig;
use crate::error::{Result, StageError};
use std::time::Duration;

/// Shared client with the configured per-request timeout.
pub(crate) fn http_client(config: &ServiceConfig) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_millis(config.request_timeout_ms))
        .build()
        .unwrap_or_default()
}

/// Join `path` onto the configured base URL.
pub(crate) fn endpoint(base_url: &str, path: &str) -> Result<url::Url> {
    let base = format!("{}/", base_url.trim_end_matches('/'));
    url::Url::parse(&base)
        .and_then(|u| u.join(path.trim_start_matches('/')))
        .map_err(|e| StageError::Config(format!("invalid service url {base_url}: {e}")))
}
