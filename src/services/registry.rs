//! Remote session registry and the best-effort cleanup sweep.
//!
//! The sweep runs after a local teardown and never fails: every problem is
//! logged and recorded in the [`CleanupReport`], since the remote sessions
//! may already be gone.

use super::{endpoint, http_client};
use crate::config::ServiceConfig;
use crate::error::{Result, StageError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// One session as listed by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSession {
    pub session_id: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait SessionRegistry: Send + Sync {
    /// Active sessions, oldest first.
    async fn list_sessions(&self) -> Result<Vec<RemoteSession>>;

    async fn close_session(&self, session_id: &str) -> Result<()>;

    async fn force_close_session(&self, session_id: &str) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct SessionList {
    #[serde(default)]
    sessions: Vec<RemoteSession>,
}

#[derive(Debug, Serialize)]
struct SessionRef<'a> {
    session_id: &'a str,
}

/// Registry backed by the stage backend's `/v1/sessions` endpoints.
pub struct HttpSessionRegistry {
    base_url: String,
    client: reqwest::Client,
}

impl HttpSessionRegistry {
    pub fn new(config: &ServiceConfig) -> Self {
        Self {
            base_url: config.base_url.clone(),
            client: http_client(config),
        }
    }

    async fn post_session(&self, path: &str, session_id: &str) -> Result<()> {
        let url = endpoint(&self.base_url, path)?;
        let resp = self
            .client
            .post(url)
            .json(&SessionRef { session_id })
            .send()
            .await
            .map_err(|e| StageError::from_http(path, &e))?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            let body: String = resp.text().await.unwrap_or_default().chars().take(200).collect();
            Err(StageError::Cleanup(format!(
                "{path} {session_id} returned {status}: {body}"
            )))
        }
    }
}

#[async_trait]
impl SessionRegistry for HttpSessionRegistry {
    async fn list_sessions(&self) -> Result<Vec<RemoteSession>> {
        let url = endpoint(&self.base_url, "/v1/sessions")?;
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| StageError::from_http("list sessions", &e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(StageError::Server(format!("list sessions returned {status}")));
        }
        let mut list: SessionList = resp
            .json()
            .await
            .map_err(|e| StageError::from_http("list sessions", &e))?;
        list.sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(list.sessions)
    }

    async fn close_session(&self, session_id: &str) -> Result<()> {
        self.post_session("/v1/sessions/close", session_id).await
    }

    async fn force_close_session(&self, session_id: &str) -> Result<()> {
        self.post_session("/v1/sessions/force-close", session_id).await
    }
}

/// Outcome of one cleanup sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Sessions seen on the first listing.
    pub listed: usize,
    /// Sessions closed by the regular close call.
    pub closed: usize,
    /// Stragglers closed by a force close.
    pub force_closed: usize,
    /// Sessions still listed after the final check.
    pub remaining: Vec<String>,
    /// Every failure encountered, in order.
    pub failures: Vec<String>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.remaining.is_empty()
    }
}

/// List, close all, wait, re-list, force-close stragglers, final check.
pub async fn sweep_sessions(registry: &dyn SessionRegistry, config: &ServiceConfig) -> CleanupReport {
    let mut report = CleanupReport::default();

    let sessions = match registry.list_sessions().await {
        Ok(s) => s,
        Err(e) => {
            warn!("cleanup: initial listing failed: {e}");
            report.failures.push(e.to_string());
            return report;
        }
    };
    report.listed = sessions.len();
    if sessions.is_empty() {
        debug!("cleanup: no remote sessions");
        return report;
    }

    for session in &sessions {
        match registry.close_session(&session.session_id).await {
            Ok(()) => report.closed += 1,
            Err(e) => {
                warn!(session_id = %session.session_id, "cleanup: close failed: {e}");
                report.failures.push(e.to_string());
            }
        }
    }

    tokio::time::sleep(Duration::from_millis(config.cleanup_settle_ms)).await;

    let stragglers = match registry.list_sessions().await {
        Ok(s) => s,
        Err(e) => {
            warn!("cleanup: re-listing failed: {e}");
            report.failures.push(e.to_string());
            Vec::new()
        }
    };
    for session in &stragglers {
        if force_close_with_retry(registry, &session.session_id, config, &mut report).await {
            report.force_closed += 1;
        }
    }

    match registry.list_sessions().await {
        Ok(s) => report.remaining = s.into_iter().map(|s| s.session_id).collect(),
        Err(e) => {
            warn!("cleanup: final check failed: {e}");
            report.failures.push(e.to_string());
        }
    }

    if report.is_clean() {
        info!(
            listed = report.listed,
            closed = report.closed,
            force_closed = report.force_closed,
            "cleanup: remote sessions closed"
        );
    } else {
        warn!(remaining = ?report.remaining, "cleanup: sessions still listed after sweep");
    }
    report
}

/// One attempt plus `force_close_retries` retries; retry `n` waits
/// `n * force_close_backoff_ms` first.
async fn force_close_with_retry(
    registry: &dyn SessionRegistry,
    session_id: &str,
    config: &ServiceConfig,
    report: &mut CleanupReport,
) -> bool {
    let retries = config.force_close_retries;
    for retry in 0..=retries {
        if retry > 0 {
            let backoff = config.force_close_backoff_ms.saturating_mul(u64::from(retry));
            tokio::time::sleep(Duration::from_millis(backoff)).await;
        }
        match registry.force_close_session(session_id).await {
            Ok(()) => {
                debug!(session_id, retry, "cleanup: force-closed");
                return true;
            }
            Err(e) if retry < retries => {
                debug!(session_id, retry, "cleanup: force close failed, retrying: {e}");
            }
            Err(e) => {
                warn!(session_id, retries, "cleanup: force close gave up: {e}");
                report.failures.push(e.to_string());
            }
        }
    }
    false
}
