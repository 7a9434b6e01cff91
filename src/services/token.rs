//! Access token retrieval.

use super::{endpoint, http_client};
use crate::config::ServiceConfig;
use crate::error::{Result, StageError};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, warn};

/// Source of access tokens for the avatar transport.
#[async_trait]
pub trait TokenService: Send + Sync {
    /// # Errors
    ///
    /// Fails with [`StageError::AuthFailed`], [`StageError::Forbidden`], a
    /// network variant, or [`StageError::Server`].
    async fn fetch_token(&self) -> Result<String>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    access_token: String,
}

/// Token service backed by `POST {base_url}/v1/token`.
pub struct HttpTokenService {
    base_url: String,
    client: reqwest::Client,
}

impl HttpTokenService {
    pub fn new(config: &ServiceConfig) -> Self {
        Self {
            base_url: config.base_url.clone(),
            client: http_client(config),
        }
    }
}

#[async_trait]
impl TokenService for HttpTokenService {
    async fn fetch_token(&self) -> Result<String> {
        let url = endpoint(&self.base_url, "/v1/token")?;
        let resp = self
            .client
            .post(url)
            .send()
            .await
            .map_err(|e| StageError::from_http("token request", &e))?;

        let status = resp.status();
        if !status.is_success() {
            let body: String = resp.text().await.unwrap_or_default().chars().take(200).collect();
            warn!(status = status.as_u16(), "token request rejected");
            return Err(match status {
                StatusCode::UNAUTHORIZED => StageError::AuthFailed(body),
                StatusCode::FORBIDDEN => StageError::Forbidden(body),
                s => StageError::Server(format!("token service returned {s}: {body}")),
            });
        }

        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| StageError::from_http("token response", &e))?;
        if token.access_token.is_empty() {
            return Err(StageError::Server("token service returned an empty token".into()));
        }
        debug!("access token fetched");
        Ok(token.access_token)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn service(server: &MockServer) -> HttpTokenService {
        HttpTokenService::new(&ServiceConfig {
            base_url: server.uri(),
            request_timeout_ms: 500,
            ..ServiceConfig::default()
        })
    }

    async fn respond(status: u16, body: serde_json::Value) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/token"))
            .respond_with(ResponseTemplate::new(status).set_body_json(body))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn returns_access_token() {
        let server = respond(200, serde_json::json!({"accessToken": "abc123"})).await;
        assert_eq!(service(&server).fetch_token().await.unwrap(), "abc123");
    }

    #[tokio::test]
    async fn classifies_status_codes() {
        let cases = [
            (401, "AUTH_FAILED"),
            (403, "FORBIDDEN"),
            (500, "SERVER_ERROR"),
            (503, "SERVER_ERROR"),
        ];
        for (status, code) in cases {
            let server = respond(status, serde_json::json!({"error": "nope"})).await;
            let err = service(&server).fetch_token().await.unwrap_err();
            assert_eq!(err.code(), code, "status {status}");
        }
    }

    #[tokio::test]
    async fn malformed_body_is_server_error() {
        let server = respond(200, serde_json::json!({"token": "wrong-field"})).await;
        let err = service(&server).fetch_token().await.unwrap_err();
        assert_eq!(err.code(), "SERVER_ERROR");
    }

    #[tokio::test]
    async fn empty_token_is_rejected() {
        let server = respond(200, serde_json::json!({"accessToken": ""})).await;
        assert!(service(&server).fetch_token().await.is_err());
    }

    #[tokio::test]
    async fn slow_service_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"accessToken": "late"}))
                    .set_delay(std::time::Duration::from_secs(5)),
            )
            .mount(&server)
            .await;
        let err = service(&server).fetch_token().await.unwrap_err();
        assert_eq!(err.code(), "NETWORK_TIMEOUT");
    }

    #[tokio::test]
    async fn unreachable_service() {
        let svc = HttpTokenService::new(&ServiceConfig {
            base_url: "http://127.0.0.1:1".into(),
            request_timeout_ms: 500,
            ..ServiceConfig::default()
        });
        let err = svc.fetch_token().await.unwrap_err();
        assert!(err.is_network());
    }
}
