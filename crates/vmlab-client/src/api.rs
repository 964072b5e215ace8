//! Session control against the vmlab server REST API.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

use vmlab_protocol::SessionInfo;
use vmlab_protocol::api::{ActivityReport, Disposal, TerminateRequest, TerminateResponse};

pub type ControlResult<T> = Result<T, SessionControlError>;

#[derive(Debug, Error)]
pub enum SessionControlError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Not signed in or session expired")]
    Unauthorized,

    #[error("Server error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("Server unreachable at {url}: {message}")]
    ConnectionFailed { url: String, message: String },

    #[error("Failed to parse server response: {0}")]
    ParseError(String),
}

/// Operations the dashboard needs from the server.
#[async_trait]
pub trait SessionControl: Send + Sync {
    /// The caller's sessions. `touch` counts the poll as activity.
    async fn list_sessions(&self, touch: bool) -> ControlResult<Vec<SessionInfo>>;

    /// Report activity on one session. Returns the stored `last_active_at`.
    async fn report_activity(&self, session_id: &str, timestamp: i64) -> ControlResult<i64>;

    /// Stop or delete sessions. Ids the server no longer knows succeed.
    async fn terminate(
        &self,
        session_ids: &[String],
        disposal: Disposal,
    ) -> ControlResult<TerminateResponse>;
}

/// How requests are authenticated.
#[derive(Debug, Clone)]
pub enum Credentials {
    Bearer(String),
    /// Dev-mode user header, only honoured by servers running in dev mode.
    DevUser(String),
    Anonymous,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
struct ActivityBody {
    last_active_at: i64,
}

#[derive(Debug, Clone)]
pub struct HttpSessionControl {
    client: Client,
    /// e.g. "http://localhost:8080"
    base_url: String,
    credentials: Credentials,
}

impl HttpSessionControl {
    pub fn new(
        base_url: impl Into<String>,
        credentials: Credentials,
        timeout: Duration,
    ) -> ControlResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(
        &self,
        builder: reqwest::RequestBuilder,
        url: &str,
    ) -> ControlResult<reqwest::Response> {
        let builder = match &self.credentials {
            Credentials::Bearer(token) => builder.bearer_auth(token),
            Credentials::DevUser(user) => builder.header("X-Dev-User", user),
            Credentials::Anonymous => builder,
        };
        builder.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                SessionControlError::ConnectionFailed {
                    url: url.to_string(),
                    message: e.to_string(),
                }
            } else {
                SessionControlError::RequestFailed(e)
            }
        })
    }

    async fn parse<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
        subject: &str,
    ) -> ControlResult<T> {
        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| SessionControlError::ParseError(e.to_string()));
        }

        Err(match status {
            StatusCode::NOT_FOUND => SessionControlError::NotFound(subject.to_string()),
            StatusCode::UNAUTHORIZED => SessionControlError::Unauthorized,
            _ => {
                let message = match response.json::<ErrorBody>().await {
                    Ok(body) => body.error,
                    Err(_) => status.canonical_reason().unwrap_or("unknown").to_string(),
                };
                SessionControlError::Api {
                    status: status.as_u16(),
                    message,
                }
            }
        })
    }
}

#[async_trait]
impl SessionControl for HttpSessionControl {
    async fn list_sessions(&self, touch: bool) -> ControlResult<Vec<SessionInfo>> {
        let url = self.url(if touch {
            "/sessions?touch=true"
        } else {
            "/sessions"
        });
        let response = self.send(self.client.get(&url), &url).await?;
        Self::parse(response, "sessions").await
    }

    async fn report_activity(&self, session_id: &str, timestamp: i64) -> ControlResult<i64> {
        let url = self.url(&format!("/sessions/{}/activity", session_id));
        let response = self
            .send(
                self.client.post(&url).json(&ActivityReport { timestamp }),
                &url,
            )
            .await?;
        let body: ActivityBody = Self::parse(response, session_id).await?;
        Ok(body.last_active_at)
    }

    async fn terminate(
        &self,
        session_ids: &[String],
        disposal: Disposal,
    ) -> ControlResult<TerminateResponse> {
        let url = self.url("/sessions/terminate");
        let request = TerminateRequest {
            session_ids: session_ids.to_vec(),
            disposal,
        };
        let response = self.send(self.client.post(&url).json(&request), &url).await?;
        Self::parse(response, "sessions").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let control = HttpSessionControl::new(
            "http://localhost:8080/",
            Credentials::Anonymous,
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(control.url("/sessions"), "http://localhost:8080/sessions");
    }

    #[tokio::test]
    async fn test_unreachable_server_is_connection_failure() {
        let control = HttpSessionControl::new(
            "http://127.0.0.1:1",
            Credentials::DevUser("alice".to_string()),
            Duration::from_secs(2),
        )
        .unwrap();

        let err = control.list_sessions(true).await.unwrap_err();
        assert!(
            matches!(err, SessionControlError::ConnectionFailed { .. }),
            "unexpected error: {err}"
        );
    }
}
