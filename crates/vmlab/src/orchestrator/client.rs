//! HTTP client for the orchestrator API.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;

use super::error::{OrchestratorError, OrchestratorResult};
use super::{OrchestratorApi, ProvisionRequest, VmState};

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(alias = "message", alias = "detail")]
    error: String,
}

#[derive(Debug, Clone)]
pub struct HttpOrchestrator {
    client: Client,
    /// e.g. "http://orchestrator:8090/api/v1"
    base_url: String,
    token: Option<String>,
}

impl HttpOrchestrator {
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> OrchestratorResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(
        &self,
        builder: reqwest::RequestBuilder,
        url: &str,
    ) -> OrchestratorResult<reqwest::Response> {
        self.authorize(builder).send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                OrchestratorError::ConnectionFailed {
                    url: url.to_string(),
                    message: e.to_string(),
                }
            } else {
                OrchestratorError::RequestFailed(e)
            }
        })
    }

    async fn error_for(response: reqwest::Response, session_id: &str) -> OrchestratorError {
        let status = response.status();
        match status {
            StatusCode::NOT_FOUND => OrchestratorError::NotFound(session_id.to_string()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => OrchestratorError::Unauthorized,
            _ => {
                let message = match response.json::<ApiErrorBody>().await {
                    Ok(body) => body.error,
                    Err(_) => status.canonical_reason().unwrap_or("unknown").to_string(),
                };
                OrchestratorError::Api {
                    status: status.as_u16(),
                    message,
                }
            }
        }
    }

    async fn parse_state(
        response: reqwest::Response,
        session_id: &str,
    ) -> OrchestratorResult<VmState> {
        if !response.status().is_success() {
            return Err(Self::error_for(response, session_id).await);
        }
        response
            .json()
            .await
            .map_err(|e| OrchestratorError::ParseError(e.to_string()))
    }

    async fn expect_empty(response: reqwest::Response, session_id: &str) -> OrchestratorResult<()> {
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::error_for(response, session_id).await)
        }
    }
}

#[async_trait]
impl OrchestratorApi for HttpOrchestrator {
    async fn start_vm(&self, request: &ProvisionRequest) -> OrchestratorResult<VmState> {
        let url = self.url("/sessions");
        let response = self
            .send(self.client.post(&url).json(request), &url)
            .await?;
        Self::parse_state(response, &request.session_id).await
    }

    async fn vm_state(&self, session_id: &str) -> OrchestratorResult<VmState> {
        let url = self.url(&format!("/sessions/{}", session_id));
        let response = self.send(self.client.get(&url), &url).await?;
        Self::parse_state(response, session_id).await
    }

    async fn list_vms(&self, owner: Option<&str>) -> OrchestratorResult<Vec<VmState>> {
        let url = match owner {
            Some(owner) => self.url(&format!("/sessions?owner={}", urlencoding::encode(owner))),
            None => self.url("/sessions"),
        };
        let response = self.send(self.client.get(&url), &url).await?;
        if !response.status().is_success() {
            return Err(Self::error_for(response, owner.unwrap_or("*")).await);
        }
        response
            .json()
            .await
            .map_err(|e| OrchestratorError::ParseError(e.to_string()))
    }

    async fn stop_vm(&self, session_id: &str) -> OrchestratorResult<()> {
        let url = self.url(&format!("/sessions/{}/stop", session_id));
        let response = self.send(self.client.post(&url), &url).await?;
        Self::expect_empty(response, session_id).await
    }

    async fn delete_vm(&self, session_id: &str) -> OrchestratorResult<()> {
        let url = self.url(&format!("/sessions/{}", session_id));
        let response = self.send(self.client.delete(&url), &url).await?;
        Self::expect_empty(response, session_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client =
            HttpOrchestrator::new("http://localhost:8090/api/", None, Duration::from_secs(5))
                .unwrap();
        assert_eq!(client.url("/sessions"), "http://localhost:8090/api/sessions");
    }

    #[tokio::test]
    async fn test_unreachable_orchestrator_is_connection_failure() {
        let client =
            HttpOrchestrator::new("http://127.0.0.1:9", None, Duration::from_secs(2)).unwrap();
        let err = client.stop_vm("s1").await.unwrap_err();
        assert!(!err.is_not_found());
        assert!(matches!(
            err,
            OrchestratorError::ConnectionFailed { .. } | OrchestratorError::RequestFailed(_)
        ));
    }
}
