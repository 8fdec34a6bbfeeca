//! HTTP client for the node endpoints of the control plane.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::{Error, Result};

use super::agent::ControlPlaneClient;
use super::{HeartbeatRequest, HeartbeatResponse, NodeTokenRequest, ProvisionBundle, RulesVersionResponse};

/// [`ControlPlaneClient`] over JSON/HTTPS.
#[derive(Debug, Clone)]
pub struct HttpControlPlaneClient {
    client: Client,
    base_url: String,
}

impl HttpControlPlaneClient {
    /// Create a client for `base_url` with a per-request `timeout`.
    ///
    /// # Errors
    ///
    /// [`Error::Transport`] when the HTTP client cannot be built.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(30))
            .user_agent(concat!("vpn-control-plane-agent/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post<B: Serialize + Sync, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("{url}: {e}")))?;

        let status = response.status();
        debug!(url = %url, status = %status, "Control plane call");
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(status, &text));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| Error::Transport(format!("{url}: invalid response: {e}")))
    }
}

/// Map a non-success status to the error taxonomy. Anything a later retry
/// could fix stays retryable.
fn status_error(status: StatusCode, body: &str) -> Error {
    let detail = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.chars().take(200).collect());
    match status {
        StatusCode::UNAUTHORIZED => Error::AuthenticationFailure(detail),
        StatusCode::FORBIDDEN => Error::AuthorizationDenied(detail),
        StatusCode::NOT_FOUND => Error::NotFound(detail),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => Error::MalformedSetting(detail),
        StatusCode::CONFLICT => Error::Conflict(detail),
        _ => Error::Transport(format!("HTTP {status}: {detail}")),
    }
}

#[async_trait::async_trait]
impl ControlPlaneClient for HttpControlPlaneClient {
    async fn heartbeat(&self, req: &HeartbeatRequest) -> Result<HeartbeatResponse> {
        self.post("/api/v1/node/heartbeat", req).await
    }

    async fn provision(&self, req: &NodeTokenRequest) -> Result<ProvisionBundle> {
        self.post("/api/v1/node/provision", req).await
    }

    async fn rules_version(&self, req: &NodeTokenRequest) -> Result<String> {
        let resp: RulesVersionResponse = self.post("/api/v1/node/rules-version", req).await?;
        Ok(resp.rules_version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_errors_keep_server_reason() {
        let err = status_error(StatusCode::UNAUTHORIZED, r#"{"error":"node authentication failed"}"#);
        assert!(matches!(err, Error::AuthenticationFailure(ref m) if m == "node authentication failed"));
    }

    #[test]
    fn server_side_outage_is_retryable() {
        let err = status_error(StatusCode::SERVICE_UNAVAILABLE, r#"{"error":"store unavailable"}"#);
        assert!(err.is_retryable());
        assert!(!status_error(StatusCode::FORBIDDEN, "").is_retryable());
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let client = HttpControlPlaneClient::new("http://cp.example.com/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.base_url, "http://cp.example.com");
    }

    #[tokio::test]
    async fn unreachable_control_plane_is_transport_error() {
        let client = HttpControlPlaneClient::new("http://127.0.0.1:1", Duration::from_millis(500)).unwrap();
        let err = client
            .rules_version(&NodeTokenRequest { token: "t".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }
}
