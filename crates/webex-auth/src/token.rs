//! Downstream token endpoints
//!
//! Three calls against the administrative API:
//! 1. Probe: a cheap authenticated GET that tells us whether a token works
//! 2. Refresh: exchange the downstream refresh token for a new access token
//! 3. Issue: mint a new downstream token for the service app, authorized by
//!    the bridge credential
//!
//! Every failure is returned as an `EndpointError` so the cascade can decide
//! whether to fall through to the next tier.

use std::time::Duration;

use common::Secret;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bundle::ServiceIdentity;
use crate::constants::{ACCESS_TOKEN_PATH, application_token_path};
use crate::error::EndpointError;

/// Response from a token endpoint.
///
/// `expires_in` is a delta in seconds from the response time. The caller
/// converts it to an absolute unix millisecond timestamp when storing.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: Secret<String>,
    #[serde(default)]
    pub refresh_token: Option<Secret<String>>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IssueRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    target_org_id: &'a str,
}

/// Client for the downstream administrative API's token surface.
#[derive(Debug, Clone)]
pub struct DownstreamApi {
    client: reqwest::Client,
    base_url: String,
    probe_path: String,
}

impl DownstreamApi {
    /// `client` should carry a bounded timeout; every call here relies on it.
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, probe_path: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            probe_path: probe_path.into(),
        }
    }

    /// Shared HTTP client, reused for authenticated business calls.
    pub fn http_client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Absolute URL for a path on the downstream API.
    pub fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    /// Check whether `access_token` is currently accepted.
    pub async fn probe(&self, access_token: &Secret<String>) -> Result<(), EndpointError> {
        let response = self
            .client
            .get(self.url(&self.probe_path))
            .bearer_auth(access_token.expose())
            .send()
            .await
            .map_err(EndpointError::from_transport)?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        Err(EndpointError::from_status(status.as_u16(), body_text(response).await))
    }

    /// Exchange a downstream refresh token for a new access token.
    pub async fn refresh(
        &self,
        identity: &ServiceIdentity,
        refresh_token: &Secret<String>,
    ) -> Result<TokenResponse, EndpointError> {
        let response = self
            .client
            .post(self.url(ACCESS_TOKEN_PATH))
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", identity.client_id.as_str()),
                ("client_secret", identity.client_secret.expose().as_str()),
                ("refresh_token", refresh_token.expose().as_str()),
            ])
            .send()
            .await
            .map_err(EndpointError::from_transport)?;

        token_response(response).await
    }

    /// Request a new downstream token for the service app using the bridge token.
    pub async fn issue(
        &self,
        identity: &ServiceIdentity,
        bridge_token: &Secret<String>,
    ) -> Result<TokenResponse, EndpointError> {
        let path = application_token_path(&identity.app_id);
        debug!(app_id = %identity.app_id, "requesting service app token");
        let response = self
            .client
            .post(self.url(&path))
            .bearer_auth(bridge_token.expose())
            .json(&IssueRequest {
                client_id: &identity.client_id,
                client_secret: identity.client_secret.expose(),
                target_org_id: &identity.target_org_id,
            })
            .send()
            .await
            .map_err(EndpointError::from_transport)?;

        token_response(response).await
    }
}

/// Build an HTTP client whose every request is bounded by `timeout`.
pub fn build_http_client(timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder().timeout(timeout).build()
}

async fn token_response(response: reqwest::Response) -> Result<TokenResponse, EndpointError> {
    let status = response.status();
    if !status.is_success() {
        return Err(EndpointError::from_status(status.as_u16(), body_text(response).await));
    }

    let token: TokenResponse = response.json().await.map_err(|e| {
        if e.is_timeout() {
            EndpointError::Transient(format!("reading token response timed out: {e}"))
        } else {
            EndpointError::Rejected {
                status: status.as_u16(),
                body: format!("invalid token response: {e}"),
            }
        }
    })?;

    if token.access_token.is_blank() {
        return Err(EndpointError::Rejected {
            status: status.as_u16(),
            body: "no access token in response".into(),
        });
    }
    Ok(token)
}

pub(crate) async fn body_text(response: reqwest::Response) -> String {
    response
        .text()
        .await
        .unwrap_or_else(|_| String::from("<no body>"))
}
