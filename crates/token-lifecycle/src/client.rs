//! Authenticated downstream calls
//!
//! Wraps business requests against the downstream API. A call rejected
//! with 401/403 refreshes the token once and is retried exactly once; a
//! second rejection is reported instead of looping.

use reqwest::Method;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use webex_auth::{ErrorClassification, classify_status};

use crate::error::{Error, Result};
use crate::manager::{Session, TokenManager};
use crate::telemetry;

/// A request against the downstream API, relative to its base URL.
#[derive(Debug, Clone)]
pub struct DownstreamRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<serde_json::Value>,
}

impl DownstreamRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            body: None,
        }
    }

    pub fn put(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: Method::PUT,
            path: path.into(),
            body: Some(body),
        }
    }

    pub fn post(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            body: Some(body),
        }
    }
}

/// Raw downstream response. Non-auth failures are returned as-is for the
/// caller to interpret and counted as `passthrough` calls.
#[derive(Debug, Clone)]
pub struct DownstreamResponse {
    pub status: u16,
    pub body: String,
}

impl DownstreamResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_str(&self.body)
    }
}

/// Business-call wrapper that owns the invocation's session.
pub struct AuthenticatedClient<'m> {
    manager: &'m TokenManager,
    session: Session,
}

impl<'m> AuthenticatedClient<'m> {
    pub fn new(manager: &'m TokenManager, session: Session) -> Self {
        Self { manager, session }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn into_session(self) -> Session {
        self.session
    }

    /// Send `request` with a valid bearer token.
    ///
    /// On a 401/403 the session is invalidated, the cascade runs, and the
    /// request is sent once more. A second auth rejection is
    /// `AuthenticationFailed`.
    pub async fn call(&mut self, request: &DownstreamRequest) -> Result<DownstreamResponse> {
        let token = self.manager.ensure_valid_token(&mut self.session).await?;
        let response = self.send(request, token.expose()).await?;
        if classify_status(response.status) != ErrorClassification::Auth {
            telemetry::record_call(if response.is_success() {
                "success"
            } else {
                "passthrough"
            });
            return Ok(response);
        }

        warn!(
            method = %request.method,
            path = %request.path,
            status = response.status,
            "downstream call rejected the token, refreshing and retrying once"
        );
        self.session.invalidate();
        self.manager.refresh(&mut self.session).await?;
        let token = self.manager.ensure_valid_token(&mut self.session).await?;

        let response = self.send(request, token.expose()).await?;
        if classify_status(response.status) == ErrorClassification::Auth {
            telemetry::record_call("auth_failed");
            return Err(Error::AuthenticationFailed(format!(
                "{} {} rejected a freshly refreshed token with status {}",
                request.method, request.path, response.status
            )));
        }

        telemetry::record_call("retried");
        Ok(response)
    }

    async fn send(&self, request: &DownstreamRequest, token: &str) -> Result<DownstreamResponse> {
        self.manager.check_deadline("downstream call")?;
        let api = self.manager.api();
        let mut builder = api
            .http_client()
            .request(request.method.clone(), api.url(&request.path))
            .bearer_auth(token);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            Error::TransientFailure(format!("{} {} failed: {e}", request.method, request.path))
        })?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| {
            Error::TransientFailure(format!(
                "reading {} {} response: {e}",
                request.method, request.path
            ))
        })?;

        debug!(method = %request.method, path = %request.path, status, "downstream call completed");
        Ok(DownstreamResponse { status, body })
    }
}
