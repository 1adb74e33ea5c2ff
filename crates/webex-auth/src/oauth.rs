//! OAuth bridge refresh
//!
//! Exchanges the long-lived OAuth refresh token for a new bridge access
//! token (refresh-token grant). The provider may rotate the refresh token;
//! the caller must persist a rotated token or the next refresh will fail.

use common::Secret;
use tracing::debug;

use crate::bundle::OAuthBridge;
use crate::error::{Error, Result};
use crate::token::{TokenResponse, body_text};

/// Freshly minted bridge credential.
#[derive(Debug)]
pub struct BridgeGrant {
    pub access_token: Secret<String>,
    /// Present only when the provider rotated the refresh token
    pub refresh_token: Option<Secret<String>>,
    pub expires_in: Option<u64>,
}

/// Refreshes the OAuth bridge credential against one fixed token endpoint.
#[derive(Debug, Clone)]
pub struct OAuthRefresher {
    client: reqwest::Client,
    token_url: String,
}

impl OAuthRefresher {
    /// `client` should carry a bounded timeout.
    pub fn new(client: reqwest::Client, token_url: impl Into<String>) -> Self {
        Self {
            client,
            token_url: token_url.into(),
        }
    }

    /// Mint a new bridge access token.
    ///
    /// Client errors (other than 408/429) mean the grant is dead and come
    /// back as `RefreshTokenExpired`; network failures, timeouts, 408, 429
    /// and 5xx come back as `TransientRefreshFailure`. Nothing is retried here.
    pub async fn refresh(&self, bridge: &OAuthBridge) -> Result<BridgeGrant> {
        if bridge.refresh_token.is_blank() {
            return Err(Error::Configuration(
                "OAuth bridge refresh token is empty".into(),
            ));
        }

        debug!(client_id = %bridge.client_id, "refreshing OAuth bridge token");
        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", bridge.client_id.as_str()),
                ("client_secret", bridge.client_secret.expose().as_str()),
                ("refresh_token", bridge.refresh_token.expose().as_str()),
            ])
            .send()
            .await
            .map_err(|e| {
                Error::TransientRefreshFailure(format!("OAuth token request failed: {e}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = body_text(response).await;
            let code = status.as_u16();
            if status.is_client_error() && code != 408 && code != 429 {
                return Err(Error::RefreshTokenExpired(format!(
                    "OAuth token endpoint returned {status}: {body}"
                )));
            }
            return Err(Error::TransientRefreshFailure(format!(
                "OAuth token endpoint returned {status}: {body}"
            )));
        }

        let token: TokenResponse = response.json().await.map_err(|e| {
            Error::TransientRefreshFailure(format!("invalid OAuth refresh response: {e}"))
        })?;
        if token.access_token.is_blank() {
            return Err(Error::TransientRefreshFailure(
                "no access token in OAuth refresh response".into(),
            ));
        }

        // Providers often echo the same refresh token back; only a different one is a rotation
        let refresh_token = token
            .refresh_token
            .filter(|rt| !rt.is_blank() && *rt != bridge.refresh_token);

        Ok(BridgeGrant {
            access_token: token.access_token,
            refresh_token,
            expires_in: token.expires_in,
        })
    }
}
