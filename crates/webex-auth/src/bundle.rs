//! Credential bundle: the persisted unit of truth
//!
//! The bundle groups three independently owned sets of fields:
//! - `serviceIdentity`: operator-provided, never mutated
//! - `downstreamToken`: the access token handed to callers, plus its refresh token
//! - `bridgeCredential`: what we present to mint a new downstream token
//!
//! Content is validated once, when it is read from a store. After that the
//! rest of the system works with the typed record only.

use common::Secret;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::constants::expires_at;
use crate::error::{Error, Result};

/// Static service app identity. Every field is required.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceIdentity {
    pub app_id: String,
    pub client_id: String,
    pub client_secret: Secret<String>,
    pub target_org_id: String,
}

/// Current downstream access token and what is needed to renew it.
///
/// `expires` is a unix timestamp in milliseconds, computed at storage time
/// from the token endpoint's `expires_in` delta.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownstreamToken {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<Secret<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<Secret<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<u64>,
}

impl DownstreamToken {
    /// Whether the locally recorded expiry has passed, allowing for `margin_millis`.
    ///
    /// A token without a recorded expiry is never considered expired here;
    /// only a probe can tell.
    pub fn is_expired(&self, now_millis: u64, margin_millis: u64) -> bool {
        self.expires
            .is_some_and(|expires| expires <= now_millis.saturating_add(margin_millis))
    }

    /// Replace the token after a successful exchange.
    ///
    /// A refresh token is only replaced when the endpoint issued a new one.
    pub fn renew(
        &mut self,
        access_token: Secret<String>,
        refresh_token: Option<Secret<String>>,
        expires_in_secs: Option<u64>,
        now_millis: u64,
    ) {
        self.access_token = Some(access_token);
        if let Some(refresh) = refresh_token {
            self.refresh_token = Some(refresh);
        }
        self.expires = expires_in_secs.map(|secs| expires_at(now_millis, secs));
    }
}

/// OAuth-managed bridge credential (long-lived refresh token plus client).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthBridge {
    pub client_id: String,
    pub client_secret: Secret<String>,
    pub refresh_token: Secret<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<Secret<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<u64>,
}

/// The credential used to request a new downstream token.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeCredential {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub personal_access_token: Option<Secret<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OAuthBridge>,
}

/// Which bridge credential is authoritative for the next refresh.
#[derive(Debug, Clone, Copy)]
pub enum ActiveBridge<'a> {
    /// OAuth is configured; preferred whenever present
    OAuth(&'a OAuthBridge),
    /// Only a manually supplied token is available
    Manual(&'a Secret<String>),
    /// Nothing can request a downstream token
    None,
}

impl BridgeCredential {
    /// Pick the authoritative bridge credential. OAuth wins when both exist
    /// because it can be renewed unattended.
    pub fn active(&self) -> ActiveBridge<'_> {
        if let Some(oauth) = &self.oauth {
            return ActiveBridge::OAuth(oauth);
        }
        match &self.personal_access_token {
            Some(token) if !token.is_blank() => ActiveBridge::Manual(token),
            _ => ActiveBridge::None,
        }
    }
}

/// The complete persisted credential record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialBundle {
    pub service_identity: ServiceIdentity,
    pub downstream_token: DownstreamToken,
    pub bridge_credential: BridgeCredential,
}

impl CredentialBundle {
    /// Parse and validate stored bundle content.
    ///
    /// Malformed JSON is `StoreCorrupt`; a missing or empty service identity
    /// field is `Configuration`.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let raw: RawBundle = serde_json::from_slice(bytes)
            .map_err(|e| Error::StoreCorrupt(format!("parsing credential bundle: {e}")))?;
        raw.validate()
    }

    /// Serialize for storage.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| Error::StoreCorrupt(format!("serializing credential bundle: {e}")))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBundle {
    service_identity: Option<RawServiceIdentity>,
    #[serde(default)]
    downstream_token: DownstreamToken,
    #[serde(default)]
    bridge_credential: RawBridgeCredential,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawServiceIdentity {
    app_id: Option<String>,
    client_id: Option<String>,
    client_secret: Option<Secret<String>>,
    target_org_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBridgeCredential {
    personal_access_token: Option<Secret<String>>,
    oauth: Option<RawOAuthBridge>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOAuthBridge {
    client_id: Option<String>,
    client_secret: Option<Secret<String>>,
    refresh_token: Option<Secret<String>>,
    access_token: Option<Secret<String>>,
    expires: Option<u64>,
}

impl RawBundle {
    fn validate(self) -> Result<CredentialBundle> {
        let identity = self.service_identity.ok_or_else(|| {
            Error::Configuration("credential bundle has no serviceIdentity section".into())
        })?;

        let mut missing = Vec::new();
        let app_id = required_str(identity.app_id, "serviceIdentity.appId", &mut missing);
        let client_id = required_str(identity.client_id, "serviceIdentity.clientId", &mut missing);
        let target_org_id = required_str(
            identity.target_org_id,
            "serviceIdentity.targetOrgId",
            &mut missing,
        );
        let client_secret = match identity.client_secret {
            Some(secret) if !secret.is_blank() => Some(secret),
            _ => {
                missing.push("serviceIdentity.clientSecret");
                None
            }
        };

        let (Some(app_id), Some(client_id), Some(client_secret), Some(target_org_id)) =
            (app_id, client_id, client_secret, target_org_id)
        else {
            return Err(Error::Configuration(format!(
                "missing required fields in credential bundle: {}",
                missing.join(", ")
            )));
        };

        Ok(CredentialBundle {
            service_identity: ServiceIdentity {
                app_id,
                client_id,
                client_secret,
                target_org_id,
            },
            downstream_token: self.downstream_token,
            bridge_credential: BridgeCredential {
                personal_access_token: self
                    .bridge_credential
                    .personal_access_token
                    .filter(|token| !token.is_blank()),
                oauth: self.bridge_credential.oauth.and_then(RawOAuthBridge::validate),
            },
        })
    }
}

impl RawOAuthBridge {
    /// OAuth fields must be present together; a partial block disables OAuth.
    fn validate(self) -> Option<OAuthBridge> {
        let client_id = self.client_id.filter(|v| !v.trim().is_empty());
        let client_secret = self.client_secret.filter(|v| !v.is_blank());
        let refresh_token = self.refresh_token.filter(|v| !v.is_blank());

        match (client_id, client_secret, refresh_token) {
            (Some(client_id), Some(client_secret), Some(refresh_token)) => Some(OAuthBridge {
                client_id,
                client_secret,
                refresh_token,
                access_token: self.access_token.filter(|v| !v.is_blank()),
                expires: self.expires,
            }),
            (client_id, client_secret, refresh_token) => {
                let mut missing = Vec::new();
                if client_id.is_none() {
                    missing.push("clientId");
                }
                if client_secret.is_none() {
                    missing.push("clientSecret");
                }
                if refresh_token.is_none() {
                    missing.push("refreshToken");
                }
                warn!(
                    missing = %missing.join(", "),
                    "OAuth bridge partially configured, OAuth refresh will not be available"
                );
                None
            }
        }
    }
}

fn required_str(
    value: Option<String>,
    name: &'static str,
    missing: &mut Vec<&'static str>,
) -> Option<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Some(v),
        _ => {
            missing.push(name);
            None
        }
    }
}
