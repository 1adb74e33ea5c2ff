//! Field-group diff used for merge-on-write
//!
//! The bundle changes in three independent groups, each owned by a
//! different cascade tier: the downstream token, the OAuth bridge access
//! token, and the OAuth bridge refresh token. A patch records which of them
//! a writer changed so that applying it to a fresher copy of the bundle
//! leaves every other group untouched.
//!
//! Patches are applied to the stored JSON document itself rather than to
//! the typed bundle, so keys the bundle does not model (including an OAuth
//! block the loader ignored as incomplete) are written back unchanged.
//!
//! `serviceIdentity` and the manual bridge token are operator inputs and
//! are never patched.

use common::Secret;
use serde_json::{Map, Value};
use tracing::warn;

use crate::bundle::{CredentialBundle, DownstreamToken};
use crate::error::{Error, Result};

/// Changed field groups between two versions of a bundle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BundlePatch {
    downstream_token: Option<DownstreamToken>,
    oauth_access: Option<(Option<Secret<String>>, Option<u64>)>,
    oauth_refresh: Option<Secret<String>>,
}

impl BundlePatch {
    /// Diff `updated` against `base`. Without a base every group present in
    /// `updated` counts as changed.
    pub fn between(base: Option<&CredentialBundle>, updated: &CredentialBundle) -> Self {
        let mut patch = BundlePatch::default();

        if base.is_none_or(|b| b.downstream_token != updated.downstream_token) {
            patch.downstream_token = Some(updated.downstream_token.clone());
        }

        let base_oauth = base.and_then(|b| b.bridge_credential.oauth.as_ref());
        if let Some(oauth) = &updated.bridge_credential.oauth {
            let access_changed = base_oauth
                .is_none_or(|b| b.access_token != oauth.access_token || b.expires != oauth.expires);
            if access_changed {
                patch.oauth_access = Some((oauth.access_token.clone(), oauth.expires));
            }
            if base_oauth.is_none_or(|b| b.refresh_token != oauth.refresh_token) {
                patch.oauth_refresh = Some(oauth.refresh_token.clone());
            }
        }

        patch
    }

    pub fn is_empty(&self) -> bool {
        self.downstream_token.is_none() && self.oauth_access.is_none() && self.oauth_refresh.is_none()
    }

    /// Names of the changed groups, for logs.
    pub fn fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.downstream_token.is_some() {
            fields.push("downstreamToken");
        }
        if self.oauth_access.is_some() {
            fields.push("bridgeCredential.oauth.accessToken");
        }
        if self.oauth_refresh.is_some() {
            fields.push("bridgeCredential.oauth.refreshToken");
        }
        fields
    }

    /// Apply the changed groups onto the stored bundle document.
    ///
    /// Only the keys owned by a changed group are touched. A root that is
    /// not a JSON object is `StoreCorrupt`.
    pub fn apply(&self, document: &mut Value) -> Result<()> {
        let root = document.as_object_mut().ok_or_else(|| {
            Error::StoreCorrupt("credential bundle is not a JSON object".into())
        })?;

        if let Some(downstream) = &self.downstream_token {
            let mut token = match root.remove("downstreamToken") {
                Some(Value::Object(token)) => token,
                _ => Map::new(),
            };
            set_or_remove(&mut token, "accessToken", downstream.access_token.as_ref().map(secret_value));
            set_or_remove(&mut token, "refreshToken", downstream.refresh_token.as_ref().map(secret_value));
            set_or_remove(&mut token, "expires", downstream.expires.map(Value::from));
            root.insert("downstreamToken".to_string(), Value::Object(token));
        }

        if self.oauth_access.is_none() && self.oauth_refresh.is_none() {
            return Ok(());
        }
        let oauth = root
            .get_mut("bridgeCredential")
            .and_then(|bridge| bridge.get_mut("oauth"))
            .and_then(Value::as_object_mut);
        let Some(oauth) = oauth else {
            // The operator removed OAuth while we were refreshing; their edit stands.
            warn!("OAuth bridge no longer configured in store, dropping OAuth token update");
            return Ok(());
        };
        if let Some((access_token, expires)) = &self.oauth_access {
            set_or_remove(oauth, "accessToken", access_token.as_ref().map(secret_value));
            set_or_remove(oauth, "expires", expires.map(Value::from));
        }
        if let Some(refresh_token) = &self.oauth_refresh {
            oauth.insert("refreshToken".to_string(), secret_value(refresh_token));
        }
        Ok(())
    }
}

fn set_or_remove(object: &mut Map<String, Value>, key: &str, value: Option<Value>) {
    match value {
        Some(value) => {
            object.insert(key.to_string(), value);
        }
        None => {
            object.remove(key);
        }
    }
}

fn secret_value(secret: &Secret<String>) -> Value {
    Value::String(secret.expose().clone())
}
