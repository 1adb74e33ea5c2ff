//! Remote secret store backend (HashiCorp Vault KV v2)
//!
//! The bundle is kept as a JSON string under the `value` key of one KV v2
//! secret. KV v2 versions every write, so writes carry `options.cas` set to
//! the version we read: an overlapping invocation that wrote in between makes
//! Vault refuse the write, which `CredentialStore` turns into a re-merge.
//!
//! Secrets created by hand with the bundle sections as top-level keys are
//! also accepted on read.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use common::Secret;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use super::{Snapshot, StoreBackend, WriteOutcome};
use crate::error::{Error, Result};

const VAULT_TOKEN_HEADER: &str = "X-Vault-Token";
const VALUE_KEY: &str = "value";

/// Connection settings for the Vault backend.
#[derive(Debug, Clone)]
pub struct VaultSettings {
    /// Vault address, e.g. `https://vault.internal:8200`
    pub address: String,
    /// KV v2 mount point
    pub mount: String,
    /// Secret name (path below the mount)
    pub secret_name: String,
    pub token: Secret<String>,
    pub timeout: Duration,
}

/// Credential bundle stored as a Vault KV v2 secret.
pub struct VaultBackend {
    client: reqwest::Client,
    settings: VaultSettings,
}

#[derive(Debug, Deserialize)]
struct KvReadResponse {
    data: KvReadData,
}

#[derive(Debug, Deserialize)]
struct KvReadData {
    data: Option<serde_json::Map<String, serde_json::Value>>,
    metadata: KvMetadata,
}

#[derive(Debug, Deserialize)]
struct KvMetadata {
    version: u64,
}

impl VaultBackend {
    pub fn new(client: reqwest::Client, settings: VaultSettings) -> Self {
        Self { client, settings }
    }

    fn data_url(&self) -> String {
        format!(
            "{}/v1/{}/data/{}",
            self.settings.address.trim_end_matches('/'),
            self.settings.mount.trim_matches('/'),
            self.settings.secret_name.trim_matches('/'),
        )
    }

    async fn read_secret(&self) -> Result<Option<Snapshot>> {
        let response = self
            .client
            .get(self.data_url())
            .header(VAULT_TOKEN_HEADER, self.settings.token.expose())
            .timeout(self.settings.timeout)
            .send()
            .await
            .map_err(|e| Error::StoreUnavailable(format!("vault read request failed: {e}")))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!(secret = %self.settings.secret_name, "vault secret not found");
            return Ok(None);
        }
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            return Err(Error::StoreUnavailable(format!(
                "vault read of {} returned {status}: {body}",
                self.settings.secret_name
            )));
        }

        let parsed: KvReadResponse = response
            .json()
            .await
            .map_err(|e| Error::StoreCorrupt(format!("invalid vault read response: {e}")))?;

        // A soft-deleted latest version reads back with null data
        let Some(data) = parsed.data.data else {
            return Ok(None);
        };

        let contents = match data.get(VALUE_KEY) {
            Some(serde_json::Value::String(value)) => value.clone().into_bytes(),
            _ => serde_json::to_vec(&data)
                .map_err(|e| Error::StoreCorrupt(format!("re-encoding vault secret: {e}")))?,
        };

        Ok(Some(Snapshot {
            contents,
            version: Some(parsed.data.metadata.version),
        }))
    }

    async fn write_secret(&self, contents: &[u8], expected_version: Option<u64>) -> Result<WriteOutcome> {
        let value = std::str::from_utf8(contents)
            .map_err(|e| Error::StoreCorrupt(format!("credential bundle is not UTF-8: {e}")))?;
        // cas = 0 only allows creating the secret
        let body = serde_json::json!({
            "options": { "cas": expected_version.unwrap_or(0) },
            "data": { "value": value },
        });

        let response = self
            .client
            .post(self.data_url())
            .header(VAULT_TOKEN_HEADER, self.settings.token.expose())
            .timeout(self.settings.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::StoreUnavailable(format!("vault write request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(WriteOutcome::Written);
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));
        if status == StatusCode::BAD_REQUEST && body.contains("check-and-set") {
            return Ok(WriteOutcome::Conflict);
        }
        Err(Error::StoreUnavailable(format!(
            "vault write of {} returned {status}: {body}",
            self.settings.secret_name
        )))
    }
}

impl StoreBackend for VaultBackend {
    fn kind(&self) -> &'static str {
        "vault"
    }

    fn read(&self) -> Pin<Box<dyn Future<Output = Result<Option<Snapshot>>> + Send + '_>> {
        Box::pin(self.read_secret())
    }

    fn write<'a>(
        &'a self,
        contents: &'a [u8],
        expected_version: Option<u64>,
    ) -> Pin<Box<dyn Future<Output = Result<WriteOutcome>> + Send + 'a>> {
        Box::pin(self.write_secret(contents, expected_version))
    }
}
