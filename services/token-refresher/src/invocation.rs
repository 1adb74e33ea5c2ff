//! One scheduled invocation
//!
//! Wires configuration into a `TokenManager`, runs the requested mode under
//! the configured deadline, and turns the outcome into the one-line JSON
//! result the scheduler records. Startup failures take the same path as
//! every other failure.

use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, Instant};

use common::Secret;
use serde::Serialize;
use token_lifecycle::{AuthenticatedClient, TokenManager};
use tracing::info;
use webex_auth::{
    CredentialStore, DownstreamApi, FileBackend, OAuthRefresher, VaultBackend, VaultSettings,
    build_http_client,
};

use crate::config::{Config, StoreConfig};
use crate::datasource::{self, Extension};
use crate::error::Error;

/// What the invocation should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Ensure a valid token, then extend the configured data source
    Run,
    /// Run the refresh cascade even if the current token works
    Refresh,
    /// Print a valid access token for other tools
    Token,
}

impl Mode {
    pub fn label(self) -> &'static str {
        match self {
            Mode::Run => "run",
            Mode::Refresh => "refresh",
            Mode::Token => "token",
        }
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "run" => Ok(Mode::Run),
            "refresh" => Ok(Mode::Refresh),
            "token" => Ok(Mode::Token),
            other => Err(format!(
                "unknown command {other:?}, expected one of: run, refresh, token"
            )),
        }
    }
}

/// What a successful invocation produced.
#[derive(Debug)]
pub struct Completed {
    pub access_token: Secret<String>,
    pub token_expiry: Option<u64>,
    pub extension: Option<Extension>,
}

/// Result line printed for `run` and `refresh`.
#[derive(Debug, Serialize)]
pub struct InvocationResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_expiry: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_source_expiry: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    pub invocation_id: String,
}

impl InvocationResult {
    pub fn new(invocation_id: &str, outcome: &Result<Completed, Error>) -> Self {
        match outcome {
            Ok(completed) => {
                let message = match &completed.extension {
                    Some(_) => "downstream token valid, data source token extended",
                    None => "downstream token valid",
                };
                Self {
                    success: true,
                    message: message.to_string(),
                    token_expiry: completed.token_expiry,
                    error_kind: None,
                    data_source_expiry: completed
                        .extension
                        .as_ref()
                        .and_then(|e| e.token_expiry.clone()),
                    nonce: completed.extension.as_ref().map(|e| e.nonce.clone()),
                    invocation_id: invocation_id.to_string(),
                }
            }
            Err(e) => Self {
                success: false,
                message: e.to_string(),
                token_expiry: None,
                error_kind: Some(e.kind()),
                data_source_expiry: None,
                nonce: None,
                invocation_id: invocation_id.to_string(),
            },
        }
    }
}

/// Load configuration from `config_path` and build the token manager.
///
/// Any failure here is a `Configuration` error.
pub fn prepare(config_path: &Path) -> Result<(Config, TokenManager), Error> {
    let config = Config::load_or_default(config_path).map_err(|e| {
        token_lifecycle::Error::Configuration(format!(
            "loading config from {}: {e}",
            config_path.display()
        ))
    })?;
    info!(
        remote_store = config.store.uses_remote(),
        base_url = %config.api.base_url,
        data_source = config.invocation.data_source_id.as_deref().unwrap_or("none"),
        deadline_secs = config.invocation.deadline_secs,
        "configuration loaded"
    );
    let manager = build_manager(&config)?;
    Ok((config, manager))
}

/// Build the token manager described by `config`. The invocation deadline,
/// if any, starts counting now.
pub fn build_manager(config: &Config) -> Result<TokenManager, Error> {
    let timeout = Duration::from_secs(config.api.timeout_secs);
    let client = build_http_client(timeout).map_err(|e| {
        token_lifecycle::Error::Configuration(format!("building HTTP client: {e}"))
    })?;

    let store = build_store(&config.store, client.clone(), timeout)?;
    info!(store = store.kind(), "credential store selected");

    let manager = TokenManager::new(
        store,
        DownstreamApi::new(client.clone(), &config.api.base_url, &config.api.probe_path),
        OAuthRefresher::new(client, &config.api.oauth_token_url),
    )
    .with_expiry_margin(Duration::from_secs(config.api.expiry_margin_secs));

    Ok(match config.invocation.deadline_secs {
        Some(secs) => manager.with_deadline(Instant::now() + Duration::from_secs(secs)),
        None => manager,
    })
}

/// Remote store when a secret name is configured, local file otherwise.
fn build_store(
    config: &StoreConfig,
    client: reqwest::Client,
    timeout: Duration,
) -> Result<CredentialStore, Error> {
    let Some(secret_name) = &config.secret_name else {
        return Ok(CredentialStore::new(FileBackend::new(&config.path)));
    };

    let (Some(address), Some(token)) = (&config.vault_addr, &config.vault_token) else {
        return Err(token_lifecycle::Error::Configuration(
            "remote credential store needs a Vault address and token".into(),
        )
        .into());
    };

    Ok(CredentialStore::new(VaultBackend::new(
        client,
        VaultSettings {
            address: address.clone(),
            mount: config.vault_mount.clone(),
            secret_name: secret_name.clone(),
            token: token.clone(),
            timeout,
        },
    )))
}

/// Run `mode` once against `manager`.
pub async fn execute(
    mode: Mode,
    manager: &TokenManager,
    config: &Config,
) -> Result<Completed, Error> {
    let mut session = manager.start_session().await?;

    let extension = match (mode, config.invocation.data_source_id.as_deref()) {
        (Mode::Refresh, _) => {
            manager.force_refresh(&mut session).await?;
            None
        }
        (Mode::Run, Some(id)) => {
            let mut client = AuthenticatedClient::new(manager, session);
            let extension =
                datasource::extend(&mut client, id, config.invocation.token_lifetime_minutes)
                    .await?;
            session = client.into_session();
            Some(extension)
        }
        (Mode::Run, None) | (Mode::Token, _) => None,
    };

    let access_token = manager.ensure_valid_token(&mut session).await?;
    Ok(Completed {
        access_token,
        token_expiry: session.token_expiry(),
        extension,
    })
}
