//! Configuration types and loading
//!
//! Config precedence: env vars > config file > defaults. The Vault token is
//! loaded from VAULT_TOKEN or vault_token_file, never stored in the TOML.
//!
//! Scheduled runtimes usually ship no config file at all; when the default
//! path does not exist the defaults plus the environment are used. A path
//! given explicitly must exist.

use common::Secret;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use webex_auth::{
    DEFAULT_API_BASE_URL, DEFAULT_EXPIRY_MARGIN_SECS, DEFAULT_OAUTH_TOKEN_URL, DEFAULT_PROBE_PATH,
    DEFAULT_TIMEOUT_SECS,
};

pub const DEFAULT_CONFIG_FILE: &str = "token-refresher.toml";

/// Longest token lifetime the data source API accepts (24 hours)
pub const MAX_TOKEN_LIFETIME_MINUTES: u32 = 1440;

/// Root configuration
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub api: ApiConfig,
    pub invocation: InvocationConfig,
}

/// Where the credential bundle lives
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Local bundle file, used when no secret name is configured
    pub path: PathBuf,
    /// Remote secret name; selects the Vault backend when set
    pub secret_name: Option<String>,
    pub vault_addr: Option<String>,
    pub vault_mount: String,
    /// Path to a file containing the Vault token (alternative to VAULT_TOKEN)
    pub vault_token_file: Option<PathBuf>,
    #[serde(skip)]
    pub vault_token: Option<Secret<String>>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("token-config.json"),
            secret_name: None,
            vault_addr: None,
            vault_mount: "secret".into(),
            vault_token_file: None,
            vault_token: None,
        }
    }
}

impl StoreConfig {
    pub fn uses_remote(&self) -> bool {
        self.secret_name.is_some()
    }
}

/// Downstream API endpoints
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub oauth_token_url: String,
    pub probe_path: String,
    pub timeout_secs: u64,
    pub expiry_margin_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE_URL.into(),
            oauth_token_url: DEFAULT_OAUTH_TOKEN_URL.into(),
            probe_path: DEFAULT_PROBE_PATH.into(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            expiry_margin_secs: DEFAULT_EXPIRY_MARGIN_SECS,
        }
    }
}

/// Per-invocation settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct InvocationConfig {
    /// Hard limit for the whole invocation
    pub deadline_secs: Option<u64>,
    /// Data source whose token `run` extends
    pub data_source_id: Option<String>,
    pub token_lifetime_minutes: u32,
    /// Prometheus textfile written at the end of each run
    pub metrics_textfile: Option<PathBuf>,
}

impl Default for InvocationConfig {
    fn default() -> Self {
        Self {
            deadline_secs: None,
            data_source_id: None,
            token_lifetime_minutes: MAX_TOKEN_LIFETIME_MINUTES,
            metrics_textfile: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Vault token resolution order:
    /// 1. VAULT_TOKEN env var
    /// 2. vault_token_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| common::Error::read(path, e))?;
        let config: Config = toml::from_str(&contents)?;
        config.finish()
    }

    /// Like `load`, but a missing file at the default location falls back to
    /// defaults plus environment.
    pub fn load_or_default(path: &Path) -> common::Result<Self> {
        if path == Path::new(DEFAULT_CONFIG_FILE) && !path.exists() {
            return Config::default().finish();
        }
        Config::load(path)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from(DEFAULT_CONFIG_FILE)
    }

    fn finish(mut self) -> common::Result<Self> {
        self.apply_env()?;
        self.resolve_vault_token()?;
        self.validate()?;
        Ok(self)
    }

    fn apply_env(&mut self) -> common::Result<()> {
        if let Some(name) = env_value("SECRET_NAME") {
            self.store.secret_name = Some(name);
        }
        if let Some(addr) = env_value("VAULT_ADDR") {
            self.store.vault_addr = Some(addr);
        }
        if let Some(path) = env_value("TOKEN_CONFIG_PATH") {
            self.store.path = PathBuf::from(path);
        }
        if let Some(id) = env_value("DATA_SOURCE_ID") {
            self.invocation.data_source_id = Some(id);
        }
        if let Some(path) = metrics_textfile_from_env() {
            self.invocation.metrics_textfile = Some(path);
        }
        if let Some(minutes) = env_value("TOKEN_LIFETIME_MINUTES") {
            self.invocation.token_lifetime_minutes = minutes.parse().map_err(|_| {
                common::Error::Config(format!(
                    "TOKEN_LIFETIME_MINUTES must be a whole number of minutes, got: {minutes}"
                ))
            })?;
        }
        Ok(())
    }

    fn resolve_vault_token(&mut self) -> common::Result<()> {
        if let Some(token) = env_value("VAULT_TOKEN") {
            self.store.vault_token = Some(Secret::new(token));
        } else if let Some(ref token_file) = self.store.vault_token_file {
            let token = std::fs::read_to_string(token_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read vault_token_file {}: {e}",
                    token_file.display()
                ))
            })?;
            let token = token.trim().to_owned();
            if !token.is_empty() {
                self.store.vault_token = Some(Secret::new(token));
            }
        }
        Ok(())
    }

    fn validate(&self) -> common::Result<()> {
        require_http_url("base_url", &self.api.base_url)?;
        require_http_url("oauth_token_url", &self.api.oauth_token_url)?;

        if self.api.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if self.invocation.deadline_secs == Some(0) {
            return Err(common::Error::Config(
                "deadline_secs must be greater than 0".into(),
            ));
        }

        let minutes = self.invocation.token_lifetime_minutes;
        if !(1..=MAX_TOKEN_LIFETIME_MINUTES).contains(&minutes) {
            return Err(common::Error::Config(format!(
                "token_lifetime_minutes must be between 1 and {MAX_TOKEN_LIFETIME_MINUTES}, got: {minutes}"
            )));
        }

        if self.store.uses_remote() {
            let Some(addr) = self.store.vault_addr.as_deref() else {
                return Err(common::Error::Config(
                    "secret_name is set but vault_addr (or VAULT_ADDR) is missing".into(),
                ));
            };
            require_http_url("vault_addr", addr)?;
            if self.store.vault_token.is_none() {
                return Err(common::Error::Config(
                    "secret_name is set but no Vault token was found in VAULT_TOKEN or vault_token_file"
                        .into(),
                ));
            }
        }

        Ok(())
    }
}

/// Textfile path from METRICS_TEXTFILE. Also consulted when the
/// configuration itself could not be loaded.
pub fn metrics_textfile_from_env() -> Option<PathBuf> {
    env_value("METRICS_TEXTFILE").map(PathBuf::from)
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn require_http_url(field: &str, url: &str) -> common::Result<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        return Ok(());
    }
    Err(common::Error::Config(format!(
        "{field} must start with http:// or https://, got: {url}"
    )))
}
