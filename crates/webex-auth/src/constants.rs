//! Webex endpoint defaults
//!
//! Every URL here can be overridden from configuration; tests point them at
//! a local mock server.

/// Base URL of the downstream administrative API
pub const DEFAULT_API_BASE_URL: &str = "https://webexapis.com";

/// OAuth token endpoint used to refresh the bridge credential
pub const DEFAULT_OAUTH_TOKEN_URL: &str = "https://webexapis.com/v1/access_token";

/// Lightweight authenticated endpoint used to probe token validity
pub const DEFAULT_PROBE_PATH: &str = "/v1/people/me";

/// Refresh-token grant endpoint for downstream (service app) tokens
pub const ACCESS_TOKEN_PATH: &str = "/v1/access_token";

/// Per-call timeout applied when none is configured
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// A token whose recorded expiry falls within this margin is treated as expired
pub const DEFAULT_EXPIRY_MARGIN_SECS: u64 = 60;

/// Token-issuance path for a service app, bearer-authenticated with the bridge token.
pub fn application_token_path(app_id: &str) -> String {
    format!("/v1/applications/{app_id}/token")
}

/// Current unix time in milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Absolute expiry in unix milliseconds for a token issued at `now_millis`
/// with an `expires_in` of `expires_in_secs`. Saturates instead of overflowing
/// on absurd provider values.
pub fn expires_at(now_millis: u64, expires_in_secs: u64) -> u64 {
    now_millis.saturating_add(expires_in_secs.saturating_mul(1000))
}
