//! Error taxonomy for the credential lifecycle
//!
//! Lower-level transport and provider errors are translated into these
//! variants before they leave this crate; callers never see a raw
//! `reqwest` or store error.

/// Errors surfaced by `TokenManager` and `AuthenticatedClient`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing or malformed service identity or store settings. Not retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("credential store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("credential store corrupt: {0}")]
    StoreCorrupt(String),

    /// Network failure, timeout or 5xx. The next scheduled run retries.
    #[error("transient failure: {0}")]
    TransientFailure(String),

    /// Every automated path is exhausted; an operator has to re-authorize.
    #[error("manual re-authorization required: {0}")]
    ManualReauthorizationRequired(String),

    /// The downstream API rejected us in a way no tier explains.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
}

impl Error {
    /// Stable label for logs, metrics, and invocation results.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Configuration(_) => "configuration_error",
            Error::StoreUnavailable(_) => "store_unavailable",
            Error::StoreCorrupt(_) => "store_corrupt",
            Error::TransientFailure(_) => "transient_failure",
            Error::ManualReauthorizationRequired(_) => "manual_reauthorization_required",
            Error::AuthenticationFailed(_) => "authentication_failed",
        }
    }

    /// Whether this failure needs a human before automation can recover.
    pub fn requires_operator(&self) -> bool {
        matches!(self, Error::ManualReauthorizationRequired(_))
    }
}

impl From<webex_auth::Error> for Error {
    fn from(err: webex_auth::Error) -> Self {
        match err {
            webex_auth::Error::Configuration(msg) => Error::Configuration(msg),
            webex_auth::Error::StoreUnavailable(msg) => Error::StoreUnavailable(msg),
            webex_auth::Error::StoreCorrupt(msg) => Error::StoreCorrupt(msg),
            webex_auth::Error::RefreshTokenExpired(msg) => Error::ManualReauthorizationRequired(
                format!("OAuth refresh token rejected: {msg}"),
            ),
            webex_auth::Error::TransientRefreshFailure(msg) => Error::TransientFailure(msg),
        }
    }
}

/// Result alias for lifecycle operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_errors_translate_into_taxonomy() {
        let err: Error = webex_auth::Error::RefreshTokenExpired("invalid_grant".into()).into();
        assert!(err.requires_operator());
        assert_eq!(err.kind(), "manual_reauthorization_required");

        let err: Error = webex_auth::Error::TransientRefreshFailure("timeout".into()).into();
        assert_eq!(err.kind(), "transient_failure");
        assert!(!err.requires_operator());

        let err: Error = webex_auth::Error::StoreCorrupt("bad json".into()).into();
        assert!(matches!(err, Error::StoreCorrupt(_)));
    }

    #[test]
    fn display_keeps_detail() {
        let err = Error::AuthenticationFailed("second 401 from /v1/dataSources".into());
        assert!(err.to_string().contains("/v1/dataSources"));
    }
}
