//! Error types for credential storage and token endpoint operations

/// Errors from credential storage and the OAuth bridge refresh.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("credential store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("credential store corrupt: {0}")]
    StoreCorrupt(String),

    #[error("OAuth refresh token expired or revoked: {0}")]
    RefreshTokenExpired(String),

    #[error("OAuth refresh failed transiently: {0}")]
    TransientRefreshFailure(String),
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Outcome class of a failed downstream HTTP call.
///
/// The cascade only cares whether a credential was rejected, whether the
/// failure may clear up on its own, or neither.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    /// 401/403: the presented credential was not accepted
    #[error("credential rejected ({status}): {body}")]
    Auth { status: u16, body: String },

    /// Network failure, timeout, 408, 429 or 5xx
    #[error("transient failure: {0}")]
    Transient(String),

    /// Any other non-success response, or an unusable success body
    #[error("request rejected ({status}): {body}")]
    Rejected { status: u16, body: String },
}

impl EndpointError {
    /// Build the error for a non-success status and its response body.
    pub fn from_status(status: u16, body: String) -> Self {
        match classify_status(status) {
            ErrorClassification::Auth => EndpointError::Auth { status, body },
            ErrorClassification::Transient => {
                EndpointError::Transient(format!("status {status}: {body}"))
            }
            ErrorClassification::Rejected => EndpointError::Rejected { status, body },
        }
    }

    /// Map a reqwest transport error. Timeouts and connection failures are
    /// always transient.
    pub fn from_transport(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            EndpointError::Transient(format!("request timed out: {err}"))
        } else {
            EndpointError::Transient(format!("request failed: {err}"))
        }
    }

    /// Whether this is an authentication-class failure.
    pub fn is_auth(&self) -> bool {
        matches!(self, EndpointError::Auth { .. })
    }

    /// Short label for structured logs and metrics.
    pub fn outcome(&self) -> &'static str {
        match self {
            EndpointError::Auth { .. } => "auth_rejected",
            EndpointError::Transient(_) => "transient",
            EndpointError::Rejected { .. } => "rejected",
        }
    }
}

/// Classification of a non-success HTTP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClassification {
    /// Invalid or expired credential
    Auth,
    /// Retryable by a later invocation
    Transient,
    /// The request itself was refused; retrying will not help
    Rejected,
}

/// Classify an HTTP status code.
///
/// 401/403 are authentication failures, 408/429/5xx are transient, every
/// other non-success status is a rejection.
pub fn classify_status(status: u16) -> ErrorClassification {
    match status {
        401 | 403 => ErrorClassification::Auth,
        408 | 429 | 500..=599 => ErrorClassification::Transient,
        _ => ErrorClassification::Rejected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_auth_statuses() {
        assert_eq!(classify_status(401), ErrorClassification::Auth);
        assert_eq!(classify_status(403), ErrorClassification::Auth);
    }

    #[test]
    fn classify_transient_statuses() {
        for status in [408, 429, 500, 502, 503, 504] {
            assert_eq!(
                classify_status(status),
                ErrorClassification::Transient,
                "status {status} should be transient"
            );
        }
    }

    #[test]
    fn classify_other_client_errors_as_rejected() {
        assert_eq!(classify_status(400), ErrorClassification::Rejected);
        assert_eq!(classify_status(404), ErrorClassification::Rejected);
        assert_eq!(classify_status(418), ErrorClassification::Rejected);
    }

    #[test]
    fn endpoint_error_from_status_keeps_body() {
        let err = EndpointError::from_status(401, "token expired".into());
        assert!(err.is_auth());
        assert!(err.to_string().contains("token expired"));
        assert_eq!(err.outcome(), "auth_rejected");

        let err = EndpointError::from_status(503, "maintenance".into());
        assert!(!err.is_auth());
        assert_eq!(err.outcome(), "transient");
    }
}
