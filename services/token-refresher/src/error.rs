//! Service-specific error types

use thiserror::Error;

/// Failures of a single invocation.
///
/// Credential lifecycle failures keep their own kind so the scheduler and
/// alerting can tell them apart; data source failures come from the
/// business call made after a valid token was obtained.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Lifecycle(#[from] token_lifecycle::Error),

    #[error("data source {id}: {message}")]
    DataSource {
        id: String,
        status: Option<u16>,
        message: String,
    },
}

impl Error {
    pub fn data_source(id: &str, status: Option<u16>, message: String) -> Self {
        Self::DataSource {
            id: id.to_string(),
            status,
            message,
        }
    }

    /// Stable label reported as `error_kind` in the invocation result.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Lifecycle(e) => e.kind(),
            Error::DataSource { .. } => "data_source_error",
        }
    }

    /// Process exit status: 2 is reserved for manual re-authorization.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Lifecycle(e) if e.requires_operator() => 2,
            _ => 1,
        }
    }
}
