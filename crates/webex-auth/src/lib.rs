//! Webex credential plumbing
//!
//! Wire-level building blocks for keeping a downstream service app token
//! alive. This crate knows how to talk to each endpoint and how to persist
//! the credential bundle; deciding which endpoint to call and when lives in
//! `token-lifecycle`.
//!
//! - `bundle`: the credential bundle model, validated once at load
//! - `store`: `CredentialStore` over a file or Vault backend, merge-on-write
//! - `token`: probe, downstream refresh, and service app token issuance
//! - `oauth`: refresh of the OAuth-managed bridge credential

pub mod bundle;
pub mod constants;
pub mod error;
pub mod oauth;
pub mod store;
pub mod token;

pub use bundle::{
    ActiveBridge, BridgeCredential, CredentialBundle, DownstreamToken, OAuthBridge,
    ServiceIdentity,
};
pub use constants::*;
pub use error::{EndpointError, Error, ErrorClassification, Result, classify_status};
pub use oauth::{BridgeGrant, OAuthRefresher};
pub use store::{
    BundlePatch, CredentialStore, FileBackend, Snapshot, StoreBackend, VaultBackend,
    VaultSettings, WriteOutcome,
};
#[cfg(any(test, feature = "test-utils"))]
pub use store::MemoryBackend;
pub use token::{DownstreamApi, TokenResponse, build_http_client};
