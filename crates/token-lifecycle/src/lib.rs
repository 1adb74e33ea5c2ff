//! Downstream token lifecycle
//!
//! `TokenManager` keeps a Webex service app token valid by probing it and,
//! when needed, walking the refresh cascade (downstream refresh, bridge
//! issuance, OAuth bridge refresh, manual re-authorization).
//! `AuthenticatedClient` wraps business calls with one refresh-and-retry
//! on an auth rejection.

pub mod client;
pub mod error;
pub mod manager;
pub mod telemetry;

#[cfg(test)]
mod testing;

pub use client::{AuthenticatedClient, DownstreamRequest, DownstreamResponse};
pub use error::{Error, Result};
pub use manager::{Session, TokenManager, TokenState};
pub use telemetry::Tier;
