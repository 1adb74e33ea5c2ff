//! Common types shared by the token refresher crates

mod secret;
mod error;

pub use secret::Secret;
pub use error::{Error, Result};
