//! Credential persistence
//!
//! `CredentialStore` is the only way the rest of the system reads or writes
//! the credential bundle. It sits on top of a `StoreBackend`, which moves raw
//! bytes to and from either a local file or a remote secret store. The
//! backend is chosen once at startup; nothing above this module knows which
//! one is active.
//!
//! Saves are merge-on-write: the store diffs the bundle being saved against
//! the snapshot it last loaded or saved, re-reads the backend, and applies
//! only the changed field groups to the stored JSON document. Everything
//! else in the document, modelled or not, is written back as it was read. Backends that report versions get a
//! compare-and-swap write, and a conflicting concurrent writer triggers a
//! re-read and re-merge instead of an overwrite.

pub mod file;
#[cfg(any(test, feature = "test-utils"))]
pub mod memory;
pub mod patch;
pub mod vault;

use std::future::Future;
use std::pin::Pin;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::bundle::CredentialBundle;
use crate::error::{Error, Result};

pub use file::FileBackend;
#[cfg(any(test, feature = "test-utils"))]
pub use memory::MemoryBackend;
pub use patch::BundlePatch;
pub use vault::{VaultBackend, VaultSettings};

/// Re-read/re-merge attempts before a save gives up on a contended store.
const MAX_MERGE_ATTEMPTS: u32 = 3;

/// Raw stored bytes plus the backend's version of them, if it tracks one.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub contents: Vec<u8>,
    pub version: Option<u64>,
}

/// Result of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// The stored version no longer matched the expected one
    Conflict,
}

/// Byte-level storage for the credential bundle.
///
/// Uses `Pin<Box<dyn Future>>` return types so the store can hold a
/// `Box<dyn StoreBackend>` chosen at runtime.
pub trait StoreBackend: Send + Sync {
    /// Backend label for logs ("file", "vault", "memory")
    fn kind(&self) -> &'static str;

    /// Read the current contents. `Ok(None)` means nothing is stored yet.
    fn read(&self) -> Pin<Box<dyn Future<Output = Result<Option<Snapshot>>> + Send + '_>>;

    /// Replace the stored contents atomically.
    ///
    /// `expected_version` is the version observed by the preceding `read`.
    /// Backends with versioning must refuse the write with
    /// `WriteOutcome::Conflict` if the stored version moved on; backends
    /// without versioning ignore it.
    fn write<'a>(
        &'a self,
        contents: &'a [u8],
        expected_version: Option<u64>,
    ) -> Pin<Box<dyn Future<Output = Result<WriteOutcome>> + Send + 'a>>;
}

/// Loads and persists the credential bundle through one backend.
pub struct CredentialStore {
    backend: Box<dyn StoreBackend>,
    /// Last bundle observed in the backend; the base for save diffs
    base: Mutex<Option<CredentialBundle>>,
}

impl CredentialStore {
    pub fn new(backend: impl StoreBackend + 'static) -> Self {
        Self {
            backend: Box::new(backend),
            base: Mutex::new(None),
        }
    }

    /// Label of the active backend.
    pub fn kind(&self) -> &'static str {
        self.backend.kind()
    }

    /// Load and validate the bundle.
    ///
    /// Fails with `StoreUnavailable` when nothing is stored, `StoreCorrupt`
    /// on malformed content, `Configuration` on a missing service identity.
    pub async fn load(&self) -> Result<CredentialBundle> {
        let snapshot = self.backend.read().await?.ok_or_else(|| {
            Error::StoreUnavailable(format!(
                "no credential bundle in {} store",
                self.backend.kind()
            ))
        })?;
        let bundle = CredentialBundle::from_slice(&snapshot.contents)?;
        info!(
            backend = self.backend.kind(),
            version = ?snapshot.version,
            oauth_bridge = bundle.bridge_credential.oauth.is_some(),
            "loaded credential bundle"
        );
        *self.base.lock().await = Some(bundle.clone());
        Ok(bundle)
    }

    /// Persist the fields of `bundle` that changed since the last load or save.
    ///
    /// Fields changed concurrently by another writer are preserved unless
    /// this bundle changed the same field group, in which case this write
    /// wins. Returns the bundle as persisted after merging.
    pub async fn save(&self, bundle: &CredentialBundle) -> Result<CredentialBundle> {
        let mut base = self.base.lock().await;
        let patch = BundlePatch::between(base.as_ref(), bundle);
        if patch.is_empty() {
            debug!(backend = self.backend.kind(), "no credential changes to persist");
            return Ok(base.clone().unwrap_or_else(|| bundle.clone()));
        }

        for attempt in 1..=MAX_MERGE_ATTEMPTS {
            let snapshot = self.backend.read().await?;
            let (contents, version) = match snapshot {
                Some(snapshot) => {
                    let mut document: serde_json::Value = serde_json::from_slice(&snapshot.contents)
                        .map_err(|e| Error::StoreCorrupt(format!("parsing credential bundle: {e}")))?;
                    patch.apply(&mut document)?;
                    let contents = serde_json::to_vec_pretty(&document).map_err(|e| {
                        Error::StoreCorrupt(format!("serializing credential bundle: {e}"))
                    })?;
                    (contents, snapshot.version)
                }
                None => (bundle.to_vec()?, None),
            };
            let merged = CredentialBundle::from_slice(&contents)?;

            match self.backend.write(&contents, version).await? {
                WriteOutcome::Written => {
                    info!(
                        backend = self.backend.kind(),
                        fields = %patch.fields().join(","),
                        attempt,
                        "persisted credential bundle"
                    );
                    *base = Some(merged.clone());
                    return Ok(merged);
                }
                WriteOutcome::Conflict => {
                    warn!(
                        backend = self.backend.kind(),
                        attempt,
                        "credential bundle changed concurrently, re-merging"
                    );
                }
            }
        }

        Err(Error::StoreUnavailable(format!(
            "credential bundle kept changing concurrently; gave up after {MAX_MERGE_ATTEMPTS} attempts"
        )))
    }
}
