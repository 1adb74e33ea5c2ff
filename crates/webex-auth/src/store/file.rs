//! Local file backend
//!
//! Used for interactive and manual operation. The bundle lives in a single
//! JSON file; writes go to a temp file in the same directory and are renamed
//! over the target, so a crash mid-write never leaves a truncated bundle.

use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tracing::debug;

use super::{Snapshot, StoreBackend, WriteOutcome};
use crate::error::{Error, Result};

/// Credential bundle stored in a local JSON file.
#[derive(Debug, Clone)]
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StoreBackend for FileBackend {
    fn kind(&self) -> &'static str {
        "file"
    }

    fn read(&self) -> Pin<Box<dyn Future<Output = Result<Option<Snapshot>>> + Send + '_>> {
        Box::pin(async move {
            match tokio::fs::read(&self.path).await {
                Ok(contents) => Ok(Some(Snapshot {
                    contents,
                    version: None,
                })),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    debug!(path = %self.path.display(), "credential file not found");
                    Ok(None)
                }
                Err(e) => Err(Error::StoreUnavailable(format!(
                    "reading credential file {}: {e}",
                    self.path.display()
                ))),
            }
        })
    }

    fn write<'a>(
        &'a self,
        contents: &'a [u8],
        _expected_version: Option<u64>,
    ) -> Pin<Box<dyn Future<Output = Result<WriteOutcome>> + Send + 'a>> {
        Box::pin(async move {
            write_atomic(&self.path, contents).await?;
            Ok(WriteOutcome::Written)
        })
    }
}

/// Write bytes to a file atomically with 0600 permissions.
///
/// The temp name carries the pid and a random suffix so overlapping
/// invocations never share a temp file. A failed write removes its temp file.
async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Configuration(format!("invalid credential path {}", path.display())))?;

    let tmp_path = dir.join(format!(
        ".{file_name}.tmp.{}.{}",
        std::process::id(),
        uuid::Uuid::new_v4().as_simple()
    ));

    if let Err(e) = write_and_rename(&tmp_path, path, contents).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e);
    }

    debug!(path = %path.display(), "persisted credential file");
    Ok(())
}

async fn write_and_rename(tmp_path: &Path, path: &Path, contents: &[u8]) -> Result<()> {
    tokio::fs::write(tmp_path, contents)
        .await
        .map_err(|e| Error::StoreUnavailable(format!("writing temp credential file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(tmp_path, perms)
            .await
            .map_err(|e| {
                Error::StoreUnavailable(format!("setting credential file permissions: {e}"))
            })?;
    }

    tokio::fs::rename(tmp_path, path)
        .await
        .map_err(|e| Error::StoreUnavailable(format!("renaming temp credential file: {e}")))
}
