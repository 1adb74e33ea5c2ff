//! In-memory versioned backend for tests
//!
//! Behaves like a compare-and-swap secret store: every successful write
//! bumps the version, and a write whose expected version is stale is
//! refused. `interleave_write` simulates another invocation writing between
//! our read and our write.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use super::{Snapshot, StoreBackend, WriteOutcome};
use crate::error::Result;

#[derive(Debug, Default)]
struct State {
    contents: Option<Vec<u8>>,
    version: u64,
    writes: usize,
    conflicts: usize,
    interleaved: VecDeque<Vec<u8>>,
}

/// Shared, cloneable in-memory store. Clones see the same contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
}

impl MemoryBackend {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_contents(contents: &[u8]) -> Self {
        let backend = Self::default();
        {
            let mut state = backend.lock();
            state.contents = Some(contents.to_vec());
            state.version = 1;
        }
        backend
    }

    /// Current stored bytes.
    pub fn contents(&self) -> Option<Vec<u8>> {
        self.lock().contents.clone()
    }

    /// Number of successful writes made through `write`.
    pub fn writes(&self) -> usize {
        self.lock().writes
    }

    /// Number of writes refused because of a version mismatch.
    pub fn conflicts(&self) -> usize {
        self.lock().conflicts
    }

    /// Queue a foreign write that lands just before the next `write` call.
    pub fn interleave_write(&self, contents: Vec<u8>) {
        self.lock().interleaved.push_back(contents);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl StoreBackend for MemoryBackend {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn read(&self) -> Pin<Box<dyn Future<Output = Result<Option<Snapshot>>> + Send + '_>> {
        let state = self.lock();
        let snapshot = state.contents.clone().map(|contents| Snapshot {
            contents,
            version: Some(state.version),
        });
        Box::pin(async move { Ok(snapshot) })
    }

    fn write<'a>(
        &'a self,
        contents: &'a [u8],
        expected_version: Option<u64>,
    ) -> Pin<Box<dyn Future<Output = Result<WriteOutcome>> + Send + 'a>> {
        let mut state = self.lock();
        if let Some(foreign) = state.interleaved.pop_front() {
            state.contents = Some(foreign);
            state.version += 1;
        }

        let current = state.contents.as_ref().map(|_| state.version);
        let outcome = if current == expected_version {
            state.contents = Some(contents.to_vec());
            state.version += 1;
            state.writes += 1;
            WriteOutcome::Written
        } else {
            state.conflicts += 1;
            WriteOutcome::Conflict
        };
        Box::pin(async move { Ok(outcome) })
    }
}
