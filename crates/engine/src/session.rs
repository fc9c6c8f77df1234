//! Engine session lifecycle.
//!
//! One session owns one engine process and one open document. Sessions
//! are exclusive to the call that opened them — never pooled, never
//! shared. Teardown terminates the engine unconditionally.

use std::path::{Path, PathBuf};

use crate::backend::{EngineBackend, EngineConfig, OpenMode};
use crate::error::EngineError;

/// Factory for engine backends. The server injects a bridge-process
/// spawner; tests inject the in-memory harness.
pub trait EngineSpawner: Send + Sync {
    fn spawn(&self) -> Result<Box<dyn EngineBackend>, EngineError>;
}

/// A configured, isolated handle to the engine with one document open.
pub struct EngineSession {
    backend: Box<dyn EngineBackend>,
    path: PathBuf,
}

impl EngineSession {
    /// Start a fresh engine, configure it, and open `path`.
    ///
    /// The open is attempted plain first; on any failure it falls back
    /// to a repair-mode open. If that also fails the error is
    /// `EngineError::DocumentOpen` (non-retryable).
    pub fn open(spawner: &dyn EngineSpawner, path: &Path) -> Result<Self, EngineError> {
        let mut backend = spawner.spawn()?;
        backend.configure(&EngineConfig::default())?;
        open_with_repair_fallback(backend.as_mut(), path)?;
        Ok(Self { backend, path: path.to_path_buf() })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backend(&mut self) -> &mut dyn EngineBackend {
        self.backend.as_mut()
    }

    /// Bridge process id, if the backend runs one.
    pub fn pid(&self) -> Option<u32> {
        self.backend.pid()
    }

    /// Close the current document and open `path` in its place, with the
    /// same plain-then-repair fallback. Used by the null-byte-name
    /// recovery after saving a rewritten sibling copy.
    pub fn reopen(&mut self, path: &Path) -> Result<(), EngineError> {
        self.backend.close_document()?;
        open_with_repair_fallback(self.backend.as_mut(), path)?;
        self.path = path.to_path_buf();
        Ok(())
    }
}

fn open_with_repair_fallback(
    backend: &mut dyn EngineBackend,
    path: &Path,
) -> Result<(), EngineError> {
    if let Err(first) = backend.open_document(path, OpenMode::Normal) {
        log::debug!("plain open failed ({first}), retrying in repair mode: {}", path.display());
        backend.open_document(path, OpenMode::Repair).map_err(|e| {
            EngineError::DocumentOpen(format!("{}: repair open failed: {e}", path.display()))
        })?;
    }
    Ok(())
}

impl Drop for EngineSession {
    fn drop(&mut self) {
        // Unconditional, best-effort. Failures are swallowed.
        self.backend.terminate();
    }
}
