//! Content-addressed document storage.
//!
//! A document is identified by the SHA-256 digest of its bytes and
//! materialized at `<root>/<digest>.bin`. Repeated submissions of
//! byte-identical documents share one on-disk copy and one handle.
//! Writes go to a temp file first and are renamed into place, so a
//! concurrent duplicate writer can never expose a partial file.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use sha2::{Digest, Sha256};

use crate::StoreError;

/// Per-process sequence so concurrent writers never share a temp path.
static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Stable on-disk home for uploaded documents.
pub struct DocumentStore {
    root: PathBuf,
}

impl DocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store `bytes`, returning the opaque handle (digest hex).
    pub fn put(&self, bytes: &[u8]) -> Result<String, StoreError> {
        let handle = digest_hex(bytes);
        let path = self.path_of(&handle);
        if path.exists() {
            log::debug!("dedup hit for {handle}");
            return Ok(handle);
        }

        let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
        let tmp = self.root.join(format!(".tmp-{handle}-{}-{seq}", std::process::id()));
        std::fs::write(&tmp, bytes)?;
        if let Err(e) = std::fs::rename(&tmp, &path) {
            // A concurrent writer of the same bytes may have won the
            // rename; the content is there either way.
            let _ = std::fs::remove_file(&tmp);
            if !path.exists() {
                return Err(e.into());
            }
        }
        log::debug!("stored {} bytes as {handle}", bytes.len());
        Ok(handle)
    }

    /// Resolve a handle to its materialized path. Fails if the handle
    /// does not correspond to a stored document.
    pub fn resolve(&self, handle: &str) -> Result<PathBuf, StoreError> {
        if !is_valid_handle(handle) {
            return Err(StoreError::UnknownHandle(handle.to_string()));
        }
        let path = self.path_of(handle);
        if !path.exists() {
            return Err(StoreError::UnknownHandle(handle.to_string()));
        }
        Ok(path)
    }

    fn path_of(&self, handle: &str) -> PathBuf {
        self.root.join(format!("{handle}.bin"))
    }
}

fn digest_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Handles are lowercase hex digests; anything else is rejected before
/// it can touch the filesystem.
fn is_valid_handle(handle: &str) -> bool {
    handle.len() == 64 && handle.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}
