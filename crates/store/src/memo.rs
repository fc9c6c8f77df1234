//! Disk-backed memoization for expensive, deterministic operations.
//!
//! Entries are keyed by SHA-256 of (operation name, canonical JSON
//! arguments). A bypass flag skips the read but still refreshes the
//! stored entry, so a forced recomputation heals a stale cache.
//! Cache write failures are logged and swallowed — a broken cache must
//! never fail a call that already computed its result.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::StoreError;

/// Per-process sequence so concurrent writers never share a temp path.
static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Cache of (operation, arguments) -> JSON result.
pub struct MemoCache {
    root: PathBuf,
}

impl MemoCache {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Run `op` through the cache.
    ///
    /// With `bypass=false`, a hit returns the stored value without
    /// invoking `f`. With `bypass=true`, `f` always runs and its result
    /// replaces the stored entry.
    pub fn cached<E, F>(&self, op: &str, args: &Value, bypass: bool, f: F) -> Result<Value, E>
    where
        F: FnOnce() -> Result<Value, E>,
    {
        let key = self.entry_key(op, args);
        if !bypass {
            if let Some(hit) = self.read_entry(&key) {
                log::debug!("memo hit for {op}");
                return Ok(hit);
            }
        }

        let value = f()?;
        if let Err(e) = self.write_entry(&key, &value) {
            log::warn!("memo write failed for {op}: {e}");
        }
        Ok(value)
    }

    fn entry_key(&self, op: &str, args: &Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(op.as_bytes());
        hasher.update([0u8]);
        hasher.update(args.to_string().as_bytes());
        let digest = hasher.finalize();
        let mut out = String::with_capacity(digest.len() * 2);
        for byte in digest {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.json"))
    }

    fn read_entry(&self, key: &str) -> Option<Value> {
        let contents = std::fs::read_to_string(self.entry_path(key)).ok()?;
        serde_json::from_str(&contents).ok()
    }

    fn write_entry(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        let contents =
            serde_json::to_string(value).map_err(|e| StoreError::Encode(e.to_string()))?;
        let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
        let tmp = self.root.join(format!(".tmp-{key}-{}-{seq}", std::process::id()));
        std::fs::write(&tmp, contents)?;
        std::fs::rename(tmp, self.entry_path(key))?;
        Ok(())
    }
}
