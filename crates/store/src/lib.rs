//! Shared on-disk state: the content-addressed document store and the
//! memoization cache. Both support concurrent readers and writers;
//! duplicate-key writes are last-writer-wins, which is safe because
//! identical keys hold identical values.

pub mod cas;
pub mod memo;

use std::fmt;

pub use cas::DocumentStore;
pub use memo::MemoCache;

/// Error type for store operations.
#[derive(Debug)]
pub enum StoreError {
    /// File I/O error.
    Io(String),
    /// Serialization error for a cache payload.
    Encode(String),
    /// No stored document matches the handle.
    UnknownHandle(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(msg) => write!(f, "IO error: {msg}"),
            Self::Encode(msg) => write!(f, "encode error: {msg}"),
            Self::UnknownHandle(handle) => write!(f, "unknown document handle: {handle}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
