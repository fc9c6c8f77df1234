use std::fmt;

/// Error type for engine operations.
#[derive(Debug)]
pub enum EngineError {
    /// Engine could not be configured (manual calculation refused).
    /// Non-retryable for this document.
    Init(String),
    /// Even the repair-mode open failed. Non-retryable.
    DocumentOpen(String),
    /// Defined-name corruption persisted after one repair round-trip.
    NameCorruption(String),
    /// The trampoline jump failed or a step of it raised.
    /// The session must be discarded.
    Execution(String),
    /// Property index not in the supported translation table.
    UnsupportedIndex(u32),
    /// Transport failure talking to the automation bridge process.
    Bridge(String),
    /// Engine-level exception surfaced verbatim for diagnostics.
    Processing(String),
    /// File I/O error.
    Io(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init(msg) => write!(f, "engine init error: {msg}"),
            Self::DocumentOpen(msg) => write!(f, "document open error: {msg}"),
            Self::NameCorruption(msg) => write!(f, "unrecoverable name corruption: {msg}"),
            Self::Execution(msg) => write!(f, "execution error: {msg}"),
            Self::UnsupportedIndex(idx) => write!(f, "unsupported property index: {idx}"),
            Self::Bridge(msg) => write!(f, "bridge error: {msg}"),
            Self::Processing(msg) => write!(f, "engine error: {msg}"),
            Self::Io(msg) => write!(f, "IO error: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
