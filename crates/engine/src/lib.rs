//! Engine sessions and isolated formula evaluation.
//!
//! The spreadsheet engine runs out-of-process behind the
//! [`backend::EngineBackend`] capability trait: production uses the
//! JSONL bridge in [`bridge`], tests use the in-memory grid in
//! [`harness`]. A session owns exactly one engine and one open
//! document; [`trampoline`] evaluates single formulas against it.

pub mod addr;
pub mod backend;
pub mod bridge;
pub mod error;
pub mod harness;
pub mod props;
pub mod session;
pub mod trampoline;
pub mod value;

pub use addr::CellAddress;
pub use backend::{CellClass, CellState, EngineBackend, EngineConfig, OpenMode, SaveFormat};
pub use error::EngineError;
pub use session::{EngineSession, EngineSpawner};
pub use trampoline::{AccessedCell, AccessedSet};
pub use value::CellValue;
