//! Structural extraction — the full one-shot dump of a document.
//!
//! Produces a `Snapshot`: defined names, every non-empty cell on every
//! worksheet and macro-sheet, comments, and decompiled macro source.
//! Pure consumer of the engine capability interface; no engine details
//! leak in here.

pub mod extract;
pub mod snapshot;

pub use extract::extract;
pub use snapshot::{CellRecord, DefinedName, MacroSource, SheetCells, Snapshot};
