//! The snapshot model.
//!
//! Immutable once returned. All maps are `BTreeMap` so two extractions
//! of an unchanged document serialize byte-identically.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use cellprobe_engine::CellValue;

/// (value, formula-or-absent) for one cell. A cell with no formula is a
/// constant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellRecord {
    pub value: CellValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,
}

/// Cells of one sheet, keyed by local absolute address ("$A$1").
pub type SheetCells = BTreeMap<String, CellRecord>;

/// A defined name. A name resolving to a range carries the range's
/// absolute address and cell count; a literal RefersTo expression
/// carries no count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefinedName {
    pub refers_to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cell_count: Option<u64>,
}

/// Macro source state. `Protected` is an explicit signal, not an error,
/// so callers can distinguish "no macros" from "macros hidden".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MacroSource {
    Absent,
    Protected,
    /// One named source blob per procedure.
    Modules { procedures: BTreeMap<String, String> },
}

/// The full structural dump of a document at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// The path the snapshot was ultimately extracted from. Differs from
    /// the upload path after a null-byte-name repair round-trip.
    pub path: PathBuf,
    pub names: BTreeMap<String, DefinedName>,
    pub worksheets: BTreeMap<String, SheetCells>,
    pub macrosheets: BTreeMap<String, SheetCells>,
    /// Per-sheet map of commented cell address to comment text.
    pub comments: BTreeMap<String, BTreeMap<String, String>>,
    pub macros: MacroSource,
}
