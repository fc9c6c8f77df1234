//! The engine capability interface.
//!
//! The external spreadsheet engine is an opaque, untrusted, stateful
//! system reached only through an automation surface. Everything above
//! this trait — session lifecycle, extraction, the trampoline — depends
//! on these capabilities and nothing else, so the engine could be
//! swapped for any backend implementing the same set.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::addr::CellAddress;
use crate::error::EngineError;
use crate::value::CellValue;

/// Session-wide engine configuration applied before any document work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Manual recalculation mode. Refusal to enter it is fatal for the
    /// document (signals a macro-related incompatibility).
    pub manual_calculation: bool,
    /// Suppress all interactive UI, alerts and status surfaces.
    pub suppress_ui: bool,
    /// Disable event handlers.
    pub disable_events: bool,
    /// Force macro security off so macro-sheets load without prompts.
    pub macro_security_off: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            manual_calculation: true,
            suppress_ui: true,
            disable_events: true,
            macro_security_off: true,
        }
    }
}

/// How to open the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenMode {
    /// Plain open, empty password.
    Normal,
    /// Repair-mode open, used as the fallback for corrupted files.
    Repair,
}

/// Container formats the engine can save into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveFormat {
    /// Binary workbook container. The null-byte-name recovery saves into
    /// this format to shake embedded NULs out of the name table.
    BinaryWorkbook,
}

/// Sheet classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SheetKind {
    Worksheet,
    /// Legacy sheet whose cells hold sequential macro-style commands.
    MacroSheet,
}

/// One sheet as reported by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SheetInfo {
    pub name: String,
    pub kind: SheetKind,
}

/// Sparse cell classes within a used range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellClass {
    Formulas,
    Constants,
}

/// A cell's live state as read from the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CellState {
    pub value: CellValue,
    /// A1-style formula, absent for constants.
    pub formula: Option<String>,
    /// Position-independent (R1C1) formula text, absent for constants.
    pub formula_r1c1: Option<String>,
}

/// A defined name as reported by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineName {
    pub name: String,
    /// Literal RefersTo expression.
    pub refers_to: String,
    /// Present when the name resolves to a concrete range.
    pub range: Option<ResolvedRange>,
}

/// The range a defined name resolves to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedRange {
    pub sheet: String,
    /// Absolute local address, e.g. "$A$1:$B$2".
    pub address: String,
    pub cell_count: u64,
}

/// Macro project state. `Protected` is distinct from `Absent` so callers
/// can tell "no macros" from "macros hidden".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum VbaProject {
    Absent,
    Protected,
    Modules { modules: Vec<VbaModule> },
}

/// One macro module with its procedure index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VbaModule {
    pub name: String,
    /// Count of declaration-header lines before the first procedure.
    pub declaration_lines: usize,
    /// Full module source, one entry per line (1-based addressing).
    pub lines: Vec<String>,
    pub procedures: Vec<VbaProcedure>,
}

/// One entry of a module's procedure index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VbaProcedure {
    pub name: String,
    /// 1-based start line within the module.
    pub start_line: usize,
    pub line_count: usize,
}

/// Legacy horizontal alignment, as the engine reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HorizontalAlign {
    General,
    Left,
    Center,
    Right,
    Fill,
    Justify,
    CenterAcrossSelection,
    Distributed,
}

/// Legacy vertical alignment, as the engine reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerticalAlign {
    Top,
    Center,
    Bottom,
    Justify,
    Distributed,
}

/// Style attributes backing the indexed cell-property lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellStyle {
    pub display_format: String,
    pub horizontal_alignment: HorizontalAlign,
    pub vertical_alignment: VerticalAlign,
    pub row_height: f64,
    pub font_size: f64,
    pub bold: bool,
    pub italic: bool,
    pub strikethrough: bool,
    pub font_color_index: i64,
    pub fill_color_index: i64,
}

impl Default for CellStyle {
    fn default() -> Self {
        Self {
            display_format: "General".to_string(),
            horizontal_alignment: HorizontalAlign::General,
            vertical_alignment: VerticalAlign::Bottom,
            row_height: 15.0,
            font_size: 11.0,
            bold: false,
            italic: false,
            strikethrough: false,
            // Engine "automatic" color sentinel.
            font_color_index: -4105,
            fill_color_index: -4105,
        }
    }
}

/// Workbook-level built-in document properties the lookup supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuiltinProperty {
    Keywords,
}

/// Capability interface to one live engine instance.
///
/// One backend owns one engine process and at most one open document.
/// All calls are blocking and potentially slow; an external watchdog
/// bounds total engine lifetime.
pub trait EngineBackend {
    /// Apply session configuration. Must be called before any document
    /// is opened. Fails with `EngineError::Init` if manual recalculation
    /// cannot be set.
    fn configure(&mut self, config: &EngineConfig) -> Result<(), EngineError>;

    fn open_document(&mut self, path: &Path, mode: OpenMode) -> Result<(), EngineError>;

    fn sheets(&mut self) -> Result<Vec<SheetInfo>, EngineError>;

    fn read_cell(&mut self, addr: &CellAddress) -> Result<CellState, EngineError>;

    fn write_formula(&mut self, addr: &CellAddress, formula: &str) -> Result<(), EngineError>;

    fn write_value(&mut self, addr: &CellAddress, value: &CellValue) -> Result<(), EngineError>;

    /// Localized recalculation of one cell.
    fn recalc_cell(&mut self, addr: &CellAddress) -> Result<(), EngineError>;

    /// Reversible toggle of the used range's lock attribute. `true`
    /// means the toggle failed, i.e. the range is protected.
    fn probe_locked(&mut self, sheet: &str) -> Result<bool, EngineError>;

    /// Sparse enumeration of one class of cells in the sheet's used range.
    fn special_cells(
        &mut self,
        sheet: &str,
        class: CellClass,
    ) -> Result<Vec<(CellAddress, CellState)>, EngineError>;

    /// Every cell address in the sheet's used range, for the conservative
    /// one-by-one fallback on protected ranges.
    fn used_range_cells(&mut self, sheet: &str) -> Result<Vec<CellAddress>, EngineError>;

    fn defined_names(&mut self) -> Result<Vec<EngineName>, EngineError>;

    /// (Re)create a defined name on a sheet bound to a RefersTo value.
    fn define_name(&mut self, sheet: &str, name: &str, refers_to: &str)
        -> Result<(), EngineError>;

    /// Current resolved value of a defined name.
    fn read_name(&mut self, name: &str) -> Result<String, EngineError>;

    fn comments(&mut self, sheet: &str) -> Result<Vec<(CellAddress, String)>, EngineError>;

    fn vba_project(&mut self) -> Result<VbaProject, EngineError>;

    fn cell_style(&mut self, addr: &CellAddress) -> Result<CellStyle, EngineError>;

    fn document_property(&mut self, prop: BuiltinProperty) -> Result<String, EngineError>;

    /// Macro-style unconditional GOTO to the cell's R1C1 address,
    /// executed synchronously. Returns the engine-reported success flag.
    fn execute_jump(&mut self, addr: &CellAddress) -> Result<bool, EngineError>;

    fn save_as(&mut self, path: &Path, format: SaveFormat) -> Result<(), EngineError>;

    fn close_document(&mut self) -> Result<(), EngineError>;

    /// Terminate the engine process. Best-effort and idempotent; errors
    /// are swallowed by callers.
    fn terminate(&mut self);

    /// Bridge process id, if this backend runs one (for the janitor).
    fn pid(&self) -> Option<u32> {
        None
    }
}
