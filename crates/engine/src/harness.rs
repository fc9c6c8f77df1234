//! In-memory engine backend for tests.
//!
//! `GridEngine` is a deterministic stand-in for the real automation
//! bridge: a few sheets of cells, a defined-name table, an optional
//! macro project, and a toy formula evaluator that understands numeric
//! literals, A1 cell references and `+` chains — enough to exercise the
//! trampoline, the extractor and the service layer without a live
//! engine process.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::addr::CellAddress;
use crate::backend::{
    BuiltinProperty, CellClass, CellState, CellStyle, EngineBackend, EngineConfig, EngineName,
    OpenMode, ResolvedRange, SaveFormat, SheetInfo, SheetKind, VbaProject,
};
use crate::error::EngineError;
use crate::session::EngineSpawner;
use crate::value::CellValue;

/// (row, column-letters) cell key. Row first for stable ordering.
pub type CellKey = (u32, String);

#[derive(Debug, Clone, Default)]
pub struct HarnessCell {
    pub value: CellValue,
    pub formula: Option<String>,
    pub formula_r1c1: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HarnessSheet {
    pub name: String,
    pub kind: SheetKind,
    pub protected: bool,
    pub cells: BTreeMap<CellKey, HarnessCell>,
    pub comments: Vec<(CellAddress, String)>,
    /// Cells whose individual reads fail (protected-range fallback tests).
    pub poisoned: BTreeSet<CellKey>,
    pub styles: BTreeMap<CellKey, CellStyle>,
}

impl HarnessSheet {
    pub fn new(name: impl Into<String>, kind: SheetKind) -> Self {
        Self {
            name: name.into(),
            kind,
            protected: false,
            cells: BTreeMap::new(),
            comments: Vec::new(),
            poisoned: BTreeSet::new(),
            styles: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HarnessName {
    pub refers_to: String,
    pub range: Option<ResolvedRange>,
    /// Current resolved value, as `read_name` reports it.
    pub value: String,
}

/// Deterministic in-memory engine.
#[derive(Clone)]
pub struct GridEngine {
    pub fail_manual_calculation: bool,
    pub fail_normal_open: bool,
    pub fail_repair_open: bool,
    pub fail_jump: bool,
    pub fail_save_as: bool,
    /// Simulate the binary-container rewrite shaking NULs out of the
    /// name table: scrub names when `save_as` runs.
    pub clear_nul_names_on_save: bool,
    pub sheets: Vec<HarnessSheet>,
    pub names: BTreeMap<String, HarnessName>,
    pub vba: VbaProject,
    pub keywords: String,
    open_path: Option<PathBuf>,
    pub saved_as: Vec<(PathBuf, SaveFormat)>,
    pub jump_log: Vec<String>,
    terminated: Arc<AtomicBool>,
}

impl GridEngine {
    pub fn new() -> Self {
        Self {
            fail_manual_calculation: false,
            fail_normal_open: false,
            fail_repair_open: false,
            fail_jump: false,
            fail_save_as: false,
            clear_nul_names_on_save: false,
            sheets: vec![HarnessSheet::new("Sheet1", SheetKind::Worksheet)],
            names: BTreeMap::new(),
            vba: VbaProject::Absent,
            keywords: String::new(),
            open_path: None,
            saved_as: Vec::new(),
            jump_log: Vec::new(),
            terminated: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn add_sheet(&mut self, name: &str, kind: SheetKind) -> &mut HarnessSheet {
        self.sheets.push(HarnessSheet::new(name, kind));
        self.sheets.last_mut().unwrap()
    }

    pub fn sheet_mut(&mut self, name: &str) -> &mut HarnessSheet {
        self.sheets
            .iter_mut()
            .find(|s| s.name == name)
            .unwrap_or_else(|| panic!("no harness sheet named {name}"))
    }

    fn sheet(&self, name: &str) -> Result<&HarnessSheet, EngineError> {
        self.sheets
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| EngineError::Processing(format!("no sheet named {name}")))
    }

    pub fn set_value(&mut self, sheet: &str, col: &str, row: u32, value: CellValue) {
        let cell = self.cell_mut(sheet, col, row);
        cell.value = value;
        cell.formula = None;
        cell.formula_r1c1 = None;
    }

    pub fn set_formula(&mut self, sheet: &str, col: &str, row: u32, formula: &str) {
        let cell = self.cell_mut(sheet, col, row);
        cell.formula = Some(formula.to_string());
        cell.formula_r1c1 = Some(formula.to_string());
    }

    pub fn set_name(&mut self, name: &str, refers_to: &str, range: Option<ResolvedRange>) {
        self.names.insert(
            name.to_string(),
            HarnessName { refers_to: refers_to.to_string(), range, value: refers_to.to_string() },
        );
    }

    fn cell_mut(&mut self, sheet: &str, col: &str, row: u32) -> &mut HarnessCell {
        self.sheet_mut(sheet).cells.entry((row, col.to_string())).or_default()
    }

    /// Evaluate a toy formula: `HALT()`, quoted strings, numeric
    /// literals, A1 refs and `+` chains over them.
    fn eval(&self, sheet: &str, expr: &str) -> CellValue {
        let expr = expr.trim().trim_start_matches('=').trim();
        if expr.eq_ignore_ascii_case("HALT()") {
            return CellValue::Bool(true);
        }
        if expr.len() >= 2 && expr.starts_with('"') && expr.ends_with('"') {
            return CellValue::Text(expr[1..expr.len() - 1].to_string());
        }
        let mut sum = 0.0;
        for term in expr.split('+') {
            let term = term.trim();
            if let Ok(n) = term.parse::<f64>() {
                sum += n;
                continue;
            }
            match self.resolve_ref(sheet, term) {
                Some(CellValue::Number(n)) => sum += n,
                Some(CellValue::Empty) | None if is_ref(term) => {}
                _ => return CellValue::Text(expr.to_string()),
            }
        }
        CellValue::Number(sum)
    }

    fn resolve_ref(&self, sheet: &str, term: &str) -> Option<CellValue> {
        let split = term.find(|c: char| c.is_ascii_digit())?;
        let (col, row) = term.split_at(split);
        let row: u32 = row.parse().ok()?;
        if col.is_empty() || !col.chars().all(|c| c.is_ascii_alphabetic()) {
            return None;
        }
        let sheet = self.sheet(sheet).ok()?;
        Some(
            sheet
                .cells
                .get(&(row, col.to_uppercase()))
                .map(|c| c.value.clone())
                .unwrap_or_default(),
        )
    }
}

fn is_ref(term: &str) -> bool {
    let letters = term.chars().take_while(|c| c.is_ascii_alphabetic()).count();
    letters > 0 && term[letters..].chars().all(|c| c.is_ascii_digit()) && term.len() > letters
}

impl Default for GridEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBackend for GridEngine {
    fn configure(&mut self, config: &EngineConfig) -> Result<(), EngineError> {
        if config.manual_calculation && self.fail_manual_calculation {
            return Err(EngineError::Init("manual calculation refused".into()));
        }
        Ok(())
    }

    fn open_document(&mut self, path: &Path, mode: OpenMode) -> Result<(), EngineError> {
        let fail = match mode {
            OpenMode::Normal => self.fail_normal_open,
            OpenMode::Repair => self.fail_repair_open,
        };
        if fail {
            return Err(EngineError::Processing(format!("open failed: {}", path.display())));
        }
        self.open_path = Some(path.to_path_buf());
        Ok(())
    }

    fn sheets(&mut self) -> Result<Vec<SheetInfo>, EngineError> {
        Ok(self
            .sheets
            .iter()
            .map(|s| SheetInfo { name: s.name.clone(), kind: s.kind })
            .collect())
    }

    fn read_cell(&mut self, addr: &CellAddress) -> Result<CellState, EngineError> {
        let sheet = self.sheet(&addr.sheet)?;
        let key = (addr.row, addr.col.clone());
        if sheet.poisoned.contains(&key) {
            return Err(EngineError::Processing(format!("read failed at {addr}")));
        }
        Ok(sheet
            .cells
            .get(&key)
            .map(|c| CellState {
                value: c.value.clone(),
                formula: c.formula.clone(),
                formula_r1c1: c.formula_r1c1.clone(),
            })
            .unwrap_or_default())
    }

    fn write_formula(&mut self, addr: &CellAddress, formula: &str) -> Result<(), EngineError> {
        let sheet = addr.sheet.clone();
        let cell = self.cell_mut(&sheet, &addr.col, addr.row);
        cell.formula = Some(formula.to_string());
        cell.formula_r1c1 = Some(formula.to_string());
        Ok(())
    }

    fn write_value(&mut self, addr: &CellAddress, value: &CellValue) -> Result<(), EngineError> {
        let sheet = addr.sheet.clone();
        self.set_value(&sheet, &addr.col, addr.row, value.clone());
        Ok(())
    }

    fn recalc_cell(&mut self, addr: &CellAddress) -> Result<(), EngineError> {
        let state = self.read_cell(addr)?;
        if let Some(formula) = state.formula {
            let value = self.eval(&addr.sheet, &formula);
            let sheet = addr.sheet.clone();
            self.cell_mut(&sheet, &addr.col, addr.row).value = value;
        }
        Ok(())
    }

    fn probe_locked(&mut self, sheet: &str) -> Result<bool, EngineError> {
        Ok(self.sheet(sheet)?.protected)
    }

    fn special_cells(
        &mut self,
        sheet: &str,
        class: CellClass,
    ) -> Result<Vec<(CellAddress, CellState)>, EngineError> {
        let name = self.sheet(sheet)?.name.clone();
        let mut out = Vec::new();
        for ((row, col), cell) in &self.sheet(sheet)?.cells {
            let keep = match class {
                CellClass::Formulas => cell.formula.is_some(),
                CellClass::Constants => cell.formula.is_none() && !cell.value.is_empty(),
            };
            if keep {
                out.push((
                    CellAddress::new(name.clone(), col.clone(), *row),
                    CellState {
                        value: cell.value.clone(),
                        formula: cell.formula.clone(),
                        formula_r1c1: cell.formula_r1c1.clone(),
                    },
                ));
            }
        }
        Ok(out)
    }

    fn used_range_cells(&mut self, sheet: &str) -> Result<Vec<CellAddress>, EngineError> {
        let s = self.sheet(sheet)?;
        let name = s.name.clone();
        Ok(s.cells
            .keys()
            .map(|(row, col)| CellAddress::new(name.clone(), col.clone(), *row))
            .collect())
    }

    fn defined_names(&mut self) -> Result<Vec<EngineName>, EngineError> {
        Ok(self
            .names
            .iter()
            .map(|(name, n)| EngineName {
                name: name.clone(),
                refers_to: n.refers_to.clone(),
                range: n.range.clone(),
            })
            .collect())
    }

    fn define_name(
        &mut self,
        _sheet: &str,
        name: &str,
        refers_to: &str,
    ) -> Result<(), EngineError> {
        self.names.insert(
            name.to_string(),
            HarnessName { refers_to: refers_to.to_string(), range: None, value: refers_to.to_string() },
        );
        Ok(())
    }

    fn read_name(&mut self, name: &str) -> Result<String, EngineError> {
        self.names
            .get(name)
            .map(|n| n.value.clone())
            .ok_or_else(|| EngineError::Processing(format!("no defined name {name}")))
    }

    fn comments(&mut self, sheet: &str) -> Result<Vec<(CellAddress, String)>, EngineError> {
        Ok(self.sheet(sheet)?.comments.clone())
    }

    fn vba_project(&mut self) -> Result<VbaProject, EngineError> {
        Ok(self.vba.clone())
    }

    fn cell_style(&mut self, addr: &CellAddress) -> Result<CellStyle, EngineError> {
        let sheet = self.sheet(&addr.sheet)?;
        Ok(sheet.styles.get(&(addr.row, addr.col.clone())).cloned().unwrap_or_default())
    }

    fn document_property(&mut self, prop: BuiltinProperty) -> Result<String, EngineError> {
        match prop {
            BuiltinProperty::Keywords => Ok(self.keywords.clone()),
        }
    }

    fn execute_jump(&mut self, addr: &CellAddress) -> Result<bool, EngineError> {
        self.jump_log.push(format!("{}!{}", addr.sheet, addr.r1c1()));
        if self.fail_jump {
            return Ok(false);
        }
        let state = self.read_cell(addr)?;
        if let Some(formula) = state.formula {
            let value = self.eval(&addr.sheet, &formula);
            let sheet = addr.sheet.clone();
            self.cell_mut(&sheet, &addr.col, addr.row).value = value;
        }
        Ok(true)
    }

    fn save_as(&mut self, path: &Path, format: SaveFormat) -> Result<(), EngineError> {
        if self.fail_save_as {
            return Err(EngineError::Processing(format!("save failed: {}", path.display())));
        }
        self.saved_as.push((path.to_path_buf(), format));
        if self.clear_nul_names_on_save {
            for entry in self.names.values_mut() {
                if let Some(range) = &mut entry.range {
                    range.address = range.address.replace('\u{0}', "");
                }
                entry.refers_to = entry.refers_to.replace('\u{0}', "");
                entry.value = entry.value.replace('\u{0}', "");
            }
        }
        Ok(())
    }

    fn close_document(&mut self) -> Result<(), EngineError> {
        self.open_path = None;
        Ok(())
    }

    fn terminate(&mut self) {
        self.terminated.store(true, Ordering::SeqCst);
    }
}

/// Spawner that hands out clones of a template engine.
pub struct GridSpawner {
    template: GridEngine,
    last_terminated: Mutex<Option<Arc<AtomicBool>>>,
}

impl GridSpawner {
    pub fn new(template: GridEngine) -> Self {
        Self { template, last_terminated: Mutex::new(None) }
    }

    /// Termination flag of the most recently spawned engine.
    pub fn last_terminated(&self) -> Arc<AtomicBool> {
        self.last_terminated.lock().unwrap().clone().expect("no engine spawned yet")
    }
}

impl EngineSpawner for GridSpawner {
    fn spawn(&self) -> Result<Box<dyn EngineBackend>, EngineError> {
        let mut engine = self.template.clone();
        let flag = Arc::new(AtomicBool::new(false));
        engine.terminated = flag.clone();
        *self.last_terminated.lock().unwrap() = Some(flag);
        Ok(Box::new(engine))
    }
}
