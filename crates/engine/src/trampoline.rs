//! Isolated formula evaluation via the jump-then-halt trampoline.
//!
//! Evaluates one formula as though entered in a specific cell, using
//! only the target cell and the cell below it as scratch space, without
//! a full workbook recalculation. The caller threads an accessed set —
//! its partial view of cell/name state — through successive calls; this
//! module keeps that view faithful to the live engine.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::addr::CellAddress;
use crate::backend::{CellState, EngineBackend};
use crate::error::EngineError;
use crate::session::EngineSession;
use crate::value::CellValue;

/// One cell entry of the caller's accessed set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessedCell {
    pub sheet: String,
    pub col: String,
    pub row: u32,
    /// Last-known formula, absent for constants.
    pub formula: Option<String>,
    /// Last-known value.
    pub value: CellValue,
}

impl AccessedCell {
    fn address(&self) -> CellAddress {
        CellAddress::new(self.sheet.clone(), self.col.clone(), self.row)
    }
}

/// The caller-maintained partial view of workbook state carried between
/// successive evaluation calls. Cells are keyed by their absolute
/// address (`'Sheet'!$A$1`), names by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccessedSet {
    #[serde(default)]
    pub cells: BTreeMap<String, AccessedCell>,
    #[serde(default)]
    pub names: BTreeMap<String, String>,
}

impl AccessedSet {
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty() && self.names.is_empty()
    }
}

/// Evaluate `formula` as if typed into (`sheet`, `col`, `row`).
///
/// Pre-syncs the live session from `prior`, runs the jump+halt
/// trampoline, restores the scratch cells, and returns the result
/// together with the refreshed accessed set. On `EngineError::Execution`
/// the session is in a possibly inconsistent state and must be
/// discarded.
pub fn evaluate(
    session: &mut EngineSession,
    sheet: &str,
    col: &str,
    row: u32,
    formula: &str,
    prior: &AccessedSet,
) -> Result<(CellValue, AccessedSet), EngineError> {
    log::debug!("evaluate '{formula}' at '{sheet}'!{col}{row}");
    let backend = session.backend();

    pre_sync(backend, prior)?;

    for (name, value) in &prior.names {
        backend.define_name(sheet, name, value)?;
    }

    let target = CellAddress::new(sheet, col, row);
    let result = run_trampoline(backend, &target, formula)?;

    let accessed = post_sync(backend, prior)?;
    Ok((result, accessed))
}

/// Step 1: bring every cell the caller has seen back in line with the
/// live engine. The caller's view wins for divergent formulas;
/// divergent values are logged but the live engine stays authoritative.
fn pre_sync(backend: &mut dyn EngineBackend, prior: &AccessedSet) -> Result<(), EngineError> {
    for cell in prior.cells.values() {
        let addr = cell.address();
        let live = backend.read_cell(&addr)?;
        match (&live.formula, &cell.formula) {
            (Some(live_f), Some(recorded)) if live_f == recorded => {
                backend.recalc_cell(&addr)?;
            }
            (Some(live_f), _) => {
                log::error!(
                    "formula mismatch at {addr}: live '{live_f}', recorded {:?}",
                    cell.formula
                );
                match &cell.formula {
                    Some(recorded) => backend.write_formula(&addr, recorded)?,
                    None => backend.write_value(&addr, &cell.value)?,
                }
            }
            (None, _) => {
                backend.write_value(&addr, &cell.value)?;
            }
        }

        let synced = backend.read_cell(&addr)?;
        if synced.value != cell.value {
            log::error!(
                "value mismatch at {addr}: expected {:?}, live {:?}",
                cell.value,
                synced.value
            );
        }
    }
    Ok(())
}

/// Steps 3–5: save scratch cells, write the candidate formula and the
/// halt, jump, read the result, restore. Any failure here leaves the
/// session suspect, so everything maps to `EngineError::Execution`.
fn run_trampoline(
    backend: &mut dyn EngineBackend,
    target: &CellAddress,
    formula: &str,
) -> Result<CellValue, EngineError> {
    let halt = target.next_row().ok_or_else(|| {
        EngineError::Execution(format!("no room for a halt cell below {}", target.absolute()))
    })?;

    let saved_target = backend.read_cell(target).map_err(exec)?;
    let saved_halt = backend.read_cell(&halt).map_err(exec)?;

    backend.write_formula(target, &format!("={formula}")).map_err(exec)?;
    backend.write_formula(&halt, "=HALT()").map_err(exec)?;

    log::debug!("trampoline GOTO {}!{}", target.sheet, target.r1c1());
    let jumped = backend.execute_jump(target).map_err(exec)?;
    if !jumped {
        return Err(EngineError::Execution(format!(
            "jump to {} did not report success",
            target.absolute()
        )));
    }

    let result = backend.read_cell(target).map_err(exec)?.value;

    // Restore the halt cell first: a stray jump continuation must not
    // re-trigger on the still-modified target.
    restore(backend, &halt, &saved_halt).map_err(exec)?;
    restore(backend, target, &saved_target).map_err(exec)?;

    Ok(result)
}

fn restore(
    backend: &mut dyn EngineBackend,
    addr: &CellAddress,
    saved: &CellState,
) -> Result<(), EngineError> {
    match &saved.formula {
        Some(formula) => backend.write_formula(addr, formula),
        None => backend.write_value(addr, &saved.value),
    }
}

fn exec(err: EngineError) -> EngineError {
    EngineError::Execution(err.to_string())
}

/// Step 7: re-read everything the caller has seen and hand back the
/// refreshed view.
fn post_sync(
    backend: &mut dyn EngineBackend,
    prior: &AccessedSet,
) -> Result<AccessedSet, EngineError> {
    let mut accessed = AccessedSet::default();
    for cell in prior.cells.values() {
        let addr = cell.address();
        let live = backend.read_cell(&addr)?;
        accessed.cells.insert(
            addr.absolute(),
            AccessedCell {
                sheet: cell.sheet.clone(),
                col: cell.col.clone(),
                row: cell.row,
                formula: live.formula,
                value: live.value,
            },
        );
    }
    for name in prior.names.keys() {
        accessed.names.insert(name.clone(), backend.read_name(name)?);
    }
    Ok(accessed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::{GridEngine, GridSpawner};
    use std::path::PathBuf;

    fn session_with(engine: GridEngine) -> EngineSession {
        let spawner = GridSpawner::new(engine);
        EngineSession::open(&spawner, &PathBuf::from("/tmp/doc.bin")).unwrap()
    }

    fn accessed_cell(sheet: &str, col: &str, row: u32, formula: Option<&str>, value: CellValue) -> AccessedCell {
        AccessedCell {
            sheet: sheet.into(),
            col: col.into(),
            row,
            formula: formula.map(String::from),
            value,
        }
    }

    #[test]
    fn test_evaluate_and_restore() {
        let mut engine = GridEngine::new();
        engine.set_value("Sheet1", "A", 1, CellValue::Number(5.0));
        let mut session = session_with(engine);

        let (result, accessed) =
            evaluate(&mut session, "Sheet1", "A", 1, "A1+1", &AccessedSet::default()).unwrap();
        // The target holds 5 when the jump evaluates A1+1 against it.
        assert_eq!(result, CellValue::Number(6.0));
        assert!(accessed.is_empty());

        // A1 is restored: value 5, no formula.
        let state = session
            .backend()
            .read_cell(&CellAddress::new("Sheet1", "A", 1))
            .unwrap();
        assert_eq!(state.value, CellValue::Number(5.0));
        assert!(state.formula.is_none());
    }

    #[test]
    fn test_halt_cell_restored() {
        let mut engine = GridEngine::new();
        engine.set_value("Sheet1", "A", 2, CellValue::Text("below".into()));
        let mut session = session_with(engine);

        evaluate(&mut session, "Sheet1", "A", 1, "2+2", &AccessedSet::default()).unwrap();

        let below = session
            .backend()
            .read_cell(&CellAddress::new("Sheet1", "A", 2))
            .unwrap();
        assert_eq!(below.value, CellValue::Text("below".into()));
        assert!(below.formula.is_none());
    }

    #[test]
    fn test_row_ceiling_is_execution_error() {
        let mut session = session_with(GridEngine::new());
        match evaluate(&mut session, "Sheet1", "A", u32::MAX, "1+1", &AccessedSet::default()) {
            Err(EngineError::Execution(_)) => {}
            other => panic!("expected Execution, got {other:?}"),
        }
    }

    #[test]
    fn test_jump_failure_is_execution_error() {
        let mut engine = GridEngine::new();
        engine.fail_jump = true;
        let mut session = session_with(engine);

        match evaluate(&mut session, "Sheet1", "A", 1, "1+1", &AccessedSet::default()) {
            Err(EngineError::Execution(_)) => {}
            other => panic!("expected Execution, got {other:?}"),
        }
    }

    #[test]
    fn test_accessed_round_trip_untouched_entries() {
        let mut engine = GridEngine::new();
        engine.set_value("Sheet1", "C", 9, CellValue::Number(7.0));
        let mut session = session_with(engine);

        let mut prior = AccessedSet::default();
        prior.cells.insert(
            "'Sheet1'!$C$9".into(),
            accessed_cell("Sheet1", "C", 9, None, CellValue::Number(7.0)),
        );

        let (first, out1) = evaluate(&mut session, "Sheet1", "A", 1, "2+3", &prior).unwrap();
        let (second, out2) = evaluate(&mut session, "Sheet1", "A", 1, "2+3", &out1).unwrap();
        assert_eq!(first, second);
        assert_eq!(out1.cells, prior.cells);
        assert_eq!(out2.cells, prior.cells);
    }

    #[test]
    fn test_divergent_formula_overwritten_with_callers() {
        let mut engine = GridEngine::new();
        // Live session has drifted: B2 now holds a different formula.
        engine.set_formula("Sheet1", "B", 2, "=A1+100");
        let mut session = session_with(engine);

        let mut prior = AccessedSet::default();
        prior.cells.insert(
            "'Sheet1'!$B$2".into(),
            accessed_cell("Sheet1", "B", 2, Some("=A1+1"), CellValue::Number(1.0)),
        );

        let (_, accessed) = evaluate(&mut session, "Sheet1", "D", 4, "2+2", &prior).unwrap();
        let entry = &accessed.cells["'Sheet1'!$B$2"];
        assert_eq!(entry.formula.as_deref(), Some("=A1+1"));
    }

    #[test]
    fn test_constant_entry_written_back() {
        let engine = GridEngine::new();
        let mut session = session_with(engine);

        // Caller claims E5 holds 42; the live cell is empty.
        let mut prior = AccessedSet::default();
        prior.cells.insert(
            "'Sheet1'!$E$5".into(),
            accessed_cell("Sheet1", "E", 5, None, CellValue::Number(42.0)),
        );

        let (result, accessed) = evaluate(&mut session, "Sheet1", "A", 1, "E5+1", &prior).unwrap();
        assert_eq!(result, CellValue::Number(43.0));
        assert_eq!(accessed.cells["'Sheet1'!$E$5"].value, CellValue::Number(42.0));
    }

    #[test]
    fn test_names_recreated_and_reread() {
        let engine = GridEngine::new();
        let mut session = session_with(engine);

        let mut prior = AccessedSet::default();
        prior.names.insert("auto_open".into(), "='Macro1'!$A$1".into());

        let (_, accessed) = evaluate(&mut session, "Sheet1", "A", 1, "1+1", &prior).unwrap();
        assert_eq!(accessed.names["auto_open"], "='Macro1'!$A$1");
    }
}
