//! The extractor.
//!
//! One pass over an open session: defined names (with null-byte
//! corruption detection and a single repair round-trip), cells per
//! worksheet and macro-sheet (sparse walk, or a conservative one-by-one
//! fallback for protected ranges), comments, and macro source walked
//! procedure by procedure.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use cellprobe_engine::backend::{CellClass, EngineBackend, SaveFormat, SheetKind, VbaModule, VbaProject};
use cellprobe_engine::{EngineError, EngineSession};

use crate::snapshot::{CellRecord, DefinedName, MacroSource, SheetCells, Snapshot};

/// Produce the full snapshot from an open session.
///
/// Either returns a complete, well-formed snapshot or a named failure —
/// never a silently truncated one.
pub fn extract(session: &mut EngineSession) -> Result<Snapshot, EngineError> {
    log::debug!("extracting {}", session.path().display());

    let mut names = load_defined_names(session.backend())?;

    let sheets = session.backend().sheets()?;
    let mut worksheets = BTreeMap::new();
    let mut macrosheets = BTreeMap::new();
    let mut comments = BTreeMap::new();
    for sheet in &sheets {
        let cells = load_cells(session.backend(), &sheet.name)?;
        match sheet.kind {
            SheetKind::Worksheet => worksheets.insert(sheet.name.clone(), cells),
            SheetKind::MacroSheet => macrosheets.insert(sheet.name.clone(), cells),
        };
        comments.insert(sheet.name.clone(), load_comments(session.backend(), &sheet.name)?);
    }

    let macros = load_macros(session.backend())?;

    // Null-byte-name recovery: save the document under a binary
    // container to a sibling path, reopen that copy, retry once.
    if names.is_none() {
        let sibling = repair_path(session.path());
        log::warn!(
            "defined names carry embedded NULs, rewriting {} as {}",
            session.path().display(),
            sibling.display()
        );
        session
            .backend()
            .save_as(&sibling, SaveFormat::BinaryWorkbook)
            .map_err(|e| {
                EngineError::NameCorruption(format!(
                    "cannot save binary repair copy {}: {e}",
                    sibling.display()
                ))
            })?;
        session.reopen(&sibling)?;
        names = load_defined_names(session.backend())?;
        if names.is_none() {
            return Err(EngineError::NameCorruption(format!(
                "name corruption persists after repair round-trip: {}",
                sibling.display()
            )));
        }
    }

    Ok(Snapshot {
        path: session.path().to_path_buf(),
        names: names.unwrap_or_default(),
        worksheets,
        macrosheets,
        comments,
        macros,
    })
}

fn repair_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".repair");
    PathBuf::from(os)
}

/// Load the defined-name table. `None` signals the known embedded-NUL
/// corruption: a resolved name's text ending in a NUL followed by a
/// quote poisons the whole table for this pass.
fn load_defined_names(
    backend: &mut dyn EngineBackend,
) -> Result<Option<BTreeMap<String, DefinedName>>, EngineError> {
    let mut names = BTreeMap::new();
    for name in backend.defined_names()? {
        let entry = match &name.range {
            Some(range) => DefinedName {
                refers_to: format!("'{}'!{}", range.sheet, range.address),
                cell_count: Some(range.cell_count),
            },
            None => DefinedName { refers_to: name.refers_to.clone(), cell_count: None },
        };
        names.insert(name.name, entry);
    }
    if names.values().any(|n| n.refers_to.ends_with("\u{0}'")) {
        return Ok(None);
    }
    Ok(Some(names))
}

/// Load one sheet's non-empty cells.
fn load_cells(backend: &mut dyn EngineBackend, sheet: &str) -> Result<SheetCells, EngineError> {
    let mut cells = SheetCells::new();

    if backend.probe_locked(sheet)? {
        // Conservative fallback: walk the used range one cell at a time,
        // tolerating individual read failures as empty.
        for addr in backend.used_range_cells(sheet)? {
            match backend.read_cell(&addr) {
                Ok(state) => {
                    cells.insert(
                        addr.local_absolute(),
                        CellRecord { value: state.value, formula: state.formula },
                    );
                }
                Err(e) => log::debug!("skipping unreadable cell {addr}: {e}"),
            }
        }
        return Ok(cells);
    }

    for (addr, state) in backend.special_cells(sheet, CellClass::Formulas)? {
        cells.insert(
            addr.local_absolute(),
            CellRecord { value: state.value, formula: state.formula_r1c1.or(state.formula) },
        );
    }
    for (addr, state) in backend.special_cells(sheet, CellClass::Constants)? {
        cells.insert(addr.local_absolute(), CellRecord { value: state.value, formula: None });
    }
    Ok(cells)
}

fn load_comments(
    backend: &mut dyn EngineBackend,
    sheet: &str,
) -> Result<BTreeMap<String, String>, EngineError> {
    Ok(backend
        .comments(sheet)?
        .into_iter()
        .map(|(addr, text)| (addr.local_absolute(), text))
        .collect())
}

fn load_macros(backend: &mut dyn EngineBackend) -> Result<MacroSource, EngineError> {
    match backend.vba_project()? {
        VbaProject::Absent => Ok(MacroSource::Absent),
        VbaProject::Protected => Ok(MacroSource::Protected),
        VbaProject::Modules { modules } => {
            let mut procedures = BTreeMap::new();
            for module in &modules {
                walk_module(module, &mut procedures);
            }
            Ok(MacroSource::Modules { procedures })
        }
    }
}

/// Walk one module's procedure boundaries sequentially: skip the
/// declarations header, then follow the module's own procedure index.
fn walk_module(module: &VbaModule, out: &mut BTreeMap<String, String>) {
    let total = module.lines.len();
    if total == 0 {
        return;
    }
    let mut index = module.declaration_lines + 1;
    while index <= total {
        let Some(proc) = module
            .procedures
            .iter()
            .find(|p| index >= p.start_line && index < p.start_line + p.line_count)
        else {
            break;
        };
        // Slice from the procedure's own boundaries: the cursor may sit
        // past the first line when procedures are back to back.
        let start = proc.start_line - 1;
        let end = (start + proc.line_count).min(total);
        out.insert(proc.name.clone(), module.lines[start..end].join("\n"));
        index = proc.start_line + proc.line_count + 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellprobe_engine::backend::{ResolvedRange, SheetKind, VbaProcedure};
    use cellprobe_engine::harness::{GridEngine, GridSpawner};
    use cellprobe_engine::{CellAddress, CellValue};

    fn open(engine: GridEngine) -> EngineSession {
        let spawner = GridSpawner::new(engine);
        EngineSession::open(&spawner, &PathBuf::from("/tmp/doc.bin")).unwrap()
    }

    fn sample_engine() -> GridEngine {
        let mut engine = GridEngine::new();
        engine.set_value("Sheet1", "A", 1, CellValue::Number(5.0));
        engine.set_formula("Sheet1", "B", 2, "=A1+1");
        engine.add_sheet("Macro1", SheetKind::MacroSheet);
        engine.set_value("Macro1", "A", 1, CellValue::Text("=ALERT(\"hi\")".into()));
        engine.set_name(
            "auto_open",
            "='Macro1'!$A$1",
            Some(ResolvedRange { sheet: "Macro1".into(), address: "$A$1".into(), cell_count: 1 }),
        );
        engine.set_name("payload", "=\"xyz\"", None);
        engine
            .sheet_mut("Sheet1")
            .comments
            .push((CellAddress::new("Sheet1", "B", 2), "suspicious".into()));
        engine
    }

    #[test]
    fn test_full_extraction() {
        let mut session = open(sample_engine());
        let snapshot = extract(&mut session).unwrap();

        assert_eq!(snapshot.path, PathBuf::from("/tmp/doc.bin"));
        assert_eq!(snapshot.names["auto_open"].refers_to, "'Macro1'!$A$1");
        assert_eq!(snapshot.names["auto_open"].cell_count, Some(1));
        assert_eq!(snapshot.names["payload"].refers_to, "=\"xyz\"");
        assert_eq!(snapshot.names["payload"].cell_count, None);

        let sheet1 = &snapshot.worksheets["Sheet1"];
        assert_eq!(sheet1["$A$1"], CellRecord { value: CellValue::Number(5.0), formula: None });
        assert_eq!(sheet1["$B$2"].formula.as_deref(), Some("=A1+1"));

        assert!(snapshot.macrosheets.contains_key("Macro1"));
        assert_eq!(snapshot.comments["Sheet1"]["$B$2"], "suspicious");
        assert_eq!(snapshot.macros, MacroSource::Absent);
    }

    #[test]
    fn test_extraction_is_deterministic() {
        let spawner = GridSpawner::new(sample_engine());
        let path = PathBuf::from("/tmp/doc.bin");
        let mut first = EngineSession::open(&spawner, &path).unwrap();
        let mut second = EngineSession::open(&spawner, &path).unwrap();
        let a = serde_json::to_vec(&extract(&mut first).unwrap()).unwrap();
        let b = serde_json::to_vec(&extract(&mut second).unwrap()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_protected_fallback_keeps_readable_cells() {
        let mut engine = GridEngine::new();
        engine.set_value("Sheet1", "A", 1, CellValue::Number(1.0));
        engine.set_value("Sheet1", "B", 1, CellValue::Number(2.0));
        engine.sheet_mut("Sheet1").protected = true;
        engine.sheet_mut("Sheet1").poisoned.insert((1, "B".into()));
        let mut session = open(engine);

        let snapshot = extract(&mut session).unwrap();
        let sheet1 = &snapshot.worksheets["Sheet1"];
        assert_eq!(sheet1.len(), 1);
        assert_eq!(sheet1["$A$1"].value, CellValue::Number(1.0));
    }

    #[test]
    fn test_name_corruption_recovers_once() {
        let mut engine = sample_engine();
        // Literal RefersTo ending in NUL-plus-quote: the known corruption.
        engine.set_name("evil", "='Mod\u{0}'", None);
        engine.clear_nul_names_on_save = true;
        let mut session = open(engine);

        let snapshot = extract(&mut session).unwrap();
        assert_eq!(snapshot.path, PathBuf::from("/tmp/doc.bin.repair"));
        assert_eq!(snapshot.names["evil"].refers_to, "='Mod'");
    }

    #[test]
    fn test_name_corruption_unrecoverable() {
        let mut engine = sample_engine();
        engine.set_name("evil", "='Mod\u{0}'", None);
        let mut session = open(engine);

        match extract(&mut session) {
            Err(EngineError::NameCorruption(_)) => {}
            other => panic!("expected NameCorruption, got {other:?}"),
        }
    }

    #[test]
    fn test_protected_vba_is_a_signal() {
        let mut engine = GridEngine::new();
        engine.vba = VbaProject::Protected;
        let mut session = open(engine);
        assert_eq!(extract(&mut session).unwrap().macros, MacroSource::Protected);
    }

    #[test]
    fn test_vba_procedure_walk() {
        let module = VbaModule {
            name: "Module1".into(),
            declaration_lines: 2,
            lines: vec![
                "Attribute VB_Name = \"Module1\"".into(),
                "Option Explicit".into(),
                "Sub AutoOpen()".into(),
                "    Shell cmd".into(),
                "End Sub".into(),
                "Function Decode(s)".into(),
                "    Decode = s".into(),
                "End Function".into(),
            ],
            procedures: vec![
                VbaProcedure { name: "AutoOpen".into(), start_line: 3, line_count: 3 },
                VbaProcedure { name: "Decode".into(), start_line: 6, line_count: 3 },
            ],
        };
        let mut out = BTreeMap::new();
        walk_module(&module, &mut out);
        assert_eq!(out.len(), 2);
        assert_eq!(out["AutoOpen"], "Sub AutoOpen()\n    Shell cmd\nEnd Sub");
        // Back-to-back procedures: the second blob must still open on its
        // own first line.
        assert_eq!(out["Decode"], "Function Decode(s)\n    Decode = s\nEnd Function");
    }

    #[test]
    fn test_vba_empty_module_skipped() {
        let module = VbaModule {
            name: "Empty".into(),
            declaration_lines: 0,
            lines: vec![],
            procedures: vec![],
        };
        let mut out = BTreeMap::new();
        walk_module(&module, &mut out);
        assert!(out.is_empty());
    }
}
