//! Child-process automation bridge.
//!
//! The real spreadsheet engine is only reachable through a platform
//! automation surface. `BridgeEngine` spawns the configured bridge
//! executable and speaks newline-delimited JSON over its stdio: one
//! request line, one reply line, strictly in order. Every capability
//! call is one blocking round-trip.
//!
//! Reply frames are `{"ok": bool, "error": ..., "value": ...}`. A
//! reply with `ok=false` surfaces the engine's own error text verbatim.

use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::addr::CellAddress;
use crate::backend::{
    BuiltinProperty, CellClass, CellState, CellStyle, EngineBackend, EngineConfig, EngineName,
    OpenMode, SaveFormat, SheetInfo, VbaProject,
};
use crate::error::EngineError;
use crate::session::EngineSpawner;
use crate::value::CellValue;

/// How to start the bridge process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// One request frame on the bridge wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BridgeRequest {
    Configure { config: EngineConfig },
    OpenDocument { path: String, mode: OpenMode },
    Sheets,
    ReadCell { sheet: String, col: String, row: u32 },
    WriteFormula { sheet: String, col: String, row: u32, formula: String },
    WriteValue { sheet: String, col: String, row: u32, value: CellValue },
    RecalcCell { sheet: String, col: String, row: u32 },
    ProbeLocked { sheet: String },
    SpecialCells { sheet: String, class: CellClass },
    UsedRangeCells { sheet: String },
    DefinedNames,
    DefineName { sheet: String, name: String, refers_to: String },
    ReadName { name: String },
    Comments { sheet: String },
    VbaProject,
    CellStyle { sheet: String, col: String, row: u32 },
    DocumentProperty { property: BuiltinProperty },
    ExecuteJump { sheet: String, address_r1c1: String },
    SaveAs { path: String, format: SaveFormat },
    CloseDocument,
    Terminate,
}

/// One reply frame on the bridge wire.
#[derive(Debug, Deserialize)]
struct BridgeReply {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    value: serde_json::Value,
}

/// Engine backend talking to a spawned bridge process.
pub struct BridgeEngine {
    child: Child,
    writer: ChildStdin,
    reader: BufReader<ChildStdout>,
}

impl BridgeEngine {
    pub fn spawn(config: &BridgeConfig) -> Result<Self, EngineError> {
        log::debug!("spawning bridge: {} {:?}", config.command, config.args);
        let mut child = Command::new(&config.command)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| EngineError::Bridge(format!("spawn {}: {e}", config.command)))?;
        let writer = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Bridge("bridge stdin unavailable".into()))?;
        let reader = child
            .stdout
            .take()
            .map(BufReader::new)
            .ok_or_else(|| EngineError::Bridge("bridge stdout unavailable".into()))?;
        Ok(Self { child, writer, reader })
    }

    fn round_trip<T: DeserializeOwned>(&mut self, request: &BridgeRequest) -> Result<T, EngineError> {
        let mut line = serde_json::to_string(request)
            .map_err(|e| EngineError::Bridge(format!("encode request: {e}")))?;
        line.push('\n');
        self.writer
            .write_all(line.as_bytes())
            .and_then(|_| self.writer.flush())
            .map_err(|e| EngineError::Bridge(format!("write request: {e}")))?;

        let mut buf = String::new();
        let n = self
            .reader
            .read_line(&mut buf)
            .map_err(|e| EngineError::Bridge(format!("read reply: {e}")))?;
        if n == 0 {
            return Err(EngineError::Bridge("bridge closed its stdout".into()));
        }
        let reply: BridgeReply = serde_json::from_str(buf.trim())
            .map_err(|e| EngineError::Bridge(format!("decode reply: {e}")))?;
        if !reply.ok {
            return Err(EngineError::Processing(
                reply.error.unwrap_or_else(|| "unspecified engine error".into()),
            ));
        }
        serde_json::from_value(reply.value)
            .map_err(|e| EngineError::Bridge(format!("decode reply value: {e}")))
    }
}

/// Normalize engine-native date values crossing the boundary.
fn normalize_value(value: CellValue) -> Result<CellValue, EngineError> {
    match value {
        CellValue::DateTime(raw) => CellValue::date_from_engine(&raw),
        other => Ok(other),
    }
}

fn normalize_state(state: CellState) -> Result<CellState, EngineError> {
    Ok(CellState { value: normalize_value(state.value)?, ..state })
}

impl EngineBackend for BridgeEngine {
    fn configure(&mut self, config: &EngineConfig) -> Result<(), EngineError> {
        self.round_trip(&BridgeRequest::Configure { config: config.clone() })
            .map_err(|e| match e {
                EngineError::Processing(msg) => EngineError::Init(msg),
                other => other,
            })
    }

    fn open_document(&mut self, path: &Path, mode: OpenMode) -> Result<(), EngineError> {
        self.round_trip(&BridgeRequest::OpenDocument {
            path: path.to_string_lossy().into_owned(),
            mode,
        })
    }

    fn sheets(&mut self) -> Result<Vec<SheetInfo>, EngineError> {
        self.round_trip(&BridgeRequest::Sheets)
    }

    fn read_cell(&mut self, addr: &CellAddress) -> Result<CellState, EngineError> {
        let state: CellState = self.round_trip(&BridgeRequest::ReadCell {
            sheet: addr.sheet.clone(),
            col: addr.col.clone(),
            row: addr.row,
        })?;
        normalize_state(state)
    }

    fn write_formula(&mut self, addr: &CellAddress, formula: &str) -> Result<(), EngineError> {
        self.round_trip(&BridgeRequest::WriteFormula {
            sheet: addr.sheet.clone(),
            col: addr.col.clone(),
            row: addr.row,
            formula: formula.to_string(),
        })
    }

    fn write_value(&mut self, addr: &CellAddress, value: &CellValue) -> Result<(), EngineError> {
        self.round_trip(&BridgeRequest::WriteValue {
            sheet: addr.sheet.clone(),
            col: addr.col.clone(),
            row: addr.row,
            value: value.clone(),
        })
    }

    fn recalc_cell(&mut self, addr: &CellAddress) -> Result<(), EngineError> {
        self.round_trip(&BridgeRequest::RecalcCell {
            sheet: addr.sheet.clone(),
            col: addr.col.clone(),
            row: addr.row,
        })
    }

    fn probe_locked(&mut self, sheet: &str) -> Result<bool, EngineError> {
        self.round_trip(&BridgeRequest::ProbeLocked { sheet: sheet.to_string() })
    }

    fn special_cells(
        &mut self,
        sheet: &str,
        class: CellClass,
    ) -> Result<Vec<(CellAddress, CellState)>, EngineError> {
        let cells: Vec<(CellAddress, CellState)> = self.round_trip(&BridgeRequest::SpecialCells {
            sheet: sheet.to_string(),
            class,
        })?;
        cells
            .into_iter()
            .map(|(addr, state)| Ok((addr, normalize_state(state)?)))
            .collect()
    }

    fn used_range_cells(&mut self, sheet: &str) -> Result<Vec<CellAddress>, EngineError> {
        self.round_trip(&BridgeRequest::UsedRangeCells { sheet: sheet.to_string() })
    }

    fn defined_names(&mut self) -> Result<Vec<EngineName>, EngineError> {
        self.round_trip(&BridgeRequest::DefinedNames)
    }

    fn define_name(&mut self, sheet: &str, name: &str, refers_to: &str) -> Result<(), EngineError> {
        self.round_trip(&BridgeRequest::DefineName {
            sheet: sheet.to_string(),
            name: name.to_string(),
            refers_to: refers_to.to_string(),
        })
    }

    fn read_name(&mut self, name: &str) -> Result<String, EngineError> {
        self.round_trip(&BridgeRequest::ReadName { name: name.to_string() })
    }

    fn comments(&mut self, sheet: &str) -> Result<Vec<(CellAddress, String)>, EngineError> {
        self.round_trip(&BridgeRequest::Comments { sheet: sheet.to_string() })
    }

    fn vba_project(&mut self) -> Result<VbaProject, EngineError> {
        self.round_trip(&BridgeRequest::VbaProject)
    }

    fn cell_style(&mut self, addr: &CellAddress) -> Result<CellStyle, EngineError> {
        self.round_trip(&BridgeRequest::CellStyle {
            sheet: addr.sheet.clone(),
            col: addr.col.clone(),
            row: addr.row,
        })
    }

    fn document_property(&mut self, prop: BuiltinProperty) -> Result<String, EngineError> {
        self.round_trip(&BridgeRequest::DocumentProperty { property: prop })
    }

    fn execute_jump(&mut self, addr: &CellAddress) -> Result<bool, EngineError> {
        self.round_trip(&BridgeRequest::ExecuteJump {
            sheet: addr.sheet.clone(),
            address_r1c1: addr.r1c1(),
        })
    }

    fn save_as(&mut self, path: &Path, format: SaveFormat) -> Result<(), EngineError> {
        self.round_trip(&BridgeRequest::SaveAs {
            path: path.to_string_lossy().into_owned(),
            format,
        })
    }

    fn close_document(&mut self) -> Result<(), EngineError> {
        self.round_trip(&BridgeRequest::CloseDocument)
    }

    fn terminate(&mut self) {
        // Polite shutdown first, then the hammer. Both best-effort.
        let _ = self.round_trip::<()>(&BridgeRequest::Terminate);
        let _ = self.child.kill();
        let _ = self.child.wait();
    }

    fn pid(&self) -> Option<u32> {
        Some(self.child.id())
    }
}

impl Drop for BridgeEngine {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Spawner handing out fresh bridge processes.
pub struct BridgeSpawner {
    config: BridgeConfig,
}

impl BridgeSpawner {
    pub fn new(config: BridgeConfig) -> Self {
        Self { config }
    }
}

impl EngineSpawner for BridgeSpawner {
    fn spawn(&self) -> Result<Box<dyn EngineBackend>, EngineError> {
        Ok(Box::new(BridgeEngine::spawn(&self.config)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let req = BridgeRequest::ReadCell { sheet: "Sheet1".into(), col: "A".into(), row: 1 };
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"op":"read_cell","sheet":"Sheet1","col":"A","row":1}"#);
    }

    #[test]
    fn test_jump_request_carries_r1c1() {
        let addr = CellAddress::new("Macro1", "B", 3);
        let req = BridgeRequest::ExecuteJump {
            sheet: addr.sheet.clone(),
            address_r1c1: addr.r1c1(),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains(r#""address_r1c1":"R3C2""#));
    }

    #[test]
    fn test_request_round_trip() {
        let reqs = vec![
            BridgeRequest::Configure { config: EngineConfig::default() },
            BridgeRequest::OpenDocument { path: "/tmp/x.bin".into(), mode: OpenMode::Repair },
            BridgeRequest::SpecialCells { sheet: "S".into(), class: CellClass::Formulas },
            BridgeRequest::SaveAs { path: "/tmp/x.repair".into(), format: SaveFormat::BinaryWorkbook },
            BridgeRequest::Terminate,
        ];
        for req in reqs {
            let json = serde_json::to_string(&req).unwrap();
            let back: BridgeRequest = serde_json::from_str(&json).unwrap();
            assert_eq!(back, req);
        }
    }

    #[test]
    fn test_reply_decoding() {
        let reply: BridgeReply =
            serde_json::from_str(r#"{"ok":true,"value":{"type":"number","value":6.0}}"#).unwrap();
        assert!(reply.ok);
        let value: CellValue = serde_json::from_value(reply.value).unwrap();
        assert_eq!(value, CellValue::Number(6.0));

        let err: BridgeReply = serde_json::from_str(r#"{"ok":false,"error":"boom"}"#).unwrap();
        assert!(!err.ok);
        assert_eq!(err.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_unit_reply_from_null_value() {
        let reply: BridgeReply = serde_json::from_str(r#"{"ok":true}"#).unwrap();
        let unit: () = serde_json::from_value(reply.value).unwrap();
        let _ = unit;
    }
}
