//! Cell values as they cross the engine boundary.
//!
//! Engine-native date values are normalized here to a single naive
//! ISO-8601 wire form (`YYYY-MM-DDTHH:MM:SS`, no timezone). The engine
//! reports dates with an optional zone suffix; the suffix is stripped
//! before parsing.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// A single cell's value on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CellValue {
    Empty,
    Number(f64),
    Text(String),
    Bool(bool),
    /// Naive ISO-8601 timestamp, already normalized.
    DateTime(String),
}

impl Default for CellValue {
    fn default() -> Self {
        CellValue::Empty
    }
}

impl CellValue {
    pub fn is_empty(&self) -> bool {
        matches!(self, CellValue::Empty)
    }

    /// Build a `DateTime` value from an engine-native date string.
    ///
    /// Strips any `+zone` suffix, then parses the remainder as a naive
    /// calendar timestamp (`YYYY-MM-DD HH:MM:SS`).
    pub fn date_from_engine(raw: &str) -> Result<CellValue, EngineError> {
        let naive = raw.split('+').next().unwrap_or(raw).trim();
        let parsed = NaiveDateTime::parse_from_str(naive, "%Y-%m-%d %H:%M:%S")
            .or_else(|_| NaiveDateTime::parse_from_str(naive, "%Y-%m-%dT%H:%M:%S"))
            .map_err(|e| EngineError::Processing(format!("bad engine date '{raw}': {e}")))?;
        Ok(CellValue::DateTime(parsed.format("%Y-%m-%dT%H:%M:%S").to_string()))
    }

    /// Display form used in logs and by the CLI.
    pub fn display(&self) -> String {
        match self {
            CellValue::Empty => String::new(),
            CellValue::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    format!("{n}")
                }
            }
            CellValue::Text(s) => s.clone(),
            CellValue::Bool(b) => if *b { "TRUE".into() } else { "FALSE".into() },
            CellValue::DateTime(s) => s.clone(),
        }
    }
}
