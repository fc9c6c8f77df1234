//! Indexed property lookup.
//!
//! Callers from the macro-execution era address cell and workbook
//! properties by small integers. Only a curated subset is supported;
//! the index space is modeled as fixed enumerations so an unsupported
//! index is a table miss, not a silent fallthrough.

use crate::addr::CellAddress;
use crate::backend::{BuiltinProperty, HorizontalAlign, VerticalAlign};
use crate::error::EngineError;
use crate::session::EngineSession;
use crate::value::CellValue;

/// Cell-level properties addressable by legacy numeric index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellProperty {
    Row,
    Column,
    Value,
    DisplayFormat,
    HorizontalAlignment,
    RowHeight,
    FontSize,
    FontBold,
    FontItalic,
    FontStrikethrough,
    FontColorIndex,
    FillColorIndex,
    VerticalAlignment,
}

impl CellProperty {
    pub fn from_index(index: u32) -> Option<Self> {
        match index {
            2 => Some(Self::Row),
            3 => Some(Self::Column),
            5 => Some(Self::Value),
            7 => Some(Self::DisplayFormat),
            8 => Some(Self::HorizontalAlignment),
            17 => Some(Self::RowHeight),
            19 => Some(Self::FontSize),
            20 => Some(Self::FontBold),
            21 => Some(Self::FontItalic),
            23 => Some(Self::FontStrikethrough),
            24 => Some(Self::FontColorIndex),
            38 => Some(Self::FillColorIndex),
            50 => Some(Self::VerticalAlignment),
            _ => None,
        }
    }
}

/// Workbook-level built-in properties addressable by public index.
///
/// The public numbering and the engine's own builtin-property numbering
/// disagree; the translation happens here. Only Keywords (public 36,
/// engine 4) is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkbookProperty {
    Keywords,
}

impl WorkbookProperty {
    pub fn from_index(index: u32) -> Option<Self> {
        match index {
            36 => Some(Self::Keywords),
            _ => None,
        }
    }

    fn builtin(self) -> BuiltinProperty {
        match self {
            Self::Keywords => BuiltinProperty::Keywords,
        }
    }
}

/// Legacy numeric code for a horizontal alignment.
pub fn horizontal_code(align: HorizontalAlign) -> i64 {
    match align {
        HorizontalAlign::General => 1,
        HorizontalAlign::Left => 2,
        HorizontalAlign::Center => 3,
        HorizontalAlign::Right => 4,
        HorizontalAlign::Fill => 5,
        HorizontalAlign::Justify => 6,
        HorizontalAlign::CenterAcrossSelection => 7,
        HorizontalAlign::Distributed => 8,
    }
}

/// Legacy numeric code for a vertical alignment.
pub fn vertical_code(align: VerticalAlign) -> i64 {
    match align {
        VerticalAlign::Top => 1,
        VerticalAlign::Center => 2,
        VerticalAlign::Bottom => 3,
        VerticalAlign::Justify => 4,
        VerticalAlign::Distributed => 5,
    }
}

/// Read one indexed cell property from a live session.
pub fn cell_property(
    session: &mut EngineSession,
    addr: &CellAddress,
    index: u32,
) -> Result<CellValue, EngineError> {
    let prop = CellProperty::from_index(index).ok_or(EngineError::UnsupportedIndex(index))?;
    let backend = session.backend();
    let value = match prop {
        CellProperty::Row => CellValue::Number(addr.row as f64),
        CellProperty::Column => CellValue::Number(addr.col_number() as f64),
        CellProperty::Value => backend.read_cell(addr)?.value,
        CellProperty::DisplayFormat => CellValue::Text(backend.cell_style(addr)?.display_format),
        CellProperty::HorizontalAlignment => {
            CellValue::Number(horizontal_code(backend.cell_style(addr)?.horizontal_alignment) as f64)
        }
        CellProperty::RowHeight => CellValue::Number(backend.cell_style(addr)?.row_height),
        CellProperty::FontSize => CellValue::Number(backend.cell_style(addr)?.font_size),
        CellProperty::FontBold => CellValue::Bool(backend.cell_style(addr)?.bold),
        CellProperty::FontItalic => CellValue::Bool(backend.cell_style(addr)?.italic),
        CellProperty::FontStrikethrough => CellValue::Bool(backend.cell_style(addr)?.strikethrough),
        CellProperty::FontColorIndex => {
            CellValue::Number(backend.cell_style(addr)?.font_color_index as f64)
        }
        CellProperty::FillColorIndex => {
            CellValue::Number(backend.cell_style(addr)?.fill_color_index as f64)
        }
        CellProperty::VerticalAlignment => {
            CellValue::Number(vertical_code(backend.cell_style(addr)?.vertical_alignment) as f64)
        }
    };
    Ok(value)
}

/// Read one indexed workbook property from a live session.
pub fn workbook_property(
    session: &mut EngineSession,
    index: u32,
) -> Result<CellValue, EngineError> {
    let prop = WorkbookProperty::from_index(index).ok_or(EngineError::UnsupportedIndex(index))?;
    let text = session.backend().document_property(prop.builtin())?;
    Ok(CellValue::Text(text))
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

    #[test]
    fn test_value_index() {
        let mut engine = GridEngine::new();
        engine.set_value("Sheet1", "A", 1, CellValue::Text("foo".into()));
        let mut session = session_with(engine);
        let addr = CellAddress::new("Sheet1", "A", 1);
        assert_eq!(cell_property(&mut session, &addr, 5).unwrap(), CellValue::Text("foo".into()));
    }

    #[test]
    fn test_row_and_column_indices() {
        let mut session = session_with(GridEngine::new());
        let addr = CellAddress::new("Sheet1", "C", 7);
        assert_eq!(cell_property(&mut session, &addr, 2).unwrap(), CellValue::Number(7.0));
        assert_eq!(cell_property(&mut session, &addr, 3).unwrap(), CellValue::Number(3.0));
    }

    #[test]
    fn test_unsupported_index() {
        let mut session = session_with(GridEngine::new());
        let addr = CellAddress::new("Sheet1", "A", 1);
        match cell_property(&mut session, &addr, 999) {
            Err(EngineError::UnsupportedIndex(999)) => {}
            other => panic!("expected UnsupportedIndex, got {other:?}"),
        }
    }

    #[test]
    fn test_workbook_keywords_translation() {
        let mut engine = GridEngine::new();
        engine.keywords = "obfuscated".into();
        let mut session = session_with(engine);
        assert_eq!(
            workbook_property(&mut session, 36).unwrap(),
            CellValue::Text("obfuscated".into())
        );
        match workbook_property(&mut session, 4) {
            Err(EngineError::UnsupportedIndex(4)) => {}
            other => panic!("expected UnsupportedIndex, got {other:?}"),
        }
    }

    #[test]
    fn test_alignment_codes() {
        assert_eq!(horizontal_code(HorizontalAlign::General), 1);
        assert_eq!(horizontal_code(HorizontalAlign::Distributed), 8);
        assert_eq!(vertical_code(VerticalAlign::Top), 1);
        assert_eq!(vertical_code(VerticalAlign::Distributed), 5);
    }
}
