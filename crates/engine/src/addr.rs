//! Cell addressing.
//!
//! Addresses are (sheet name, column letters, 1-based row), the way the
//! engine's automation surface spells them. Helpers produce the A1,
//! absolute (`$A$1`) and R1C1 renderings used by the extractor and the
//! trampoline.

use serde::{Deserialize, Serialize};

/// Identifies a single cell within a document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellAddress {
    pub sheet: String,
    /// Column letters, e.g. "A", "BC".
    pub col: String,
    /// 1-based row.
    pub row: u32,
}

impl CellAddress {
    pub fn new(sheet: impl Into<String>, col: impl Into<String>, row: u32) -> Self {
        Self { sheet: sheet.into(), col: col.into(), row }
    }

    /// The cell immediately below this one (the trampoline's halt slot).
    /// `None` when the row is already at the numeric ceiling.
    pub fn next_row(&self) -> Option<CellAddress> {
        let row = self.row.checked_add(1)?;
        Some(CellAddress { sheet: self.sheet.clone(), col: self.col.clone(), row })
    }

    /// "A1" form, without sheet.
    pub fn a1(&self) -> String {
        format!("{}{}", self.col, self.row)
    }

    /// "$A$1" form, without sheet. This is the key format for cell maps.
    pub fn local_absolute(&self) -> String {
        format!("${}${}", self.col, self.row)
    }

    /// "'Sheet'!$A$1" form.
    pub fn absolute(&self) -> String {
        format!("'{}'!{}", self.sheet, self.local_absolute())
    }

    /// Old-style "R1C1" form, without sheet. The trampoline jump uses this.
    pub fn r1c1(&self) -> String {
        format!("R{}C{}", self.row, self.col_number())
    }

    /// 1-based column number for the column letters.
    pub fn col_number(&self) -> u32 {
        col_to_number(&self.col)
    }
}

impl std::fmt::Display for CellAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.absolute())
    }
}

/// Convert column letters to a 1-based column number ("A" -> 1, "AA" -> 27).
/// Non-letter characters are ignored.
pub fn col_to_number(col: &str) -> u32 {
    let mut n = 0u32;
    for c in col.chars() {
        if c.is_ascii_alphabetic() {
            n = n * 26 + (c.to_ascii_uppercase() as u32 - 'A' as u32 + 1);
        }
    }
    n
}

/// Convert a 1-based column number to letters (1 -> "A", 27 -> "AA").
pub fn number_to_col(mut n: u32) -> String {
    let mut out = Vec::new();
    while n > 0 {
        let rem = ((n - 1) % 26) as u8;
        out.push(b'A' + rem);
        n = (n - 1) / 26;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}
