//! Column-oriented numeric tables with three-row headers.

use serde::{Deserialize, Serialize};

/// Header of one column: long name, unit, and a sub-label (condition or curve tag).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnHeader {
    pub name: String,
    pub unit: String,
    pub sub_label: String,
}

impl ColumnHeader {
    pub fn new(name: impl Into<String>, unit: impl Into<String>, sub_label: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unit: unit.into(),
            sub_label: sub_label.into(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ColumnBlock {
    pub headers: Vec<ColumnHeader>,
    pub columns: Vec<Vec<f64>>,
}

impl ColumnBlock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, header: ColumnHeader, values: Vec<f64>) {
        self.headers.push(header);
        self.columns.push(values);
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    /// Length of the longest column.
    pub fn height(&self) -> usize {
        self.columns.iter().map(Vec::len).max().unwrap_or(0)
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.headers
            .iter()
            .position(|h| h.name == name)
            .map(|idx| self.columns[idx].as_slice())
    }

    /// Row `r` across all columns; shorter columns read as NaN.
    pub fn row(&self, r: usize) -> Vec<f64> {
        self.columns
            .iter()
            .map(|c| c.get(r).copied().unwrap_or(f64::NAN))
            .collect()
    }

    /// The three header rows (names, units, sub-labels).
    pub fn header_rows(&self) -> [Vec<&str>; 3] {
        [
            self.headers.iter().map(|h| h.name.as_str()).collect(),
            self.headers.iter().map(|h| h.unit.as_str()).collect(),
            self.headers.iter().map(|h| h.sub_label.as_str()).collect(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ragged_columns_pad_with_nan() {
        let mut block = ColumnBlock::new();
        block.push(ColumnHeader::new("t", "s", "x"), vec![0.0, 1.0, 2.0]);
        block.push(ColumnHeader::new("E", "V", "x"), vec![0.5]);
        assert_eq!(block.width(), 2);
        assert_eq!(block.height(), 3);
        let row = block.row(2);
        assert_eq!(row[0], 2.0);
        assert!(row[1].is_nan());
        assert_eq!(block.column("E"), Some(&[0.5][..]));
        assert!(block.column("I").is_none());
        assert_eq!(block.header_rows()[1], vec!["s", "V"]);
    }
}
