use std::fmt;

use serde::{Serialize, Serializer};

use crate::pivot::PivotTable;

/// Share of a row total, already rounded to two decimals.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Percentage(pub f64);

impl fmt::Display for Percentage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}%", self.0)
    }
}

impl Serialize for Percentage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Numeric pivot cells that can be normalized.
pub trait CellValue {
    fn as_f64(&self) -> f64;
}

impl CellValue for f64 {
    fn as_f64(&self) -> f64 {
        *self
    }
}

impl CellValue for i64 {
    fn as_f64(&self) -> f64 {
        *self as f64
    }
}

/// Replaces each cell with its percentage of the row total so cohorts of
/// different sizes can be compared. Absent cells stay absent and do not
/// count towards the total; rows that sum to zero have no defined share.
pub fn row_percentages<T: CellValue>(table: &PivotTable<T>) -> PivotTable<Percentage> {
    let cells = table
        .cells
        .iter()
        .map(|row| {
            let total: f64 = row.iter().flatten().map(CellValue::as_f64).sum();
            row.iter()
                .map(|cell| {
                    let cell = cell.as_ref()?;
                    (total != 0.0).then(|| Percentage(round2(cell.as_f64() / total * 100.0)))
                })
                .collect()
        })
        .collect();

    PivotTable {
        dimension: table.dimension,
        rows: table.rows.clone(),
        columns: table.columns.clone(),
        cells,
    }
}

/// Two decimals, ties to even, the same as numpy's `round(2)`.
fn round2(value: f64) -> f64 {
    (value * 100.0).round_ties_even() / 100.0
}
