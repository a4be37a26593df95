//! In-memory star table model.
//!
//! # Invariants
//! - Column names are unique; the first declaration wins.
//! - Every row holds exactly one value per column.

use super::labels::NOT_FOUND;
use super::StarError;
use std::borrow::Cow;
use std::fmt::{Display, Formatter};
use std::path::Path;

/// One scalar cell.
#[derive(Debug, Clone, PartialEq)]
pub enum StarValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl StarValue {
    /// Infers the narrowest type for one raw token.
    pub fn parse(raw: &str) -> Self {
        if let Ok(value) = raw.parse::<i64>() {
            return Self::Int(value);
        }
        match raw.parse::<f64>() {
            Ok(value) if !raw.eq_ignore_ascii_case("nan") && !raw.eq_ignore_ascii_case("inf") => {
                Self::Float(value)
            }
            _ => Self::Text(raw.to_string()),
        }
    }

    /// Numeric view; text never converts.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(value) => Some(*value as f64),
            Self::Float(value) => Some(*value),
            Self::Text(_) => None,
        }
    }

    /// Integer view; floats convert only when they carry no fraction.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            Self::Float(value) if value.fract() == 0.0 => Some(*value as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value.as_str()),
            _ => None,
        }
    }
}

impl Display for StarValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(value) => write!(f, "{value}"),
            // Shortest text that parses back to the same value, never integer-shaped.
            Self::Float(value) => write!(f, "{value:?}"),
            Self::Text(value) if value.is_empty() => f.write_str("\"\""),
            Self::Text(value) if value.chars().any(char::is_whitespace) => {
                write!(f, "\"{value}\"")
            }
            Self::Text(value) => f.write_str(value),
        }
    }
}

impl From<i64> for StarValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for StarValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u32> for StarValue {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for StarValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for StarValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for StarValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&Path> for StarValue {
    fn from(value: &Path) -> Self {
        Self::Text(value.to_string_lossy().into_owned())
    }
}

/// Row-oriented table keyed by column name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<StarValue>>,
}

impl Table {
    /// Creates an empty table with the given column declaration.
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut unique: Vec<String> = Vec::new();
        for column in columns {
            let column = column.into();
            if !unique.contains(&column) {
                unique.push(column);
            }
        }
        Self {
            columns: unique,
            rows: Vec::new(),
        }
    }

    pub fn column_names(&self) -> &[String] {
        &self.columns
    }

    pub fn has_column(&self, label: &str) -> bool {
        self.columns.iter().any(|column| column == label)
    }

    pub fn has_all_columns(&self, labels: &[&str]) -> bool {
        labels.iter().all(|label| self.has_column(label))
    }

    /// Returns the requested labels absent from this table, in request order.
    pub fn missing_columns<'l>(&self, labels: &[&'l str]) -> Vec<&'l str> {
        labels
            .iter()
            .copied()
            .filter(|label| !self.has_column(label))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(&self, index: usize) -> Option<Row<'_>> {
        self.rows.get(index).map(|values| Row {
            columns: &self.columns,
            values,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = Row<'_>> + '_ {
        self.rows.iter().map(|values| Row {
            columns: &self.columns,
            values,
        })
    }

    /// Appends one row given in column order.
    pub fn add_row(&mut self, values: Vec<StarValue>) -> Result<(), StarError> {
        if values.len() != self.columns.len() {
            return Err(StarError::RowWidth {
                expected: self.columns.len(),
                found: values.len(),
            });
        }
        self.rows.push(values);
        Ok(())
    }

    /// Appends a row from another table, matching values by label.
    ///
    /// Labels the source row lacks are filled with the `NOT_FOUND` sentinel.
    pub fn append_row(&mut self, row: &Row<'_>) {
        let values = self
            .columns
            .iter()
            .map(|label| {
                row.get(label)
                    .cloned()
                    .unwrap_or_else(|| StarValue::from(NOT_FOUND))
            })
            .collect();
        self.rows.push(values);
    }

    pub fn clear_rows(&mut self) {
        self.rows.clear();
    }
}

/// Borrowed view over one table row.
#[derive(Debug, Clone, Copy)]
pub struct Row<'a> {
    columns: &'a [String],
    values: &'a [StarValue],
}

impl<'a> Row<'a> {
    pub fn get(&self, label: &str) -> Option<&'a StarValue> {
        self.columns
            .iter()
            .position(|column| column == label)
            .map(|index| &self.values[index])
    }

    /// Text lookup that yields `NOT_FOUND` for absent columns.
    pub fn text(&self, label: &str) -> Cow<'a, str> {
        match self.get(label) {
            Some(StarValue::Text(value)) => Cow::Borrowed(value.as_str()),
            Some(other) => Cow::Owned(other.to_string()),
            None => Cow::Borrowed(NOT_FOUND),
        }
    }

    /// Numeric lookup substituting `default` for absent or non-numeric cells.
    pub fn float_or(&self, label: &str, default: f64) -> f64 {
        self.get(label)
            .and_then(StarValue::as_f64)
            .unwrap_or(default)
    }

    pub fn int_or(&self, label: &str, default: i64) -> i64 {
        self.get(label)
            .and_then(StarValue::as_i64)
            .unwrap_or(default)
    }

    pub fn values(&self) -> &'a [StarValue] {
        self.values
    }
}

#[cfg(test)]
mod tests {
    use super::{StarValue, Table};
    use crate::star::labels::NOT_FOUND;
    use crate::star::StarError;

    fn sample() -> Table {
        let mut table = Table::new(["tomo", "x", "label"]);
        table
            .add_row(vec!["a.mrc".into(), 1.5.into(), 3.into()])
            .expect("row width matches");
        table
    }

    #[test]
    fn parses_values_into_narrowest_type() {
        assert_eq!(StarValue::parse("12"), StarValue::Int(12));
        assert_eq!(StarValue::parse("-0.25"), StarValue::Float(-0.25));
        assert_eq!(StarValue::parse("tomo_1.mrc"), StarValue::Text("tomo_1.mrc".into()));
        assert_eq!(StarValue::parse("nan"), StarValue::Text("nan".into()));
    }

    #[test]
    fn floats_render_to_text_that_parses_back_exactly() {
        for value in [0.1234567, 1e-9, 2.0, -123.456789012, 6.02e23] {
            let text = StarValue::Float(value).to_string();
            assert_eq!(StarValue::parse(&text), StarValue::Float(value), "{text}");
        }
        assert_eq!(StarValue::Float(2.0).to_string(), "2.0");
    }

    #[test]
    fn rejects_rows_with_wrong_width() {
        let mut table = Table::new(["a", "b"]);
        let err = table
            .add_row(vec![1.into()])
            .expect_err("short row must fail");
        assert!(matches!(err, StarError::RowWidth { expected: 2, found: 1 }));
    }

    #[test]
    fn duplicate_columns_are_declared_once() {
        let table = Table::new(["a", "b", "a"]);
        assert_eq!(table.column_names(), ["a", "b"]);
    }

    #[test]
    fn absent_columns_use_sentinel_and_defaults() {
        let table = sample();
        let row = table.row(0).expect("one row");
        assert_eq!(row.text("missing"), NOT_FOUND);
        assert_eq!(row.float_or("missing", 0.0), 0.0);
        assert_eq!(row.float_or("x", 0.0), 1.5);
        assert_eq!(row.int_or("label", 0), 3);
        assert_eq!(row.text("label"), "3");
    }

    #[test]
    fn reports_missing_columns_in_request_order() {
        let table = sample();
        assert!(table.has_all_columns(&["tomo", "x"]));
        assert_eq!(table.missing_columns(&["z", "x", "y"]), vec!["z", "y"]);
    }

    #[test]
    fn append_row_matches_by_label() {
        let source = sample();
        let mut target = Table::new(["label", "tomo", "extra"]);
        target.append_row(&source.row(0).expect("one row"));

        let row = target.row(0).expect("appended row");
        assert_eq!(row.int_or("label", 0), 3);
        assert_eq!(row.text("tomo"), "a.mrc");
        assert_eq!(row.text("extra"), NOT_FOUND);
    }
}
