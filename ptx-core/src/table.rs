//! Result tables and parameter sets exchanged between fragments, engines, and procedures.
//!
//! The core treats table contents as opaque. The value model stays small on purpose: the real
//! storage engine owns column typing and serialization.

use ptx_common::error::{PtxError, PtxResult};

/// One cell value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    /// SQL `NULL`.
    Null,
    /// Signed 64-bit integer.
    Integer(i64),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
}

impl Value {
    /// Returns the integer payload, if this value is an integer.
    #[must_use]
    pub const fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }

    /// Builds an integer cell from an optional id, mapping `None` to `NULL`.
    #[must_use]
    pub fn from_optional_id(id: Option<u64>) -> Self {
        id.and_then(|id| i64::try_from(id).ok())
            .map_or(Self::Null, Self::Integer)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

/// Column-named table of rows, the unit carried by a dependency.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultTable {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl ResultTable {
    /// Creates an empty table with the given column names.
    #[must_use]
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    /// Creates a one-column, one-row table holding `value`.
    #[must_use]
    pub fn scalar(column: impl Into<String>, value: Value) -> Self {
        Self {
            columns: vec![column.into()],
            rows: vec![vec![value]],
        }
    }

    /// Appends one row.
    ///
    /// # Errors
    ///
    /// Returns `PtxError::Engine` when the row width does not match the column count.
    pub fn push_row(&mut self, row: Vec<Value>) -> PtxResult<()> {
        if row.len() != self.columns.len() {
            return Err(PtxError::Engine(format!(
                "row has {} values but table has {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    /// Appends all rows of `other`.
    ///
    /// An empty, column-less table adopts the columns of the first table merged into it.
    ///
    /// # Errors
    ///
    /// Returns `PtxError::Engine` when both tables have columns and they differ.
    pub fn merge(&mut self, other: Self) -> PtxResult<()> {
        if self.columns.is_empty() && self.rows.is_empty() {
            *self = other;
            return Ok(());
        }
        if self.columns != other.columns {
            return Err(PtxError::Engine(
                "cannot merge tables with different columns".to_owned(),
            ));
        }
        self.rows.extend(other.rows);
        Ok(())
    }

    /// Truncates the table to `len` rows.
    pub fn truncate(&mut self, len: usize) {
        self.rows.truncate(len);
    }

    /// Column names.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Rows in insertion order.
    #[must_use]
    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    /// Number of rows.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Returns whether the table holds no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Positional parameters for one plan fragment or procedure invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterSet(Vec<Value>);

impl ParameterSet {
    /// Wraps positional values.
    #[must_use]
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    /// Positional values.
    #[must_use]
    pub fn values(&self) -> &[Value] {
        &self.0
    }

    /// Value at `index`, if present.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.0.get(index)
    }

    /// Number of parameters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns whether no parameters are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::{ResultTable, Value};
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn push_row_checks_width() {
        let mut table = ResultTable::new(["ID", "NAME"]);
        assert_that!(
            table
                .push_row(vec![Value::Integer(1), Value::from("a")])
                .is_ok(),
            eq(true)
        );
        assert_that!(table.push_row(vec![Value::Integer(2)]).is_err(), eq(true));
        assert_that!(table.row_count(), eq(1_usize));
    }

    #[rstest]
    fn merge_into_empty_adopts_columns() {
        let mut merged = ResultTable::default();
        merged
            .merge(ResultTable::scalar("N", Value::Integer(1)))
            .expect("merge into empty must succeed");
        merged
            .merge(ResultTable::scalar("N", Value::Integer(2)))
            .expect("same columns must merge");

        assert_that!(merged.columns().len(), eq(1_usize));
        assert_that!(merged.columns()[0].as_str(), eq("N"));
        assert_that!(merged.row_count(), eq(2_usize));
    }

    #[rstest]
    fn merge_rejects_column_mismatch() {
        let mut merged = ResultTable::scalar("A", Value::Null);
        let result = merged.merge(ResultTable::scalar("B", Value::Null));
        assert_that!(result.is_err(), eq(true));
    }

    #[rstest]
    #[case(None, Value::Null)]
    #[case(Some(42), Value::Integer(42))]
    #[case(Some(u64::MAX), Value::Null)]
    fn optional_ids_map_to_cells(#[case] id: Option<u64>, #[case] expected: Value) {
        let cell = Value::from_optional_id(id);
        assert_that!(&cell, eq(&expected));
    }
}
