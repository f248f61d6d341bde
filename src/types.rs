use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::SqlBrokerError;

/// A caller-supplied statement parameter.
///
/// This is a closed union: every value an application can bind is one of
/// these variants, and the conversion to the wire representation is explicit
/// rather than inferred at dispatch time:
/// ```rust
/// use sqlite_broker::prelude::*;
///
/// let params = vec![
///     SqlParam::Integer(1),
///     SqlParam::Text("alice".into()),
///     SqlParam::Bool(true),
/// ];
/// # let _ = params;
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    /// NULL value
    Null,
    /// Integer value (64-bit)
    Integer(i64),
    /// Floating point value (64-bit)
    Real(f64),
    /// Text/string value
    Text(String),
    /// Boolean value, marshalled as `1`/`0`
    Bool(bool),
    /// A value the wire format cannot carry; the string names the offending
    /// type for the error message
    Unsupported(String),
}

impl SqlParam {
    /// Convert this parameter into its wire representation.
    ///
    /// Booleans become `Integer(1)`/`Integer(0)`. `Unsupported` values are
    /// rejected here, before the statement is ever queued.
    ///
    /// # Errors
    /// Returns [`SqlBrokerError::Parameter`] for an `Unsupported` value.
    pub fn normalize(self) -> Result<SqlValue, SqlBrokerError> {
        match self {
            SqlParam::Null => Ok(SqlValue::Null),
            SqlParam::Integer(v) => Ok(SqlValue::Integer(v)),
            SqlParam::Real(v) => Ok(SqlValue::Real(v)),
            SqlParam::Text(v) => Ok(SqlValue::Text(v)),
            SqlParam::Bool(v) => Ok(SqlValue::Integer(i64::from(v))),
            SqlParam::Unsupported(kind) => Err(SqlBrokerError::Parameter(format!(
                "unsupported parameter type <{kind}>"
            ))),
        }
    }
}

impl From<i64> for SqlParam {
    fn from(value: i64) -> Self {
        SqlParam::Integer(value)
    }
}

impl From<f64> for SqlParam {
    fn from(value: f64) -> Self {
        SqlParam::Real(value)
    }
}

impl From<&str> for SqlParam {
    fn from(value: &str) -> Self {
        SqlParam::Text(value.to_owned())
    }
}

impl From<String> for SqlParam {
    fn from(value: String) -> Self {
        SqlParam::Text(value)
    }
}

impl From<bool> for SqlParam {
    fn from(value: bool) -> Self {
        SqlParam::Bool(value)
    }
}

/// A value crossing the engine boundary, either as a bound parameter or as a
/// cell of a result row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    /// NULL value
    Null,
    /// Integer value (64-bit)
    Integer(i64),
    /// Floating point value (64-bit)
    Real(f64),
    /// Text/string value
    Text(String),
}

impl SqlValue {
    /// Check if this value is NULL
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        if let SqlValue::Integer(value) = self {
            Some(*value)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_real(&self) -> Option<f64> {
        if let SqlValue::Real(value) = self {
            Some(*value)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        if let SqlValue::Text(value) = self {
            Some(value)
        } else {
            None
        }
    }
}

/// A row from a statement result.
///
/// Column names are shared across all rows of a result set.
#[derive(Debug, Clone)]
pub struct SqlRow {
    columns: Arc<Vec<String>>,
    values: Vec<SqlValue>,
    // Cache of column name to index; avoids repeated string comparisons.
    column_index: Arc<HashMap<String, usize>>,
}

impl SqlRow {
    #[must_use]
    pub fn new(columns: Arc<Vec<String>>, values: Vec<SqlValue>) -> Self {
        let column_index = Arc::new(
            columns
                .iter()
                .enumerate()
                .map(|(i, name)| (name.clone(), i))
                .collect::<HashMap<_, _>>(),
        );
        Self {
            columns,
            values,
            column_index,
        }
    }

    /// The column names, in declaration order.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Get a value by column name, or `None` if the column does not exist.
    #[must_use]
    pub fn get(&self, column_name: &str) -> Option<&SqlValue> {
        let idx = self
            .column_index
            .get(column_name)
            .copied()
            .or_else(|| self.columns.iter().position(|col| col == column_name))?;
        self.values.get(idx)
    }

    /// Get a value by zero-based column index.
    #[must_use]
    pub fn get_index(&self, index: usize) -> Option<&SqlValue> {
        self.values.get(index)
    }

    /// The raw values of this row.
    #[must_use]
    pub fn values(&self) -> &[SqlValue] {
        &self.values
    }
}

/// The outcome of one successfully executed statement.
#[derive(Debug, Clone, Default)]
pub struct StatementResult {
    rows: Vec<SqlRow>,
    /// Rows affected by a DML statement
    pub rows_affected: u64,
    /// Rowid generated by an INSERT, when the engine reports one
    pub insert_id: Option<i64>,
}

impl StatementResult {
    #[must_use]
    pub fn new(rows: Vec<SqlRow>, rows_affected: u64, insert_id: Option<i64>) -> Self {
        Self {
            rows,
            rows_affected,
            insert_id,
        }
    }

    /// Zero-indexed row accessor.
    #[must_use]
    pub fn item(&self, index: usize) -> Option<&SqlRow> {
        self.rows.get(index)
    }

    /// The raw row list.
    #[must_use]
    pub fn rows(&self) -> &[SqlRow] {
        &self.rows
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_params_marshal_to_zero_and_one() {
        assert_eq!(
            SqlParam::Bool(true).normalize().unwrap(),
            SqlValue::Integer(1)
        );
        assert_eq!(
            SqlParam::Bool(false).normalize().unwrap(),
            SqlValue::Integer(0)
        );
    }

    #[test]
    fn unsupported_param_is_rejected() {
        let err = SqlParam::Unsupported("function".into())
            .normalize()
            .unwrap_err();
        assert!(matches!(err, SqlBrokerError::Parameter(_)));
        assert!(err.to_string().contains("<function>"));
    }

    #[test]
    fn row_lookup_by_name_and_index() {
        let columns = Arc::new(vec!["id".to_owned(), "name".to_owned()]);
        let row = SqlRow::new(
            columns,
            vec![SqlValue::Integer(7), SqlValue::Text("alice".into())],
        );
        assert_eq!(row.get("id").and_then(SqlValue::as_int), Some(7));
        assert_eq!(row.get_index(1).and_then(|v| v.as_text()), Some("alice"));
        assert!(row.get("missing").is_none());
    }
}
