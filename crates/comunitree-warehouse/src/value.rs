//! Bind values and canonical result rows

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// Positional bind value for a `?` placeholder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Integer(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

/// One result record. Column names are lowercased on the way in so callers
/// never depend on the warehouse's identifier casing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row(Map<String, JsonValue>);

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, column: &str, value: impl Into<JsonValue>) {
        self.0.insert(column.to_lowercase(), value.into());
    }

    /// Builder-style insert
    pub fn with(mut self, column: &str, value: impl Into<JsonValue>) -> Self {
        self.insert(column, value);
        self
    }

    /// Look up a column in any case
    pub fn get(&self, column: &str) -> Option<&JsonValue> {
        self.0.get(&column.to_lowercase())
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_json(self) -> JsonValue {
        JsonValue::Object(self.0)
    }
}

impl<'a, V: Into<JsonValue>> FromIterator<(&'a str, V)> for Row {
    fn from_iter<I: IntoIterator<Item = (&'a str, V)>>(iter: I) -> Self {
        let mut row = Row::new();
        for (column, value) in iter {
            row.insert(column, value);
        }
        row
    }
}

/// What the driver reports about an executed statement
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatementMeta {
    pub sql_text: String,
    pub query_id: Option<String>,
    /// Result column names, lowercased, in result order
    pub columns: Vec<String>,
    pub row_count: usize,
}

/// Rows plus statement metadata. `rows` is empty, never absent, for
/// statements that return nothing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecuteResult {
    pub rows: Vec<Row>,
    pub statement: StatementMeta,
}

impl ExecuteResult {
    /// Result whose metadata is derived from the rows themselves
    pub fn from_rows(sql: &str, rows: Vec<Row>) -> Self {
        let columns = rows
            .first()
            .map(|r| r.columns().map(str::to_string).collect())
            .unwrap_or_default();
        Self {
            statement: StatementMeta {
                sql_text: sql.to_string(),
                query_id: None,
                columns,
                row_count: rows.len(),
            },
            rows,
        }
    }

    pub fn empty(sql: &str) -> Self {
        Self::from_rows(sql, Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn row_keys_are_lowercased() {
        let row = Row::new().with("USER_ID", 7).with("Email", "a@b.c");

        assert_eq!(row.get("user_id"), Some(&json!(7)));
        assert_eq!(row.get("EMAIL"), Some(&json!("a@b.c")));
        assert_eq!(
            row.into_json(),
            json!({ "user_id": 7, "email": "a@b.c" })
        );
    }

    #[test]
    fn option_binds_become_null() {
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(Some("x")), Value::Text("x".into()));
    }

    #[test]
    fn result_metadata_from_rows() {
        let rows = vec![
            Row::from_iter([("ID", json!(1))]),
            Row::from_iter([("ID", json!(2))]),
        ];
        let result = ExecuteResult::from_rows("SELECT id FROM users", rows);

        assert_eq!(result.statement.row_count, 2);
        assert_eq!(result.statement.columns, vec!["id".to_string()]);
        assert!(ExecuteResult::empty("USE SCHEMA PUBLIC").rows.is_empty());
    }
}
