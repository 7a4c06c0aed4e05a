//! Client-side rendering of positional binds
//!
//! The Snowflake SDK we use has no bind API, so `?` placeholders are replaced
//! with escaped SQL literals before the statement is sent.

use crate::error::{Result, WarehouseError};
use crate::value::Value;

/// SQL literal for one bind value
pub fn to_sql_literal(value: &Value) -> Result<String> {
    Ok(match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Float(f) if f.is_finite() => format!("{:?}", f),
        Value::Float(f) => {
            return Err(WarehouseError::Query(format!(
                "cannot bind non-finite float {}",
                f
            )))
        }
        Value::Text(s) => quote(s),
    })
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\'' => out.push_str("''"),
            '\\' => out.push_str("\\\\"),
            other => out.push(other),
        }
    }
    out.push('\'');
    out
}

/// Replace each `?` outside quotes with the next bind. The number of
/// placeholders must match the number of binds.
pub fn render(sql: &str, binds: &[Value]) -> Result<String> {
    let mut out = String::with_capacity(sql.len());
    let mut remaining = binds.iter();
    let mut used = 0usize;
    let mut quote: Option<char> = None;

    for c in sql.chars() {
        match (quote, c) {
            (None, '\'') | (None, '"') => {
                quote = Some(c);
                out.push(c);
            }
            (Some(q), _) if c == q => {
                // a doubled quote closes and immediately reopens, which is fine
                quote = None;
                out.push(c);
            }
            (None, '?') => {
                let value = remaining.next().ok_or_else(|| {
                    WarehouseError::Query(format!(
                        "statement has more placeholders than the {} bind(s) given",
                        binds.len()
                    ))
                })?;
                out.push_str(&to_sql_literal(value)?);
                used += 1;
            }
            _ => out.push(c),
        }
    }

    if used != binds.len() {
        return Err(WarehouseError::Query(format!(
            "statement has {} placeholder(s) but {} bind(s) were given",
            used,
            binds.len()
        )));
    }

    Ok(out)
}
