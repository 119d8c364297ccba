//! Row values exchanged with the source and target collaborators.
//!
//! Rows are JSON objects keyed by column (source side) or field id (target side).

use std::cmp::Ordering;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;

/// One source or target row.
pub type Row = serde_json::Map<String, Value>;

/// Parse the datetime shapes commonly returned by SQL drivers and sheet APIs.
pub fn parse_datetime(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y/%m/%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }
    for format in ["%Y-%m-%d", "%Y/%m/%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            return date.and_hms_opt(0, 0, 0).map(|n| n.and_utc());
        }
    }
    None
}

/// True for `null`, empty strings and whitespace-only strings.
pub fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

fn compare_numbers(a: &serde_json::Number, b: &serde_json::Number) -> Ordering {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return x.cmp(&y);
    }
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        return x.cmp(&y);
    }
    let x = a.as_f64().unwrap_or(f64::NAN);
    let y = b.as_f64().unwrap_or(f64::NAN);
    x.partial_cmp(&y).unwrap_or(Ordering::Equal)
}

/// Total order over JSON values used for keysets, cursors and merge min/max.
///
/// Numbers compare numerically, strings that both parse as datetimes compare
/// chronologically, numeric strings compare against numbers by value, and
/// `null` sorts before everything.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Number(x), Value::Number(y)) => compare_numbers(x, y),
        (Value::String(x), Value::String(y)) => match (parse_datetime(x), parse_datetime(y)) {
            (Some(dx), Some(dy)) => dx.cmp(&dy),
            _ => x.cmp(y),
        },
        (Value::Number(x), Value::String(y)) => match y.trim().parse::<f64>() {
            Ok(fy) => x
                .as_f64()
                .and_then(|fx| fx.partial_cmp(&fy))
                .unwrap_or(Ordering::Equal),
            Err(_) => type_rank(a).cmp(&type_rank(b)),
        },
        (Value::String(_), Value::Number(_)) => compare_values(b, a).reverse(),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ if type_rank(a) != type_rank(b) => type_rank(a).cmp(&type_rank(b)),
        _ => a.to_string().cmp(&b.to_string()),
    }
}

/// Order values the way a SQL database sorts the column they were read from.
///
/// Numbers compare numerically and strings compare byte-wise, with no attempt
/// to read them as numbers or datetimes. `null` sorts first.
pub fn compare_stored(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => compare_numbers(x, y),
        (Value::String(x), Value::String(y)) => x.as_bytes().cmp(y.as_bytes()),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ if type_rank(a) != type_rank(b) => type_rank(a).cmp(&type_rank(b)),
        _ => a.to_string().cmp(&b.to_string()),
    }
}

/// Equality used when deciding whether a field "differs" from the target.
///
/// `1` and `1.0` are equal, as are timestamps written in different formats.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    a == b || (type_rank(a) == type_rank(b) && compare_values(a, b) == Ordering::Equal)
}
