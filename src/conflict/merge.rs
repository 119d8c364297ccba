//! Merge expressions.
//!
//! A deliberately small language for combining an existing target value with
//! an incoming source value. Expressions are stored as text (`concat`,
//! `concat(<sep>)`, `max`, `min`, `sum`, `coalesce`, `coalesce_existing`) and
//! parsed into [`MergeExpr`] when a job definition is loaded.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use thiserror::Error;

use crate::models::value::{compare_values, is_blank};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown merge expression '{0}'")]
pub struct MergeExprError(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MergeExpr {
    /// Join existing and source text, existing first.
    Concat { separator: String },
    Max,
    Min,
    Sum,
    /// Source unless blank, else existing.
    #[default]
    Coalesce,
    /// Existing unless blank, else source.
    CoalesceExisting,
}

impl FromStr for MergeExpr {
    type Err = MergeExprError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let lower = trimmed.to_ascii_lowercase();
        match lower.as_str() {
            "concat" => {
                return Ok(MergeExpr::Concat {
                    separator: String::new(),
                });
            }
            "max" => return Ok(MergeExpr::Max),
            "min" => return Ok(MergeExpr::Min),
            "sum" => return Ok(MergeExpr::Sum),
            "coalesce" => return Ok(MergeExpr::Coalesce),
            "coalesce_existing" => return Ok(MergeExpr::CoalesceExisting),
            _ => {}
        }

        // Separator is taken verbatim from the original text.
        if lower.starts_with("concat(") && trimmed.ends_with(')') {
            let separator = &trimmed["concat(".len()..trimmed.len() - 1];
            return Ok(MergeExpr::Concat {
                separator: separator.to_string(),
            });
        }

        Err(MergeExprError(trimmed.to_string()))
    }
}

impl TryFrom<String> for MergeExpr {
    type Error = MergeExprError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for MergeExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeExpr::Concat { separator } if separator.is_empty() => f.write_str("concat"),
            MergeExpr::Concat { separator } => write!(f, "concat({separator})"),
            MergeExpr::Max => f.write_str("max"),
            MergeExpr::Min => f.write_str("min"),
            MergeExpr::Sum => f.write_str("sum"),
            MergeExpr::Coalesce => f.write_str("coalesce"),
            MergeExpr::CoalesceExisting => f.write_str("coalesce_existing"),
        }
    }
}

impl From<MergeExpr> for String {
    fn from(expr: MergeExpr) -> Self {
        expr.to_string()
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

impl MergeExpr {
    /// Combine `existing` and `source`. Pure and total: blank operands are
    /// treated as absent and a non-numeric operand is ignored by `sum`.
    pub fn evaluate(&self, existing: Option<&Value>, source: &Value) -> Value {
        let existing = existing.filter(|v| !is_blank(v));
        let incoming = Some(source).filter(|v| !is_blank(v));

        let (old, new) = match (existing, incoming) {
            (None, None) => return source.clone(),
            (Some(old), None) => return old.clone(),
            (None, Some(new)) => return new.clone(),
            (Some(old), Some(new)) => (old, new),
        };

        match self {
            MergeExpr::Concat { separator } => {
                Value::String(format!("{}{}{}", as_text(old), separator, as_text(new)))
            }
            MergeExpr::Max => match (as_number(old), as_number(new)) {
                (Some(a), Some(b)) => number_value(a.max(b)),
                _ if compare_values(old, new).is_gt() => old.clone(),
                _ => new.clone(),
            },
            MergeExpr::Min => match (as_number(old), as_number(new)) {
                (Some(a), Some(b)) => number_value(a.min(b)),
                _ if compare_values(old, new).is_lt() => old.clone(),
                _ => new.clone(),
            },
            MergeExpr::Sum => match (as_number(old), as_number(new)) {
                (Some(a), Some(b)) => number_value(a + b),
                (Some(_), None) => old.clone(),
                _ => new.clone(),
            },
            MergeExpr::Coalesce => new.clone(),
            MergeExpr::CoalesceExisting => old.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_textual_forms() {
        assert_eq!(
            "concat".parse::<MergeExpr>().unwrap(),
            MergeExpr::Concat {
                separator: String::new()
            }
        );
        assert_eq!(
            "concat(, )".parse::<MergeExpr>().unwrap(),
            MergeExpr::Concat {
                separator: ", ".into()
            }
        );
        assert_eq!(" MAX ".parse::<MergeExpr>().unwrap(), MergeExpr::Max);
        assert_eq!(
            "coalesce_existing".parse::<MergeExpr>().unwrap(),
            MergeExpr::CoalesceExisting
        );
        assert!("eval(rm -rf)".parse::<MergeExpr>().is_err());
    }

    #[test]
    fn display_round_trips() {
        for text in ["concat", "concat(|)", "max", "min", "sum", "coalesce", "coalesce_existing"] {
            let expr: MergeExpr = text.parse().unwrap();
            assert_eq!(expr.to_string(), text);
        }
    }

    #[test]
    fn concat_puts_existing_first() {
        let expr = MergeExpr::Concat {
            separator: "; ".into(),
        };
        assert_eq!(
            expr.evaluate(Some(&json!("a")), &json!("b")),
            json!("a; b")
        );
        assert_eq!(expr.evaluate(None, &json!("b")), json!("b"));
    }

    #[test]
    fn numeric_operations() {
        assert_eq!(MergeExpr::Max.evaluate(Some(&json!(3)), &json!(7)), json!(7));
        assert_eq!(MergeExpr::Min.evaluate(Some(&json!("3")), &json!(7)), json!(3));
        assert_eq!(MergeExpr::Sum.evaluate(Some(&json!(2)), &json!(2.5)), json!(4.5));
        assert_eq!(MergeExpr::Sum.evaluate(Some(&json!(2)), &json!("n/a")), json!(2));
    }

    #[test]
    fn coalesce_variants() {
        assert_eq!(
            MergeExpr::Coalesce.evaluate(Some(&json!("old")), &Value::Null),
            json!("old")
        );
        assert_eq!(
            MergeExpr::Coalesce.evaluate(Some(&json!("old")), &json!("new")),
            json!("new")
        );
        assert_eq!(
            MergeExpr::CoalesceExisting.evaluate(Some(&json!("old")), &json!("new")),
            json!("old")
        );
        assert_eq!(
            MergeExpr::CoalesceExisting.evaluate(Some(&json!("")), &json!("new")),
            json!("new")
        );
    }

    #[test]
    fn max_of_timestamps_is_chronological() {
        let out = MergeExpr::Max.evaluate(
            Some(&json!("2025-02-01T00:00:00Z")),
            &json!("2025-01-01 00:00:00"),
        );
        assert_eq!(out, json!("2025-02-01T00:00:00Z"));
    }
}
