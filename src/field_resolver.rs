//! # Field Resolver
//!
//! Turns one source value into the value written to its target field:
//! transform, coerce to the declared type, substitute the default for blank
//! values, then run the validation rules. Problems are reported as
//! [`ValidationError`]s and never abort the batch.

use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use serde_json::{Number, Value};

use crate::error::ConfigurationError;
use crate::models::value::{is_blank, parse_datetime, values_equal};
use crate::models::{
    DataType, FieldMapping, MappingConfig, Row, RuleKind, Severity, Transform, ValidationError,
    ValidationRule,
};

/// Result of resolving one field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldResolution {
    /// `None` when the field must not be written.
    pub value: Option<Value>,
    pub errors: Vec<ValidationError>,
}

impl FieldResolution {
    /// True when an error-severity problem kept the field from being written.
    pub fn is_blocked(&self) -> bool {
        self.value.is_none() && self.errors.iter().any(|e| e.severity == Severity::Error)
    }
}

/// Result of resolving every mapped field of one source row.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRow {
    /// Target field id to value.
    pub fields: Row,
    pub errors: Vec<ValidationError>,
    /// A required field (or the natural key) could not be resolved.
    pub blocked: bool,
}

impl ResolvedRow {
    pub fn key(&self, key_field: &str) -> Option<&Value> {
        self.fields.get(key_field)
    }
}

struct CompiledField {
    mapping: FieldMapping,
    patterns: Vec<Option<Regex>>,
}

/// Resolver for one mapping configuration, with validation patterns compiled once.
pub struct FieldResolver {
    fields: Vec<CompiledField>,
    key_column: String,
    natural_key_field: String,
}

impl FieldResolver {
    pub fn new(mapping: &MappingConfig) -> Result<Self, ConfigurationError> {
        let fields = mapping
            .fields
            .iter()
            .map(|field| {
                Ok(CompiledField {
                    patterns: compile_patterns(field)?,
                    mapping: field.clone(),
                })
            })
            .collect::<Result<Vec<_>, ConfigurationError>>()?;
        Ok(Self {
            fields,
            key_column: mapping.key_column.clone(),
            natural_key_field: mapping.natural_key_field.clone(),
        })
    }

    /// Resolve all mapped fields of `row`.
    pub fn resolve_row(&self, row: &Row) -> ResolvedRow {
        let row_key = row.get(&self.key_column).cloned();
        let mut fields = Row::new();
        let mut errors = Vec::new();
        let mut blocked = false;

        for compiled in &self.fields {
            let mapping = &compiled.mapping;
            let resolution =
                resolve_with(row.get(&mapping.source_column), mapping, &compiled.patterns);

            let is_key = mapping.target_field == self.natural_key_field;
            match resolution.value {
                Some(value) if is_key && is_blank(&value) => {
                    blocked = true;
                    errors.push(
                        ValidationError::error(
                            mapping.target_field.clone(),
                            value,
                            "natural key is empty",
                        )
                        .with_row_key(row_key.clone()),
                    );
                }
                Some(value) => {
                    fields.insert(mapping.target_field.clone(), value);
                }
                None => {
                    if is_key || (mapping.is_required() && resolution.is_blocked()) {
                        blocked = true;
                    }
                }
            }
            errors.extend(
                resolution
                    .errors
                    .into_iter()
                    .map(|e| e.with_row_key(row_key.clone())),
            );
        }

        ResolvedRow {
            fields,
            errors,
            blocked,
        }
    }
}

fn compile_patterns(field: &FieldMapping) -> Result<Vec<Option<Regex>>, ConfigurationError> {
    field
        .validation
        .iter()
        .map(|rule| match &rule.rule {
            RuleKind::Pattern { value } => Regex::new(value).map(Some).map_err(|e| {
                ConfigurationError::InvalidPattern {
                    field: field.target_field.clone(),
                    pattern: value.clone(),
                    reason: e.to_string(),
                }
            }),
            _ => Ok(None),
        })
        .collect()
}

/// Resolve one source value. `None` means the column is absent from the source row.
pub fn resolve(source: Option<&Value>, mapping: &FieldMapping) -> FieldResolution {
    match compile_patterns(mapping) {
        Ok(patterns) => resolve_with(source, mapping, &patterns),
        Err(e) => FieldResolution {
            value: None,
            errors: vec![ValidationError::error(
                &mapping.target_field,
                source.cloned().unwrap_or(Value::Null),
                e.to_string(),
            )],
        },
    }
}

fn resolve_with(
    source: Option<&Value>,
    mapping: &FieldMapping,
    patterns: &[Option<Regex>],
) -> FieldResolution {
    let field = mapping.target_field.as_str();

    let Some(raw) = source else {
        return match &mapping.default_value {
            Some(default) => validate(default.clone(), mapping, patterns),
            None if mapping.is_required() => FieldResolution {
                value: None,
                errors: vec![ValidationError::error(
                    field,
                    Value::Null,
                    format!("source column '{}' is missing", mapping.source_column),
                )],
            },
            None => FieldResolution {
                value: None,
                errors: vec![ValidationError::warning(
                    field,
                    Value::Null,
                    format!("source column '{}' is missing", mapping.source_column),
                )],
            },
        };
    };

    let transformed = match mapping.transform {
        Some(transform) => match apply_transform(transform, raw) {
            Ok(v) => v,
            Err(message) => return blocked(field, raw, message),
        },
        None => raw.clone(),
    };

    let coerced = match coerce(&transformed, mapping.data_type) {
        Ok(v) => v,
        Err(message) => return blocked(field, raw, message),
    };

    let value = match (&mapping.default_value, is_blank(&coerced)) {
        (Some(default), true) => default.clone(),
        _ => coerced,
    };

    validate(value, mapping, patterns)
}

fn blocked(field: &str, raw: &Value, message: String) -> FieldResolution {
    FieldResolution {
        value: None,
        errors: vec![ValidationError::error(field, raw.clone(), message)],
    }
}

fn validate(
    value: Value,
    mapping: &FieldMapping,
    patterns: &[Option<Regex>],
) -> FieldResolution {
    let mut errors = Vec::new();
    let mut block = false;
    for (rule, pattern) in mapping.validation.iter().zip(patterns) {
        if let Some(message) = check_rule(rule, pattern.as_ref(), &value) {
            let message = rule.message.clone().unwrap_or(message);
            let error = match rule.severity {
                Severity::Error => {
                    block = true;
                    ValidationError::error(&mapping.target_field, value.clone(), message)
                }
                Severity::Warning => {
                    ValidationError::warning(&mapping.target_field, value.clone(), message)
                }
            };
            errors.push(error);
        }
    }

    FieldResolution {
        value: (!block).then_some(value),
        errors,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn text_len(value: &Value) -> Option<usize> {
    match value {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(items) => Some(items.len()),
        _ => None,
    }
}

/// Violation message for `rule`, or `None` when it holds. Non-`required` rules
/// do not apply to blank values.
fn check_rule(rule: &ValidationRule, pattern: Option<&Regex>, value: &Value) -> Option<String> {
    if let RuleKind::Required = rule.rule {
        return is_blank(value).then(|| "value is required".to_string());
    }
    if is_blank(value) {
        return None;
    }

    match &rule.rule {
        RuleKind::Required => None,
        RuleKind::MinLength { value: min } => text_len(value)
            .filter(|len| len < min)
            .map(|len| format!("length {len} is below the minimum of {min}")),
        RuleKind::MaxLength { value: max } => text_len(value)
            .filter(|len| len > max)
            .map(|len| format!("length {len} exceeds the maximum of {max}")),
        RuleKind::Min { value: min } => as_f64(value)
            .filter(|n| n < min)
            .map(|n| format!("{n} is below the minimum of {min}")),
        RuleKind::Max { value: max } => as_f64(value)
            .filter(|n| n > max)
            .map(|n| format!("{n} exceeds the maximum of {max}")),
        RuleKind::Pattern { value: source } => {
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            match pattern {
                Some(re) if re.is_match(&text) => None,
                _ => Some(format!("value does not match pattern '{source}'")),
            }
        }
        RuleKind::OneOf { values } => (!values.iter().any(|allowed| values_equal(allowed, value)))
            .then(|| "value is not one of the allowed values".to_string()),
    }
}

fn number_value(n: f64) -> Option<Value> {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Some(Value::Number(Number::from(n as i64)))
    } else {
        Number::from_f64(n).map(Value::Number)
    }
}

fn apply_transform(transform: Transform, value: &Value) -> Result<Value, String> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    match transform {
        Transform::Trim => Ok(map_text(value, |s| s.trim().to_string())),
        Transform::Uppercase => Ok(map_text(value, |s| s.to_uppercase())),
        Transform::Lowercase => Ok(map_text(value, |s| s.to_lowercase())),
        Transform::Abs | Transform::Round => {
            if is_blank(value) {
                return Ok(value.clone());
            }
            let n = as_f64(value).ok_or_else(|| format!("cannot apply {transform:?} to {value}"))?;
            let n = if transform == Transform::Abs {
                n.abs()
            } else {
                n.round()
            };
            number_value(n).ok_or_else(|| format!("{n} is not a finite number"))
        }
        Transform::DateOnly => match value {
            Value::String(s) if s.trim().is_empty() => Ok(value.clone()),
            _ => to_datetime(value)
                .map(|dt| Value::String(dt.format("%Y-%m-%d").to_string()))
                .ok_or_else(|| format!("cannot read a date from {value}")),
        },
    }
}

fn map_text(value: &Value, f: impl Fn(&str) -> String) -> Value {
    match value {
        Value::String(s) => Value::String(f(s)),
        other => other.clone(),
    }
}

/// Unix timestamps above this are taken as milliseconds.
const MILLIS_THRESHOLD: i64 = 100_000_000_000;

fn to_datetime(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_datetime(s).or_else(|| {
            s.trim()
                .parse::<i64>()
                .ok()
                .and_then(|n| to_datetime(&Value::from(n)))
        }),
        Value::Number(n) => {
            let n = n.as_i64()?;
            if n.abs() >= MILLIS_THRESHOLD {
                DateTime::from_timestamp_millis(n)
            } else {
                DateTime::from_timestamp(n, 0)
            }
        }
        _ => None,
    }
}

/// Coerce to the declared type. `null` passes through every type.
fn coerce(value: &Value, data_type: DataType) -> Result<Value, String> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    match data_type {
        DataType::String => Ok(match value {
            Value::String(_) => value.clone(),
            other => Value::String(other.to_string()),
        }),
        DataType::Number => match value {
            Value::Number(_) => Ok(value.clone()),
            Value::Bool(b) => Ok(Value::from(u8::from(*b))),
            Value::String(s) if s.trim().is_empty() => Ok(Value::Null),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(number_value)
                .ok_or_else(|| format!("'{s}' is not a number")),
            other => Err(format!("{other} is not a number")),
        },
        DataType::Date => match value {
            Value::String(s) if s.trim().is_empty() => Ok(Value::Null),
            _ => to_datetime(value)
                .map(|dt| Value::String(dt.to_rfc3339_opts(SecondsFormat::Secs, true)))
                .ok_or_else(|| format!("{value} is not a date")),
        },
        DataType::Boolean => match value {
            Value::Bool(_) => Ok(value.clone()),
            Value::Number(n) => Ok(Value::Bool(n.as_f64().is_some_and(|f| f != 0.0))),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "" => Ok(Value::Null),
                "true" | "yes" | "y" | "on" | "1" => Ok(Value::Bool(true)),
                "false" | "no" | "n" | "off" | "0" => Ok(Value::Bool(false)),
                _ => Err(format!("'{s}' is not a boolean")),
            },
            other => Err(format!("{other} is not a boolean")),
        },
        DataType::Json => match value {
            Value::String(s) => {
                serde_json::from_str(s).map_err(|e| format!("invalid JSON text: {e}"))
            }
            other => Ok(other.clone()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn transform_then_coerce_then_validate() {
        let mapping = FieldMapping::new("amount", "amount")
            .with_transform(Transform::Abs)
            .with_type(DataType::Number)
            .with_rule(RuleKind::Max { value: 100.0 }, Severity::Warning);

        let res = resolve(Some(&json!("-250")), &mapping);
        assert_eq!(res.value, Some(json!(250)));
        assert_eq!(res.errors.len(), 1);
        assert_eq!(res.errors[0].severity, Severity::Warning);
    }

    #[test]
    fn coercion_failure_is_a_validation_error() {
        let mapping = FieldMapping::new("qty", "qty").with_type(DataType::Number);
        let res = resolve(Some(&json!("lots")), &mapping);
        assert_eq!(res.value, None);
        assert!(res.is_blocked());
        assert_eq!(res.errors[0].field, "qty");
        assert_eq!(res.errors[0].value, json!("lots"));
    }

    #[test]
    fn default_replaces_blank_after_coercion() {
        let mapping = FieldMapping::new("note", "note")
            .with_transform(Transform::Trim)
            .with_default(json!("n/a"));
        let res = resolve(Some(&json!("   ")), &mapping);
        assert_eq!(res.value, Some(json!("n/a")));
        assert!(res.errors.is_empty());
    }

    #[test]
    fn missing_column_uses_default_or_reports() {
        let with_default = FieldMapping::new("region", "region").with_default(json!("cn"));
        assert_eq!(resolve(None, &with_default).value, Some(json!("cn")));

        let optional = FieldMapping::new("region", "region");
        let res = resolve(None, &optional);
        assert_eq!(res.value, None);
        assert_eq!(res.errors[0].severity, Severity::Warning);
        assert!(!res.is_blocked());

        let required = FieldMapping::new("region", "region").required();
        let res = resolve(None, &required);
        assert!(res.is_blocked());
    }

    #[test]
    fn dates_are_normalized() {
        let mapping = FieldMapping::new("at", "at").with_type(DataType::Date);
        assert_eq!(
            resolve(Some(&json!("2025-03-04 05:06:07")), &mapping).value,
            Some(json!("2025-03-04T05:06:07Z"))
        );
        assert_eq!(
            resolve(Some(&json!(1_700_000_000_000i64)), &mapping).value,
            Some(json!("2023-11-14T22:13:20Z"))
        );

        let date_only = FieldMapping::new("at", "day").with_transform(Transform::DateOnly);
        assert_eq!(
            resolve(Some(&json!("2025-03-04T23:00:00Z")), &date_only).value,
            Some(json!("2025-03-04"))
        );
    }

    #[test]
    fn booleans_accept_common_spellings() {
        let mapping = FieldMapping::new("b", "b").with_type(DataType::Boolean);
        assert_eq!(resolve(Some(&json!("Yes")), &mapping).value, Some(json!(true)));
        assert_eq!(resolve(Some(&json!(0)), &mapping).value, Some(json!(false)));
        assert!(resolve(Some(&json!("maybe")), &mapping).is_blocked());
    }

    #[test]
    fn rules_with_custom_messages() {
        let mut mapping = FieldMapping::new("code", "code");
        mapping.validation.push(ValidationRule {
            rule: RuleKind::Pattern {
                value: "^[A-Z]{3}$".into(),
            },
            severity: Severity::Error,
            message: Some("code must be three capitals".into()),
        });
        let res = resolve(Some(&json!("ab")), &mapping);
        assert!(res.is_blocked());
        assert_eq!(res.errors[0].message, "code must be three capitals");
        assert_eq!(resolve(Some(&json!("ABC")), &mapping).value, Some(json!("ABC")));
    }

    #[test]
    fn one_of_and_length_rules() {
        let mapping = FieldMapping::new("s", "s")
            .with_rule(
                RuleKind::OneOf {
                    values: vec![json!("new"), json!("done")],
                },
                Severity::Error,
            )
            .with_rule(RuleKind::MinLength { value: 4 }, Severity::Warning);
        let res = resolve(Some(&json!("new")), &mapping);
        assert_eq!(res.value, Some(json!("new")));
        assert_eq!(res.errors.len(), 1);

        let res = resolve(Some(&json!("open")), &mapping);
        assert!(res.is_blocked());
    }

    fn mapping() -> MappingConfig {
        MappingConfig {
            source_table: "t".into(),
            target_sheet_id: "s".into(),
            key_column: "id".into(),
            natural_key_field: "order_id".into(),
            fields: vec![
                FieldMapping::new("id", "order_id").with_type(DataType::Number),
                FieldMapping::new("email", "email").required(),
                FieldMapping::new("qty", "qty")
                    .with_type(DataType::Number)
                    .with_rule(RuleKind::Min { value: 0.0 }, Severity::Error),
            ],
        }
    }

    #[test]
    fn optional_field_error_only_blocks_field() {
        let resolver = FieldResolver::new(&mapping()).unwrap();
        let row = json!({"id": 7, "email": "a@b.c", "qty": -1});
        let resolved = resolver.resolve_row(row.as_object().unwrap());
        assert!(!resolved.blocked);
        assert!(!resolved.fields.contains_key("qty"));
        assert_eq!(resolved.errors.len(), 1);
        assert_eq!(resolved.errors[0].row_key, Some(json!(7)));
    }

    #[test]
    fn required_field_error_blocks_row() {
        let resolver = FieldResolver::new(&mapping()).unwrap();
        let row = json!({"id": 7, "email": "", "qty": 1});
        let resolved = resolver.resolve_row(row.as_object().unwrap());
        assert!(resolved.blocked);
    }

    #[test]
    fn null_natural_key_blocks_row() {
        let resolver = FieldResolver::new(&mapping()).unwrap();
        for id in [json!(null), json!("")] {
            let row = json!({"id": id, "email": "a@b.c", "qty": 1});
            let resolved = resolver.resolve_row(row.as_object().unwrap());
            assert!(resolved.blocked);
            assert!(!resolved.fields.contains_key("order_id"));
            assert!(resolved.errors.iter().any(|e| e.field == "order_id"));
        }
    }

    #[test]
    fn unresolvable_natural_key_blocks_row() {
        let resolver = FieldResolver::new(&mapping()).unwrap();
        let row = json!({"id": "x", "email": "a@b.c", "qty": 1});
        let resolved = resolver.resolve_row(row.as_object().unwrap());
        assert!(resolved.blocked);
    }
}
