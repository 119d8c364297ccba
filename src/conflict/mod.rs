//! # Conflict Resolver
//!
//! Decides what, if anything, is written for one resolved source row given the
//! matching target row (if any), the job's row-level strategy and its ordered
//! field overrides.
//!
//! Row-existence strategies (`append`, `ignore`, row-level `skip`) are decided
//! first; field overrides only shape rows that will actually be written.
//! Resolution is a pure function of its inputs.

pub mod merge;

pub use merge::{MergeExpr, MergeExprError};

use serde_json::Value;

use crate::connectors::WriteOp;
use crate::models::value::values_equal;
use crate::models::{ConflictStrategy, FieldConflictStrategy, FieldOverride, Row};

/// Outcome of resolving one row.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Write `row` with `op`. `conflicted` is set when an existing target row
    /// matched and at least one written field changed its value.
    Write {
        row: Row,
        op: WriteOp,
        conflicted: bool,
    },
    /// Nothing to write.
    Skip { reason: SkipReason },
    /// `error` strategy hit a differing existing row.
    Conflict { fields: Vec<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// A matching target row exists and the strategy leaves it alone.
    Exists,
    /// Every field was omitted by overrides.
    NoChanges,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Exists => "target row exists",
            SkipReason::NoChanges => "no fields to write",
        }
    }
}

fn find_override<'a>(overrides: &'a [FieldOverride], field: &str) -> Option<&'a FieldOverride> {
    overrides.iter().find(|o| o.target_field == field)
}

/// Value written for one field, or `None` to omit it from the write.
fn resolve_field(
    field: &str,
    source: &Value,
    existing: Option<&Row>,
    strategy: ConflictStrategy,
    overrides: &[FieldOverride],
) -> Option<Value> {
    let current = existing.and_then(|row| row.get(field));

    if let Some(o) = find_override(overrides, field) {
        return match o.strategy {
            FieldConflictStrategy::Overwrite => Some(source.clone()),
            // Nothing to preserve on a fresh row.
            FieldConflictStrategy::Preserve => match existing {
                Some(_) => current.cloned(),
                None => Some(source.clone()),
            },
            FieldConflictStrategy::Merge => Some(
                o.merge_expression
                    .clone()
                    .unwrap_or_default()
                    .evaluate(current, source),
            ),
            FieldConflictStrategy::Skip => None,
        };
    }

    match strategy {
        ConflictStrategy::Merge => Some(MergeExpr::Coalesce.evaluate(current, source)),
        _ => Some(source.clone()),
    }
}

/// Resolve one source row against the matching target row, if any.
///
/// `source` holds already-resolved target fields; `key_field` is always
/// written so the target can match the row.
pub fn resolve(
    source: &Row,
    existing: Option<&Row>,
    key_field: &str,
    strategy: ConflictStrategy,
    overrides: &[FieldOverride],
) -> Resolution {
    match strategy {
        ConflictStrategy::Append => {
            return Resolution::Write {
                row: build_row(source, None, key_field, strategy, overrides),
                op: WriteOp::Insert,
                conflicted: false,
            };
        }
        ConflictStrategy::Ignore | ConflictStrategy::Skip if existing.is_some() => {
            return Resolution::Skip {
                reason: SkipReason::Exists,
            };
        }
        ConflictStrategy::Error => {
            if let Some(current) = existing {
                let fields = differing_fields(source, current, key_field, overrides);
                if !fields.is_empty() {
                    return Resolution::Conflict { fields };
                }
            }
        }
        _ => {}
    }

    let row = build_row(source, existing, key_field, strategy, overrides);
    if row.keys().all(|k| k == key_field) {
        return Resolution::Skip {
            reason: SkipReason::NoChanges,
        };
    }

    let conflicted = existing.is_some_and(|current| {
        row.iter().any(|(field, value)| {
            field != key_field && current.get(field).is_some_and(|v| !values_equal(v, value))
        })
    });

    Resolution::Write {
        row,
        op: WriteOp::Upsert,
        conflicted,
    }
}

fn build_row(
    source: &Row,
    existing: Option<&Row>,
    key_field: &str,
    strategy: ConflictStrategy,
    overrides: &[FieldOverride],
) -> Row {
    let mut out = Row::new();
    for (field, value) in source {
        if field == key_field {
            out.insert(field.clone(), value.clone());
            continue;
        }
        if let Some(resolved) = resolve_field(field, value, existing, strategy, overrides) {
            out.insert(field.clone(), resolved);
        }
    }
    out
}

/// Fields an `error`-strategy row would overwrite with a different value.
fn differing_fields(
    source: &Row,
    existing: &Row,
    key_field: &str,
    overrides: &[FieldOverride],
) -> Vec<String> {
    source
        .iter()
        .filter(|(field, _)| field.as_str() != key_field)
        .filter(|(field, _)| {
            find_override(overrides, field).is_none_or(|o| o.strategy == FieldConflictStrategy::Overwrite)
        })
        .filter(|(field, value)| existing.get(*field).is_some_and(|v| !values_equal(v, value)))
        .map(|(field, _)| field.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn override_for(field: &str, strategy: FieldConflictStrategy) -> FieldOverride {
        FieldOverride {
            target_field: field.into(),
            strategy,
            merge_expression: None,
        }
    }

    #[test]
    fn overwrite_replaces_existing_values() {
        let source = row(json!({"k": 1, "name": "new", "qty": 2}));
        let existing = row(json!({"k": 1, "name": "old", "qty": 2}));
        let res = resolve(&source, Some(&existing), "k", ConflictStrategy::Overwrite, &[]);
        assert_eq!(
            res,
            Resolution::Write {
                row: source.clone(),
                op: WriteOp::Upsert,
                conflicted: true
            }
        );
    }

    #[test]
    fn merge_with_preserve_override_keeps_existing_status() {
        let source = row(json!({"k": 1, "status": "pending", "owner": "amy"}));
        let existing = row(json!({"k": 1, "status": "done", "owner": "bob"}));
        let overrides = [override_for("status", FieldConflictStrategy::Preserve)];
        let res = resolve(&source, Some(&existing), "k", ConflictStrategy::Merge, &overrides);
        let Resolution::Write { row: written, .. } = res else {
            panic!("expected write");
        };
        assert_eq!(written["status"], json!("done"));
        assert_eq!(written["owner"], json!("amy"));
    }

    #[test]
    fn merge_default_keeps_existing_when_source_is_blank() {
        let source = row(json!({"k": 1, "note": null, "qty": 5}));
        let existing = row(json!({"k": 1, "note": "keep", "qty": 1}));
        let res = resolve(&source, Some(&existing), "k", ConflictStrategy::Merge, &[]);
        let Resolution::Write { row: written, .. } = res else {
            panic!("expected write");
        };
        assert_eq!(written["note"], json!("keep"));
        assert_eq!(written["qty"], json!(5));
    }

    #[test]
    fn merge_override_evaluates_expression() {
        let source = row(json!({"k": 1, "qty": 3}));
        let existing = row(json!({"k": 1, "qty": 7}));
        let overrides = [FieldOverride {
            target_field: "qty".into(),
            strategy: FieldConflictStrategy::Merge,
            merge_expression: Some(MergeExpr::Sum),
        }];
        let res = resolve(&source, Some(&existing), "k", ConflictStrategy::Overwrite, &overrides);
        let Resolution::Write { row: written, .. } = res else {
            panic!("expected write");
        };
        assert_eq!(written["qty"], json!(10));
    }

    #[test]
    fn skip_override_omits_field() {
        let source = row(json!({"k": 1, "a": 1, "b": 2}));
        let overrides = [override_for("b", FieldConflictStrategy::Skip)];
        let res = resolve(&source, None, "k", ConflictStrategy::Overwrite, &overrides);
        let Resolution::Write { row: written, .. } = res else {
            panic!("expected write");
        };
        assert!(!written.contains_key("b"));
        assert_eq!(written["k"], json!(1));
    }

    #[test]
    fn all_fields_skipped_means_no_write() {
        let source = row(json!({"k": 1, "a": 1}));
        let overrides = [override_for("a", FieldConflictStrategy::Skip)];
        let res = resolve(&source, None, "k", ConflictStrategy::Overwrite, &overrides);
        assert_eq!(
            res,
            Resolution::Skip {
                reason: SkipReason::NoChanges
            }
        );
    }

    #[test]
    fn append_always_inserts() {
        let source = row(json!({"k": 1, "a": 1}));
        let existing = row(json!({"k": 1, "a": 0}));
        let res = resolve(&source, Some(&existing), "k", ConflictStrategy::Append, &[]);
        assert!(matches!(res, Resolution::Write { op: WriteOp::Insert, conflicted: false, .. }));
    }

    #[test]
    fn ignore_skips_existing_and_inserts_new() {
        let source = row(json!({"k": 1, "a": 1}));
        let existing = row(json!({"k": 1, "a": 0}));
        assert_eq!(
            resolve(&source, Some(&existing), "k", ConflictStrategy::Ignore, &[]),
            Resolution::Skip {
                reason: SkipReason::Exists
            }
        );
        assert!(matches!(
            resolve(&source, None, "k", ConflictStrategy::Ignore, &[]),
            Resolution::Write { op: WriteOp::Upsert, .. }
        ));
    }

    #[test]
    fn error_strategy_reports_differing_fields() {
        let source = row(json!({"k": 1, "a": 1, "b": "x"}));
        let existing = row(json!({"k": 1, "a": 2, "b": "x"}));
        assert_eq!(
            resolve(&source, Some(&existing), "k", ConflictStrategy::Error, &[]),
            Resolution::Conflict {
                fields: vec!["a".into()]
            }
        );
    }

    #[test]
    fn error_strategy_ignores_preserved_fields_and_equal_rows() {
        let source = row(json!({"k": 1, "a": 1.0, "b": "new"}));
        let existing = row(json!({"k": 1, "a": 1, "b": "old"}));
        let overrides = [override_for("b", FieldConflictStrategy::Preserve)];
        let res = resolve(&source, Some(&existing), "k", ConflictStrategy::Error, &overrides);
        let Resolution::Write { row: written, conflicted, .. } = res else {
            panic!("expected write");
        };
        assert_eq!(written["b"], json!("old"));
        assert!(!conflicted);
    }

    #[test]
    fn resolution_is_deterministic() {
        let source = row(json!({"k": 9, "a": "x", "n": 4}));
        let existing = row(json!({"k": 9, "a": "y", "n": 6}));
        let overrides = [FieldOverride {
            target_field: "n".into(),
            strategy: FieldConflictStrategy::Merge,
            merge_expression: Some(MergeExpr::Max),
        }];
        for strategy in [
            ConflictStrategy::Overwrite,
            ConflictStrategy::Append,
            ConflictStrategy::Ignore,
            ConflictStrategy::Merge,
            ConflictStrategy::Skip,
            ConflictStrategy::Error,
        ] {
            let first = resolve(&source, Some(&existing), "k", strategy, &overrides);
            let second = resolve(&source, Some(&existing), "k", strategy, &overrides);
            assert_eq!(first, second);
        }
    }
}
