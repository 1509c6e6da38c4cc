//! Structural comparison of canonical trees.
//!
//! Mappings compare by key set and then per key, so key order never matters.
//! Sequences compare by length and then index by index, so reordering is a
//! difference. `equal` and `report` share one walker and always agree.

use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::ops::ControlFlow;

const PREVIEW_CHARS: usize = 44;

#[derive(Debug, Clone, PartialEq)]
pub enum DiffKind {
    TypeChanged { before: Value, after: Value },
    ValueChanged { before: Value, after: Value },
    Removed { value: Value },
    Added { value: Value },
    LengthChanged { before: usize, after: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Difference {
    pub path: String,
    pub kind: DiffKind,
}

fn type_label(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}

fn preview(value: &Value) -> String {
    let raw = value.to_string();
    crate::sync::util::truncate_with_ellipsis(&raw, PREVIEW_CHARS)
}

impl fmt::Display for Difference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = if self.path.is_empty() {
            "/"
        } else {
            self.path.as_str()
        };
        match &self.kind {
            DiffKind::TypeChanged { before, after } => write!(
                f,
                "--- {path} < {} {} > {} {}",
                type_label(before),
                preview(before),
                type_label(after),
                preview(after)
            ),
            DiffKind::ValueChanged { before, after } => {
                write!(f, "--- {path} < {} > {}", preview(before), preview(after))
            }
            DiffKind::Removed { value } => write!(f, "--- {path} - {}", preview(value)),
            DiffKind::Added { value } => write!(f, "--- {path} + {}", preview(value)),
            DiffKind::LengthChanged { before, after } => {
                write!(f, "--- {path} length {before} -> {after}")
            }
        }
    }
}

fn child(path: &str, segment: &str) -> String {
    if path.is_empty() {
        segment.to_string()
    } else {
        format!("{path}/{segment}")
    }
}

fn same_kind(a: &Value, b: &Value) -> bool {
    std::mem::discriminant(a) == std::mem::discriminant(b)
}

fn walk(
    a: &Value,
    b: &Value,
    path: &str,
    emit: &mut dyn FnMut(Difference) -> ControlFlow<()>,
) -> ControlFlow<()> {
    if !same_kind(a, b) {
        return emit(Difference {
            path: path.to_string(),
            kind: DiffKind::TypeChanged {
                before: a.clone(),
                after: b.clone(),
            },
        });
    }
    match (a, b) {
        (Value::Object(left), Value::Object(right)) => {
            let left_keys: BTreeSet<&String> = left.keys().collect();
            let right_keys: BTreeSet<&String> = right.keys().collect();
            for key in left_keys.difference(&right_keys) {
                emit(Difference {
                    path: child(path, key),
                    kind: DiffKind::Removed {
                        value: left[*key].clone(),
                    },
                })?;
            }
            for key in right_keys.difference(&left_keys) {
                emit(Difference {
                    path: child(path, key),
                    kind: DiffKind::Added {
                        value: right[*key].clone(),
                    },
                })?;
            }
            for key in left_keys.intersection(&right_keys) {
                walk(&left[*key], &right[*key], &child(path, key), emit)?;
            }
            ControlFlow::Continue(())
        }
        (Value::Array(left), Value::Array(right)) => {
            if left.len() != right.len() {
                emit(Difference {
                    path: path.to_string(),
                    kind: DiffKind::LengthChanged {
                        before: left.len(),
                        after: right.len(),
                    },
                })?;
            }
            for (i, (x, y)) in left.iter().zip(right.iter()).enumerate() {
                walk(x, y, &child(path, &i.to_string()), emit)?;
            }
            for (i, extra) in left.iter().enumerate().skip(right.len()) {
                emit(Difference {
                    path: child(path, &i.to_string()),
                    kind: DiffKind::Removed {
                        value: extra.clone(),
                    },
                })?;
            }
            for (i, extra) in right.iter().enumerate().skip(left.len()) {
                emit(Difference {
                    path: child(path, &i.to_string()),
                    kind: DiffKind::Added {
                        value: extra.clone(),
                    },
                })?;
            }
            ControlFlow::Continue(())
        }
        _ => {
            // serde_json keeps integer and float numbers apart, so 1 != 1.0.
            if a == b {
                ControlFlow::Continue(())
            } else {
                emit(Difference {
                    path: path.to_string(),
                    kind: DiffKind::ValueChanged {
                        before: a.clone(),
                        after: b.clone(),
                    },
                })
            }
        }
    }
}

/// Quiet mode: stops at the first difference.
pub fn equal(a: &Value, b: &Value) -> bool {
    let mut found = false;
    let _ = walk(a, b, "", &mut |_| {
        found = true;
        ControlFlow::Break(())
    });
    !found
}

/// Verbose mode: every difference, in walk order.
pub fn report(a: &Value, b: &Value) -> Vec<Difference> {
    let mut out = Vec::new();
    let _ = walk(a, b, "", &mut |d| {
        out.push(d);
        ControlFlow::Continue(())
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn every_tree_equals_itself() {
        let trees = [
            json!(null),
            json!("x"),
            json!([1, [2, {"a": [3]}]]),
            json!({"a": {"b": [true, false, 1.5]}, "c": "d"}),
        ];
        for tree in trees {
            assert!(equal(&tree, &tree));
            assert!(report(&tree, &tree).is_empty());
        }
    }

    #[test]
    fn mapping_key_order_is_irrelevant() {
        let a: Value = serde_json::from_str(r#"{"a":1,"b":2}"#).expect("parse");
        let b: Value = serde_json::from_str(r#"{"b":2,"a":1}"#).expect("parse");
        assert!(equal(&a, &b));
    }

    #[test]
    fn sequence_order_matters() {
        assert!(!equal(&json!([1, 2]), &json!([2, 1])));
        let diffs = report(&json!([1, 2]), &json!([2, 1]));
        assert_eq!(diffs.len(), 2);
        assert_eq!(diffs[0].path, "0");
    }

    #[test]
    fn scalars_compare_by_type_and_value() {
        assert!(!equal(&json!(1), &json!("1")));
        assert!(!equal(&json!(1), &json!(1.0)));
        assert!(!equal(&json!(true), &json!(false)));
        assert!(equal(&json!(2.5), &json!(2.5)));
    }

    #[test]
    fn report_lists_removed_and_added_keys_separately() {
        let a = json!({"keep": 1, "gone": "x", "nested": {"v": 1}});
        let b = json!({"keep": 1, "new": "y", "nested": {"v": 2}});
        let diffs = report(&a, &b);
        assert_eq!(diffs.len(), 3);
        assert!(matches!(diffs[0].kind, DiffKind::Removed { .. }));
        assert_eq!(diffs[0].path, "gone");
        assert!(matches!(diffs[1].kind, DiffKind::Added { .. }));
        assert_eq!(diffs[1].path, "new");
        assert_eq!(diffs[2].path, "nested/v");
        assert_eq!(diffs[2].to_string(), "--- nested/v < 1 > 2");
    }

    #[test]
    fn length_change_is_reported_before_elements() {
        let diffs = report(&json!({"l": [1]}), &json!({"l": [1, 2]}));
        assert_eq!(
            diffs[0].kind,
            DiffKind::LengthChanged {
                before: 1,
                after: 2
            }
        );
        assert_eq!(diffs[1].path, "l/1");
        assert!(matches!(diffs[1].kind, DiffKind::Added { .. }));
    }

    #[test]
    fn quiet_and_verbose_agree() {
        let pairs = [
            (json!({"a": [1, 2]}), json!({"a": [1, 2]})),
            (json!({"a": [1, 2]}), json!({"a": [1]})),
            (json!({"a": {"b": "c"}}), json!({"a": ["c"]})),
            (json!([{"x": null}]), json!([{"x": null}])),
        ];
        for (a, b) in pairs {
            assert_eq!(equal(&a, &b), report(&a, &b).is_empty());
        }
    }
}
