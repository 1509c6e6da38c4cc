//! Path addressing over `serde_json::Value` trees.
//!
//! A path is a `/`-delimited list of segments. A segment that parses as a
//! non-negative integer selects a position when the container is a sequence;
//! inside a mapping every segment is a plain key.

use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("index {index} out of range (len {len}) at `{path}`")]
    IndexOutOfRange {
        path: String,
        index: usize,
        len: usize,
    },
    #[error("parent of `{path}` does not exist")]
    MissingParent { path: String },
    #[error("`{path}` is a scalar and cannot hold children")]
    NotAContainer { path: String },
}

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn as_index(segment: &str) -> Option<usize> {
    if segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    segment.parse().ok()
}

fn joined(parts: &[&str]) -> String {
    parts.join("/")
}

fn step<'a>(
    node: &'a Value,
    segment: &str,
    walked: &[&str],
) -> Result<Option<&'a Value>, PathError> {
    match node {
        Value::Object(map) => Ok(map.get(segment)),
        Value::Array(items) => {
            let Some(index) = as_index(segment) else {
                return Ok(None);
            };
            match items.get(index) {
                Some(v) => Ok(Some(v)),
                None => Err(PathError::IndexOutOfRange {
                    path: joined(walked),
                    index,
                    len: items.len(),
                }),
            }
        }
        _ => Ok(None),
    }
}

fn step_mut<'a>(
    node: &'a mut Value,
    segment: &str,
    walked: &[&str],
) -> Result<Option<&'a mut Value>, PathError> {
    match node {
        Value::Object(map) => Ok(map.get_mut(segment)),
        Value::Array(items) => {
            let Some(index) = as_index(segment) else {
                return Ok(None);
            };
            let len = items.len();
            match items.get_mut(index) {
                Some(v) => Ok(Some(v)),
                None => Err(PathError::IndexOutOfRange {
                    path: joined(walked),
                    index,
                    len,
                }),
            }
        }
        _ => Ok(None),
    }
}

pub fn get<'a>(root: &'a Value, path: &str) -> Result<Option<&'a Value>, PathError> {
    let parts = segments(path);
    let mut cursor = root;
    for (i, segment) in parts.iter().enumerate() {
        match step(cursor, segment, &parts[..=i])? {
            Some(next) => cursor = next,
            None => return Ok(None),
        }
    }
    Ok(Some(cursor))
}

pub fn get_mut<'a>(root: &'a mut Value, path: &str) -> Result<Option<&'a mut Value>, PathError> {
    let parts = segments(path);
    let mut cursor = root;
    for (i, segment) in parts.iter().enumerate() {
        match step_mut(cursor, segment, &parts[..=i])? {
            Some(next) => cursor = next,
            None => return Ok(None),
        }
    }
    Ok(Some(cursor))
}

/// Write `value` at `path`. The parent container must already exist.
pub fn set(root: &mut Value, path: &str, value: Value) -> Result<(), PathError> {
    let parts = segments(path);
    let Some((last, parent_parts)) = parts.split_last() else {
        *root = value;
        return Ok(());
    };
    let parent_path = joined(parent_parts);
    let Some(parent) = get_mut(root, &parent_path)? else {
        return Err(PathError::MissingParent {
            path: joined(&parts),
        });
    };
    match parent {
        Value::Object(map) => {
            map.insert((*last).to_string(), value);
            Ok(())
        }
        Value::Array(items) => {
            let Some(index) = as_index(last) else {
                return Err(PathError::NotAContainer { path: parent_path });
            };
            let len = items.len();
            if index < len {
                items[index] = value;
            } else if index == len {
                items.push(value);
            } else {
                return Err(PathError::IndexOutOfRange {
                    path: joined(&parts),
                    index,
                    len,
                });
            }
            Ok(())
        }
        _ => Err(PathError::NotAContainer { path: parent_path }),
    }
}

/// Create every missing mapping node along `path`. Sequences are traversed,
/// never created.
pub fn ensure_path(root: &mut Value, path: &str) -> Result<(), PathError> {
    let parts = segments(path);
    let mut cursor = root;
    for (i, segment) in parts.iter().enumerate() {
        let walked = &parts[..=i];
        cursor = match cursor {
            Value::Object(map) => map
                .entry((*segment).to_string())
                .or_insert_with(|| Value::Object(Map::new())),
            Value::Array(items) => {
                let Some(index) = as_index(segment) else {
                    return Err(PathError::NotAContainer {
                        path: joined(&parts[..i]),
                    });
                };
                let len = items.len();
                items.get_mut(index).ok_or(PathError::IndexOutOfRange {
                    path: joined(walked),
                    index,
                    len,
                })?
            }
            _ => {
                return Err(PathError::NotAContainer {
                    path: joined(&parts[..i]),
                });
            }
        };
    }
    Ok(())
}

/// Remove the value at `path` from its parent. Returns false when nothing was
/// there to remove.
pub fn delete(root: &mut Value, path: &str) -> bool {
    let parts = segments(path);
    let Some((last, parent_parts)) = parts.split_last() else {
        return false;
    };
    let Ok(Some(parent)) = get_mut(root, &joined(parent_parts)) else {
        return false;
    };
    match parent {
        Value::Object(map) => map.remove(*last).is_some(),
        Value::Array(items) => match as_index(last) {
            Some(index) if index < items.len() => {
                items.remove(index);
                true
            }
            _ => false,
        },
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "testroot": {
                "testroot1": [{"list1": 1}, {"list2": 2}],
                "testroot2": "foo"
            }
        })
    }

    #[test]
    fn get_walks_mappings_and_sequences() {
        let root = sample();
        assert_eq!(
            get(&root, "testroot/testroot1/1/list2").expect("get"),
            Some(&json!(2))
        );
        assert_eq!(
            get(&root, "/testroot/testroot2/").expect("get"),
            Some(&json!("foo"))
        );
        assert_eq!(get(&root, "notreal").expect("get"), None);
        assert_eq!(get(&root, "testroot/notreal/deeper").expect("get"), None);
        assert_eq!(get(&root, "testroot/testroot2/deeper").expect("get"), None);
    }

    #[test]
    fn get_rejects_out_of_range_index() {
        let root = sample();
        let err = get(&root, "testroot/testroot1/5").expect_err("out of range");
        assert!(matches!(err, PathError::IndexOutOfRange { index: 5, len: 2, .. }));
    }

    #[test]
    fn set_then_get_returns_value() {
        let mut root = sample();
        set(&mut root, "newroot", json!({"newroot1": "bar"})).expect("set");
        assert_eq!(
            get(&root, "newroot/newroot1").expect("get"),
            Some(&json!("bar"))
        );
        set(&mut root, "testroot/testroot1/1/list2", json!(3)).expect("set in seq");
        assert_eq!(
            get(&root, "testroot/testroot1/1/list2").expect("get"),
            Some(&json!(3))
        );
    }

    #[test]
    fn set_requires_existing_parent() {
        let mut root = sample();
        let err = set(&mut root, "missing/child", json!(1)).expect_err("no parent");
        assert!(matches!(err, PathError::MissingParent { .. }));
        let err = set(&mut root, "testroot/testroot2/child", json!(1)).expect_err("scalar");
        assert!(matches!(err, PathError::NotAContainer { .. }));
    }

    #[test]
    fn set_appends_at_sequence_end_but_never_leaves_holes() {
        let mut root = sample();
        set(&mut root, "testroot/testroot1/2", json!("tail")).expect("append");
        assert_eq!(
            get(&root, "testroot/testroot1/2").expect("get"),
            Some(&json!("tail"))
        );
        let err = set(&mut root, "testroot/testroot1/7", json!("gap")).expect_err("gap");
        assert!(matches!(err, PathError::IndexOutOfRange { index: 7, .. }));
    }

    #[test]
    fn ensure_path_creates_nested_mappings() {
        let mut root = sample();
        ensure_path(&mut root, "a/b/c").expect("ensure");
        assert_eq!(get(&root, "a/b/c").expect("get"), Some(&json!({})));
        set(&mut root, "a/b/c", json!("baz")).expect("set");
        ensure_path(&mut root, "a/b").expect("ensure existing");
        assert_eq!(get(&root, "a/b/c").expect("get"), Some(&json!("baz")));
    }

    #[test]
    fn ensure_path_does_not_create_sequence_slots() {
        let mut root = sample();
        ensure_path(&mut root, "testroot/testroot1/0/extra").expect("inside seq");
        assert_eq!(
            get(&root, "testroot/testroot1/0/extra").expect("get"),
            Some(&json!({}))
        );
        let err = ensure_path(&mut root, "testroot/testroot1/4/extra").expect_err("oob");
        assert!(matches!(err, PathError::IndexOutOfRange { .. }));
    }

    #[test]
    fn delete_is_idempotent() {
        let mut root = sample();
        set(&mut root, "testroot/extra", json!("x")).expect("set");
        assert!(delete(&mut root, "testroot/extra"));
        let once = root.clone();
        assert!(!delete(&mut root, "testroot/extra"));
        assert_eq!(root, once);
        assert_eq!(root, sample());
    }

    #[test]
    fn delete_ignores_unresolvable_paths() {
        let mut root = sample();
        assert!(!delete(&mut root, "testroot/testroot1/9"));
        assert!(!delete(&mut root, "nothing/here"));
        assert!(delete(&mut root, "testroot/testroot1/0"));
        assert_eq!(
            get(&root, "testroot/testroot1").expect("get"),
            Some(&json!([{"list2": 2}]))
        );
    }
}
