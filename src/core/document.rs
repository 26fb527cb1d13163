//! Documents and dotted field paths.

use super::error::{OdmError, Result};
use serde_json::{Map, Value};

/// A document as exchanged with the store.
pub type Document = Map<String, Value>;

/// Convert a JSON value into a document, rejecting non-objects.
pub fn into_document(value: Value) -> Result<Document> {
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Document::new()),
        other => Err(OdmError::InvalidDocument(format!(
            "expected an object, got {}",
            type_name(&other)
        ))),
    }
}

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Join a prefix and a key into a dotted path.
pub fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", prefix, key)
    }
}

/// Look up a dotted path. Numeric segments index into arrays.
pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = doc.get(first)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Set a dotted path, creating intermediate objects as needed.
pub fn set_path(doc: &mut Document, path: &str, value: Value) -> Result<()> {
    let (parents, last) = split_path(path)?;
    let mut current = doc;
    for segment in parents {
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        current = match entry {
            Value::Object(map) => map,
            other => {
                return Err(OdmError::InvalidOperation(format!(
                    "cannot create field '{}' inside {} at '{}'",
                    last,
                    type_name(other),
                    path
                )));
            }
        };
    }
    current.insert(last.to_string(), value);
    Ok(())
}

/// Remove a dotted path. Missing intermediate fields are not an error.
pub fn remove_path(doc: &mut Document, path: &str) -> Result<Option<Value>> {
    let (parents, last) = split_path(path)?;
    let mut current = doc;
    for segment in parents {
        current = match current.get_mut(segment) {
            Some(Value::Object(map)) => map,
            _ => return Ok(None),
        };
    }
    Ok(current.remove(last))
}

fn split_path(path: &str) -> Result<(Vec<&str>, &str)> {
    let mut segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(OdmError::InvalidOperation(format!(
            "invalid field path '{}'",
            path
        )));
    }
    let last = segments.pop().unwrap_or_default();
    Ok((segments, last))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        into_document(value).unwrap()
    }

    #[test]
    fn test_into_document_rejects_scalars() {
        assert!(into_document(json!(1)).is_err());
        assert!(into_document(json!([1, 2])).is_err());
        assert!(into_document(Value::Null).unwrap().is_empty());
    }

    #[test]
    fn test_get_path_walks_objects_and_arrays() {
        let d = doc(json!({"a": {"b": [10, {"c": 3}]}}));
        assert_eq!(get_path(&d, "a.b.0"), Some(&json!(10)));
        assert_eq!(get_path(&d, "a.b.1.c"), Some(&json!(3)));
        assert_eq!(get_path(&d, "a.x"), None);
    }

    #[test]
    fn test_set_path_creates_parents() {
        let mut d = doc(json!({"a": 1}));
        set_path(&mut d, "b.c.d", json!(true)).unwrap();
        assert_eq!(Value::Object(d), json!({"a": 1, "b": {"c": {"d": true}}}));
    }

    #[test]
    fn test_set_path_through_scalar_fails() {
        let mut d = doc(json!({"a": 1}));
        assert!(set_path(&mut d, "a.b", json!(2)).is_err());
        assert!(set_path(&mut d, "a..b", json!(2)).is_err());
    }

    #[test]
    fn test_remove_path() {
        let mut d = doc(json!({"a": {"b": 1, "c": 2}}));
        assert_eq!(remove_path(&mut d, "a.b").unwrap(), Some(json!(1)));
        assert_eq!(remove_path(&mut d, "x.y").unwrap(), None);
        assert_eq!(Value::Object(d), json!({"a": {"c": 2}}));
    }
}
