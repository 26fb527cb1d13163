//! Minimal nested-field change sets between two document snapshots.
//!
//! The result maps dotted field paths to the values they must be set to so
//! that `previous` becomes `current`. Keys that disappeared from `current`
//! are not reported; a change set built here can only add or modify fields.

use crate::core::document::join_path;
use crate::core::Document;
use serde_json::Value;

/// Compute the `$set`-style change set that evolves `previous` into `current`.
pub fn diff(previous: &Document, current: &Document) -> Document {
    let mut changes = Document::new();
    diff_into(previous, current, "", &mut changes);
    changes
}

fn diff_into(previous: &Document, current: &Document, prefix: &str, changes: &mut Document) {
    for (key, new_value) in current {
        let path = join_path(prefix, key);
        match (previous.get(key), new_value) {
            (None, _) => {
                changes.insert(path, new_value.clone());
            }
            (Some(Value::Object(old)), Value::Object(new)) => {
                diff_into(old, new, &path, changes);
            }
            (Some(old_value), _) if old_value != new_value => {
                changes.insert(path, new_value.clone());
            }
            _ => {}
        }
    }
}
