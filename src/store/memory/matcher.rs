//! Filter matching, update operators and value ordering for the in-memory store.

use crate::core::document::{get_path, remove_path, set_path, type_name};
use crate::core::{Document, ObjectId, OdmError, Result};
use crate::index::IndexDirection;
use crate::store::ID_FIELD;
use serde_json::{Number, Value};
use std::cmp::Ordering;

/// True if `doc` satisfies every condition in `filter`.
pub fn matches(doc: &Document, filter: &Document) -> Result<bool> {
    for (key, condition) in filter {
        let ok = match key.as_str() {
            "$and" => logical_branches(key, condition)?
                .iter()
                .map(|branch| matches(doc, branch))
                .collect::<Result<Vec<_>>>()?
                .into_iter()
                .all(|m| m),
            "$or" => logical_branches(key, condition)?
                .iter()
                .map(|branch| matches(doc, branch))
                .collect::<Result<Vec<_>>>()?
                .into_iter()
                .any(|m| m),
            "$nor" => !logical_branches(key, condition)?
                .iter()
                .map(|branch| matches(doc, branch))
                .collect::<Result<Vec<_>>>()?
                .into_iter()
                .any(|m| m),
            other if other.starts_with('$') => {
                return Err(OdmError::InvalidOperation(format!(
                    "unknown top-level operator '{}'",
                    other
                )));
            }
            path => field_matches(get_path(doc, path), condition)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn logical_branches<'a>(op: &str, condition: &'a Value) -> Result<Vec<&'a Document>> {
    let Value::Array(items) = condition else {
        return Err(OdmError::InvalidOperation(format!("{} expects an array", op)));
    };
    items
        .iter()
        .map(|item| match item {
            Value::Object(map) => Ok(map),
            other => Err(OdmError::InvalidOperation(format!(
                "{} branches must be objects, got {}",
                op,
                type_name(other)
            ))),
        })
        .collect()
}

fn is_operator_object(value: &Value) -> bool {
    match value {
        Value::Object(map) => {
            !map.is_empty() && !ObjectId::is_native(value) && map.keys().all(|k| k.starts_with('$'))
        }
        _ => false,
    }
}

fn field_matches(actual: Option<&Value>, condition: &Value) -> Result<bool> {
    if !is_operator_object(condition) {
        return Ok(equals_or_contains(actual, condition));
    }

    let Value::Object(ops) = condition else {
        return Ok(false);
    };

    for (op, operand) in ops {
        let ok = match op.as_str() {
            "$eq" => equals_or_contains(actual, operand),
            "$ne" => !equals_or_contains(actual, operand),
            "$gt" => compare_matches(actual, operand, |o| o == Ordering::Greater),
            "$gte" => compare_matches(actual, operand, |o| o != Ordering::Less),
            "$lt" => compare_matches(actual, operand, |o| o == Ordering::Less),
            "$lte" => compare_matches(actual, operand, |o| o != Ordering::Greater),
            "$in" => in_list(op, actual, operand)?,
            "$nin" => !in_list(op, actual, operand)?,
            "$exists" => match operand {
                Value::Bool(expected) => actual.is_some() == *expected,
                other => {
                    return Err(OdmError::InvalidOperation(format!(
                        "$exists expects a bool, got {}",
                        type_name(other)
                    )));
                }
            },
            other => {
                return Err(OdmError::InvalidOperation(format!(
                    "unknown operator '{}'",
                    other
                )));
            }
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn in_list(op: &str, actual: Option<&Value>, operand: &Value) -> Result<bool> {
    let Value::Array(candidates) = operand else {
        return Err(OdmError::InvalidOperation(format!("{} expects an array", op)));
    };
    Ok(candidates
        .iter()
        .any(|candidate| equals_or_contains(actual, candidate)))
}

/// Equality with array membership: `{tags: "x"}` matches `tags: ["x", "y"]`.
/// A missing field equals `null`.
fn equals_or_contains(actual: Option<&Value>, expected: &Value) -> bool {
    match actual {
        None => expected.is_null(),
        Some(value) => {
            if values_equal(value, expected) {
                return true;
            }
            match value {
                Value::Array(items) => items.iter().any(|item| values_equal(item, expected)),
                _ => false,
            }
        }
    }
}

fn compare_matches(
    actual: Option<&Value>,
    operand: &Value,
    accept: impl Fn(Ordering) -> bool,
) -> bool {
    let Some(actual) = actual else {
        return false;
    };
    let check = |value: &Value| {
        comparable(value, operand) && accept(compare_values(value, operand))
    };
    match actual {
        Value::Array(items) => items.iter().any(check),
        value => check(value),
    }
}

/// Range operators only compare values of the same kind.
fn comparable(a: &Value, b: &Value) -> bool {
    matches!(
        (a, b),
        (Value::Number(_), Value::Number(_))
            | (Value::String(_), Value::String(_))
            | (Value::Bool(_), Value::Bool(_))
    ) || (ObjectId::is_native(a) && ObjectId::is_native(b))
}

/// Structural equality where numbers compare by value (`1 == 1.0`).
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => number_cmp(x, y) == Ordering::Equal,
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(xm), Value::Object(ym)) => {
            xm.len() == ym.len()
                && xm
                    .iter()
                    .all(|(k, x)| ym.get(k).is_some_and(|y| values_equal(x, y)))
        }
        _ => a == b,
    }
}

fn number_cmp(x: &Number, y: &Number) -> Ordering {
    if let (Some(a), Some(b)) = (x.as_i64(), y.as_i64()) {
        return a.cmp(&b);
    }
    let a = x.as_f64().unwrap_or(f64::NAN);
    let b = y.as_f64().unwrap_or(f64::NAN);
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Object(_) if ObjectId::is_native(value) => 5,
        Value::Object(_) => 3,
        Value::Array(_) => 4,
        Value::Bool(_) => 6,
    }
}

/// Total order used for sorting: values of different kinds order by kind.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => number_cmp(x, y),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(xs), Value::Array(ys)) => {
            for (x, y) in xs.iter().zip(ys) {
                let ord = compare_values(x, y);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            xs.len().cmp(&ys.len())
        }
        (Value::Object(xm), Value::Object(ym)) => {
            for ((kx, vx), (ky, vy)) in xm.iter().zip(ym) {
                let ord = kx.cmp(ky).then_with(|| compare_values(vx, vy));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            xm.len().cmp(&ym.len())
        }
        _ => Ordering::Equal,
    }
}

/// Compare two documents by a sort specification. Missing fields sort first.
pub fn compare_by(a: &Document, b: &Document, sort: &[(String, IndexDirection)]) -> Ordering {
    for (field, direction) in sort {
        let ord = match (get_path(a, field), get_path(b, field)) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(x), Some(y)) => compare_values(x, y),
        };
        let ord = match direction {
            IndexDirection::Ascending => ord,
            IndexDirection::Descending => ord.reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Apply an operator update in place. Returns whether the document changed.
pub fn apply_update(doc: &mut Document, update: &Document) -> Result<bool> {
    if update.is_empty() {
        return Err(OdmError::InvalidOperation("update document is empty".into()));
    }

    let before = doc.clone();
    for (op, fields) in update {
        let Value::Object(fields) = fields else {
            return Err(OdmError::InvalidOperation(format!(
                "update operator '{}' expects an object",
                op
            )));
        };

        for (path, operand) in fields {
            if path == ID_FIELD || path.starts_with("_id.") {
                return Err(OdmError::InvalidOperation(
                    "the identity field is immutable".into(),
                ));
            }
            match op.as_str() {
                "$set" => set_path(doc, path, operand.clone())?,
                "$unset" => {
                    remove_path(doc, path)?;
                }
                "$inc" => increment(doc, path, operand)?,
                "$push" => push(doc, path, operand)?,
                other if other.starts_with('$') => {
                    return Err(OdmError::InvalidOperation(format!(
                        "unknown update operator '{}'",
                        other
                    )));
                }
                _ => {
                    return Err(OdmError::InvalidOperation(format!(
                        "update document must only contain operators, found '{}'",
                        op
                    )));
                }
            }
        }
    }
    Ok(*doc != before)
}

fn increment(doc: &mut Document, path: &str, operand: &Value) -> Result<()> {
    let Value::Number(delta) = operand else {
        return Err(OdmError::InvalidOperation(format!(
            "$inc on '{}' expects a number, got {}",
            path,
            type_name(operand)
        )));
    };

    let next = match get_path(doc, path) {
        None => Value::Number(delta.clone()),
        Some(Value::Number(current)) => match (current.as_i64(), delta.as_i64()) {
            (Some(a), Some(b)) => Value::from(a.wrapping_add(b)),
            _ => {
                let sum = current.as_f64().unwrap_or(0.0) + delta.as_f64().unwrap_or(0.0);
                Number::from_f64(sum).map(Value::Number).ok_or_else(|| {
                    OdmError::InvalidOperation(format!("$inc on '{}' produced NaN", path))
                })?
            }
        },
        Some(other) => {
            return Err(OdmError::InvalidOperation(format!(
                "cannot $inc non-numeric field '{}' ({})",
                path,
                type_name(other)
            )));
        }
    };
    set_path(doc, path, next)
}

fn push(doc: &mut Document, path: &str, operand: &Value) -> Result<()> {
    let next = match get_path(doc, path) {
        None => Value::Array(vec![operand.clone()]),
        Some(Value::Array(items)) => {
            let mut items = items.clone();
            items.push(operand.clone());
            Value::Array(items)
        }
        Some(other) => {
            return Err(OdmError::InvalidOperation(format!(
                "cannot $push to non-array field '{}' ({})",
                path,
                type_name(other)
            )));
        }
    };
    set_path(doc, path, next)
}

/// Replacement documents are plain field maps.
pub fn validate_replacement(replacement: &Document) -> Result<()> {
    if let Some(op) = replacement.keys().find(|k| k.starts_with('$')) {
        return Err(OdmError::InvalidOperation(format!(
            "replacement document must not contain operators, found '{}'",
            op
        )));
    }
    Ok(())
}
