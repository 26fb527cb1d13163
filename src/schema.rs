//! Explicit field schema for models.
//!
//! A [`Schema`] lists the fields of a model with their semantic type, an
//! optional default and which one is the identity field. The model layer
//! consults it for every conversion between typed values and wire documents:
//! the identity field is renamed to and from the store's `_id`, identity
//! values in filters are normalized to the native form, and incoming
//! documents are defaulted and type-checked before deserialization.

use crate::core::document::type_name;
use crate::core::{Document, ObjectId, OdmError, Result};
use crate::store::ID_FIELD;
use chrono::DateTime;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

/// Default name of the identity field in code.
pub const DEFAULT_IDENTITY: &str = "id";

lazy_static! {
    static ref FIELD_NAME: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Any,
    String,
    Int,
    Float,
    Bool,
    ObjectId,
    /// RFC 3339 timestamp string
    DateTime,
    Document,
    Array,
}

impl FieldKind {
    fn accepts(self, value: &Value) -> bool {
        match self {
            Self::Any => true,
            Self::String => value.is_string(),
            Self::Int => value.is_i64() || value.is_u64(),
            Self::Float => value.is_number(),
            Self::Bool => value.is_boolean(),
            Self::ObjectId => ObjectId::from_value(value).is_ok(),
            Self::DateTime => value
                .as_str()
                .is_some_and(|s| DateTime::parse_from_rfc3339(s).is_ok()),
            Self::Document => value.is_object(),
            Self::Array => value.is_array(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    pub name: String,
    pub kind: FieldKind,
    pub default: Option<Value>,
    pub nullable: bool,
    pub identity: bool,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            default: None,
            nullable: false,
            identity: false,
        }
    }

    /// The identity field: an optional `ObjectId` stored as `_id`.
    pub fn identity(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::ObjectId,
            default: None,
            nullable: true,
            identity: true,
        }
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    fields: Vec<FieldDef>,
}

impl Schema {
    /// Schema with only the default identity field.
    pub fn new() -> Self {
        Self {
            fields: vec![FieldDef::identity(DEFAULT_IDENTITY)],
        }
    }

    /// Schema without any fields, not even the identity.
    pub fn empty() -> Self {
        Self { fields: Vec::new() }
    }

    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn get(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn identity_field(&self) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.identity)
    }

    /// Name of the identity field in code.
    pub fn identity_name(&self) -> &str {
        self.identity_field()
            .map(|f| f.name.as_str())
            .unwrap_or(DEFAULT_IDENTITY)
    }

    /// Check the declaration itself.
    pub fn validate(&self) -> Result<()> {
        let identities: Vec<&FieldDef> = self.fields.iter().filter(|f| f.identity).collect();
        match identities.as_slice() {
            [identity] => {
                if identity.kind != FieldKind::ObjectId || identity.default.is_some() {
                    return Err(OdmError::InvalidModel(format!(
                        "identity field '{}' must be an ObjectId without a default",
                        identity.name
                    )));
                }
            }
            [] => {
                return Err(OdmError::InvalidModel("schema has no identity field".into()));
            }
            _ => {
                return Err(OdmError::InvalidModel(
                    "schema declares more than one identity field".into(),
                ));
            }
        }

        for (i, field) in self.fields.iter().enumerate() {
            if !FIELD_NAME.is_match(&field.name) || field.name == ID_FIELD {
                return Err(OdmError::InvalidModel(format!(
                    "invalid field name '{}'",
                    field.name
                )));
            }
            if self.fields[..i].iter().any(|f| f.name == field.name) {
                return Err(OdmError::InvalidModel(format!(
                    "field '{}' declared twice",
                    field.name
                )));
            }
            if let Some(default) = &field.default
                && !field.kind.accepts(default)
            {
                return Err(OdmError::InvalidModel(format!(
                    "default of field '{}' is not a valid {:?}",
                    field.name, field.kind
                )));
            }
        }
        Ok(())
    }

    /// Type-check declared fields of a code-side document.
    pub fn validate_document(&self, doc: &Document) -> Result<()> {
        for field in &self.fields {
            match doc.get(&field.name) {
                None if field.identity || field.nullable || field.default.is_some() => {}
                None => {
                    return Err(OdmError::Validation(format!(
                        "missing required field '{}'",
                        field.name
                    )));
                }
                Some(Value::Null) if field.nullable => {}
                Some(value) if field.kind.accepts(value) => {}
                Some(value) => {
                    return Err(OdmError::Validation(format!(
                        "field '{}' expected {:?}, got {}",
                        field.name,
                        field.kind,
                        type_name(value)
                    )));
                }
            }
        }
        Ok(())
    }

    /// Code-side document to wire document, identity removed.
    pub fn to_wire(&self, mut doc: Document) -> Result<Document> {
        doc.remove(self.identity_name());
        doc.remove(ID_FIELD);
        Ok(doc)
    }

    /// Wire document to code-side document: `_id` renamed, defaults filled, types checked.
    pub fn from_wire(&self, mut doc: Document) -> Result<Document> {
        if let Some(raw) = doc.remove(ID_FIELD) {
            let id = ObjectId::from_value(&raw)?;
            doc.insert(self.identity_name().to_string(), Value::String(id.to_hex()));
        }
        for field in &self.fields {
            if !doc.contains_key(&field.name)
                && let Some(default) = &field.default
            {
                doc.insert(field.name.clone(), default.clone());
            }
        }
        self.validate_document(&doc)?;
        Ok(doc)
    }

    /// Translate a code-side filter: the identity field becomes `_id` in native form.
    pub fn filter_to_wire(&self, filter: Document) -> Result<Document> {
        let identity = self.identity_name();
        let mut out = Document::new();
        for (key, value) in filter {
            match key.as_str() {
                "$and" | "$or" | "$nor" => {
                    let Value::Array(branches) = value else {
                        return Err(OdmError::Validation(format!("{} expects an array", key)));
                    };
                    let branches = branches
                        .into_iter()
                        .map(|branch| match branch {
                            Value::Object(map) => self.filter_to_wire(map).map(Value::Object),
                            other => Err(OdmError::Validation(format!(
                                "{} branches must be objects, got {}",
                                key,
                                type_name(&other)
                            ))),
                        })
                        .collect::<Result<Vec<_>>>()?;
                    out.insert(key, Value::Array(branches));
                }
                k if k == identity || k == ID_FIELD => {
                    out.insert(ID_FIELD.to_string(), native_id_condition(value)?);
                }
                _ => {
                    out.insert(key, value);
                }
            }
        }
        Ok(out)
    }
}

impl Default for Schema {
    fn default() -> Self {
        Self::new()
    }
}

/// Normalize an identity condition: plain ids, `$in`-style lists and comparison operands.
fn native_id_condition(value: Value) -> Result<Value> {
    let is_operator = match &value {
        Value::Object(map) => {
            !map.is_empty() && !ObjectId::is_native(&value) && map.keys().all(|k| k.starts_with('$'))
        }
        _ => false,
    };

    match value {
        Value::Object(map) if is_operator => {
            let mut ops = Document::new();
            for (op, operand) in map {
                let operand = match (op.as_str(), operand) {
                    ("$exists", operand) => operand,
                    (_, Value::Array(items)) => Value::Array(
                        items
                            .iter()
                            .map(|item| ObjectId::from_value(item).map(|id| id.to_native()))
                            .collect::<Result<Vec<_>>>()?,
                    ),
                    (_, operand) => ObjectId::from_value(&operand)?.to_native(),
                };
                ops.insert(op, operand);
            }
            Ok(Value::Object(ops))
        }
        other => Ok(ObjectId::from_value(&other)?.to_native()),
    }
}
