//! Declarative secondary index descriptions.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Sort direction of one indexed key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexDirection {
    Ascending,
    Descending,
}

pub const ASC: IndexDirection = IndexDirection::Ascending;
pub const DESC: IndexDirection = IndexDirection::Descending;

impl IndexDirection {
    /// Store representation (`1` / `-1`).
    pub fn as_i32(self) -> i32 {
        match self {
            Self::Ascending => 1,
            Self::Descending => -1,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            1 => Some(Self::Ascending),
            -1 => Some(Self::Descending),
            _ => None,
        }
    }
}

impl fmt::Display for IndexDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_i32())
    }
}

/// Key pattern of an index: one field, or an ordered list of field/direction pairs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexKeys {
    Single(String),
    Compound(Vec<(String, IndexDirection)>),
}

impl IndexKeys {
    /// Normalized key list; a single field is ascending.
    pub fn fields(&self) -> Vec<(String, IndexDirection)> {
        match self {
            Self::Single(field) => vec![(field.clone(), IndexDirection::Ascending)],
            Self::Compound(keys) => keys.clone(),
        }
    }
}

/// Key pattern plus store-specific options such as `unique`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSpec {
    keys: IndexKeys,
    options: BTreeMap<String, Value>,
}

impl IndexSpec {
    /// Index on a single field.
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            keys: IndexKeys::Single(field.into()),
            options: BTreeMap::new(),
        }
    }

    /// Index over an ordered list of fields.
    pub fn compound<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = (S, IndexDirection)>,
        S: Into<String>,
    {
        Self {
            keys: IndexKeys::Compound(
                keys.into_iter()
                    .map(|(field, dir)| (field.into(), dir))
                    .collect(),
            ),
            options: BTreeMap::new(),
        }
    }

    pub fn unique(self, unique: bool) -> Self {
        self.option("unique", Value::Bool(unique))
    }

    pub fn sparse(self, sparse: bool) -> Self {
        self.option("sparse", Value::Bool(sparse))
    }

    /// Explicit index name; otherwise the store derives one from the keys.
    pub fn name(self, name: impl Into<String>) -> Self {
        self.option("name", Value::String(name.into()))
    }

    /// Attach an arbitrary option, passed to the store verbatim.
    pub fn option(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(name.into(), value.into());
        self
    }

    pub fn keys(&self) -> &IndexKeys {
        &self.keys
    }

    pub fn options(&self) -> &BTreeMap<String, Value> {
        &self.options
    }

    pub fn is_unique(&self) -> bool {
        matches!(self.options.get("unique"), Some(Value::Bool(true)))
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self.options.get("sparse"), Some(Value::Bool(true)))
    }

    /// The explicit name, or the conventional `field_dir` join of the keys.
    pub fn index_name(&self) -> String {
        if let Some(Value::String(name)) = self.options.get("name") {
            return name.clone();
        }
        self.default_name()
    }

    pub fn default_name(&self) -> String {
        self.keys
            .fields()
            .iter()
            .map(|(field, dir)| format!("{}_{}", field, dir))
            .collect::<Vec<_>>()
            .join("_")
    }
}
