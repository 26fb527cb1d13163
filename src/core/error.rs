use super::object_id::ObjectId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OdmError {
    #[error("Object of model does not exist")]
    DoesNotExist,

    #[error("Object of model already exists")]
    AlreadyExists,

    #[error("Duplicate key error on collection '{collection}' index '{index}': {key}")]
    DuplicateKey {
        collection: String,
        index: String,
        key: String,
    },

    #[error("No database connected for model '{0}'")]
    NotConnected(String),

    #[error("Invalid model declaration: {0}")]
    InvalidModel(String),

    #[error("Invalid ObjectId: {0}")]
    InvalidObjectId(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("File '{0}' not found in bucket")]
    FileNotFound(ObjectId),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl OdmError {
    /// True for the lookup-miss condition callers are expected to branch on.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::DoesNotExist)
    }

    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, Self::DuplicateKey { .. })
    }
}

pub type Result<T> = std::result::Result<T, OdmError>;
