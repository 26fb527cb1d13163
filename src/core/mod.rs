pub mod document;
pub mod error;
pub mod object_id;

pub use document::{Document, into_document};
pub use error::{OdmError, Result};
pub use object_id::ObjectId;
