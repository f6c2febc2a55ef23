use thiserror::Error;

use crate::storage::buffer::BufferPoolError;

#[derive(Error, Debug)]
pub enum BTreeError {
    #[error("Node too large for page")]
    NodeTooLarge,

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Invalid page format")]
    InvalidPageFormat,

    #[error("Header page has no room for index '{0}'")]
    HeaderFull(String),

    #[error("Buffer pool error: {0}")]
    BufferPool(#[from] BufferPoolError),
}
