//! Error types for chanidx

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("CAS mismatch on key: {0}")]
    CasMismatch(String),

    #[error("CAS retries exhausted for {key} after {attempts} attempts")]
    CasRetriesExhausted { key: String, attempts: u32 },

    #[error("Index error: {0}")]
    Index(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Invalid channel name: {0:?}")]
    InvalidChannel(String),

    #[error("Invalid vbucket: {0}")]
    InvalidVbucket(u16),

    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    #[error("Change index is not initialized")]
    NotInitialized,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn storage(msg: impl Into<String>) -> Self {
        Error::Storage(msg.into())
    }

    pub fn index(msg: impl Into<String>) -> Self {
        Error::Index(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Error::Decode(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_cas_mismatch(&self) -> bool {
        matches!(self, Error::CasMismatch(_))
    }
}
