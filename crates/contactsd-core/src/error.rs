use crate::roster_cache::CacheError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation {0}")]
    Validation(String),
    #[error("connection {0}")]
    Connection(String),
    #[error("cache")]
    Cache(#[from] CacheError),
    #[error("storage {0}")]
    Storage(String),
    #[error("io")]
    Io(#[from] std::io::Error),
    #[error("no backend available for {0}")]
    NoBackendAvailable(String),
    #[error("account {0} already registered")]
    DuplicateAccount(String),
    #[error("not found")]
    NotFound,
    #[error("closed")]
    Closed,
}

impl From<contactsd_api::ValidationError> for CoreError {
    fn from(err: contactsd_api::ValidationError) -> Self {
        CoreError::Validation(err.to_string())
    }
}
