use thiserror::Error;

pub const MAX_ACCOUNT_PATH_LEN: usize = 512;
pub const MAX_PROTOCOL_ID_LEN: usize = 1024;

/// Joins an account path and a protocol contact id. Never valid inside an
/// account path, which keeps `account!contact` injective.
pub const IDENTITY_SEPARATOR: char = '!';

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("empty field {0}")]
    Empty(&'static str),
    #[error("too long {0}")]
    TooLong(&'static str),
    #[error("invalid character in {0}")]
    InvalidChar(&'static str),
}

pub fn validate_account_path(path: &str) -> Result<(), ValidationError> {
    if path.trim().is_empty() {
        return Err(ValidationError::Empty("account_path"));
    }
    if path.len() > MAX_ACCOUNT_PATH_LEN {
        return Err(ValidationError::TooLong("account_path"));
    }
    if path
        .chars()
        .any(|c| c == IDENTITY_SEPARATOR || c.is_whitespace() || c.is_control())
    {
        return Err(ValidationError::InvalidChar("account_path"));
    }
    Ok(())
}

pub fn validate_protocol_id(id: &str) -> Result<(), ValidationError> {
    if id.is_empty() {
        return Err(ValidationError::Empty("protocol_id"));
    }
    if id.len() > MAX_PROTOCOL_ID_LEN {
        return Err(ValidationError::TooLong("protocol_id"));
    }
    if id.chars().any(|c| c.is_control()) {
        return Err(ValidationError::InvalidChar("protocol_id"));
    }
    Ok(())
}
