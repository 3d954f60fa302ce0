//! Configuration errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
