//! Pipeline configuration errors.

use opt8_ir::InvalidInvariant;
use thiserror::Error;

/// Configuration rejected before any analysis starts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown pass `{0}`")]
    UnknownPass(String),

    #[error("invalid option `{option}` for pass `{pass}`: {reason}")]
    InvalidPassOption {
        pass: String,
        option: String,
        reason: String,
    },

    #[error(transparent)]
    InvalidInvariant(#[from] InvalidInvariant),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
