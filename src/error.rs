//! Error types for PMD controller operations

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PmdError>;

#[derive(Error, Debug)]
pub enum PmdError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("No reply to '{request}' within {timeout:?}")]
    Timeout { request: String, timeout: Duration },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Controller rejected '{request}': {reply}")]
    HardwareRejected { request: String, reply: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl PmdError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, PmdError::Timeout { .. })
    }

    /// True for failures that leave the transport unusable.
    pub fn is_connection(&self) -> bool {
        matches!(self, PmdError::Connection(_) | PmdError::Io(_))
    }
}
