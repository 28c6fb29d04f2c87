use std::fmt;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StrataError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[error("Decode error: {message}")]
    Decode { message: String },
    #[error("Encode error: {0}")]
    Encode(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Internal invariant violated: {0}")]
    Invariant(String),
    #[error("Lock poisoned: {0}")]
    Lock(String),
}

pub type Result<T> = std::result::Result<T, StrataError>;

impl StrataError {
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode { message: message.into() }
    }
    /// Prefixes decode errors with the identity of the record that failed.
    /// Other variants pass through unchanged.
    pub fn with_context(self, context: impl fmt::Display) -> Self {
        match self {
            Self::Decode { message } => Self::Decode {
                message: format!("{context}: {message}"),
            },
            other => other,
        }
    }
}

// Helper conversions
impl From<rusqlite::Error> for StrataError {
    fn from(e: rusqlite::Error) -> Self { Self::Persistence(e.to_string()) }
}
impl From<config::ConfigError> for StrataError {
    fn from(e: config::ConfigError) -> Self { Self::Config(e.to_string()) }
}
impl From<serde_json::Error> for StrataError {
    fn from(e: serde_json::Error) -> Self { Self::decode(e.to_string()) }
}
