//! Error types for sandpath
//!
//! Most engine operations never fail outright: missing paths are reported
//! through flags, broken stores degrade to empty trees and bad rules are
//! skipped. The variants below cover what is left (configuration, the CLI
//! and explicit persistence calls).

use thiserror::Error;

/// Main error type for sandpath operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Path store error: {0}")]
    Store(String),

    #[error("Invalid pattern: {0}")]
    Pattern(String),

    #[error("Variable expansion failed: {0}")]
    Expand(String),

    #[error("Watch error: {0}")]
    Watch(String),
}

impl From<regex::Error> for Error {
    fn from(err: regex::Error) -> Self {
        Error::Pattern(err.to_string())
    }
}

impl From<notify::Error> for Error {
    fn from(err: notify::Error) -> Self {
        Error::Watch(err.to_string())
    }
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Store("line 3: bad flags".to_string());
        assert_eq!(err.to_string(), "Path store error: line 3: bad flags");

        let err = Error::Expand("unknown variable %foo%".to_string());
        assert!(err.to_string().contains("%foo%"));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
