//! Error types for VirtaDB.

use thiserror::Error;

/// Result type alias using VirtaError.
pub type Result<T> = std::result::Result<T, VirtaError>;

/// Errors that can occur in VirtaDB operations.
#[derive(Debug, Error)]
pub enum VirtaError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("I/O failed after {attempts} attempts: {reason}")]
    RetriesExhausted { attempts: u32, reason: String },

    // Data file errors
    #[error("Data file not found: {file_index}")]
    FileNotFound { file_index: u32 },

    #[error("Data corrupted at {location}: {reason}")]
    Corrupted { location: String, reason: String },

    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("Not writing: {0}")]
    NotWriting(String),

    #[error("Already writing: {0}")]
    AlreadyWriting(String),

    // Index errors
    #[error("Index {index} out of bounds (capacity {capacity})")]
    IndexOutOfBounds { index: u64, capacity: u64 },

    #[error("Invalid key range: {min} - {max}")]
    InvalidRange { min: i64, max: i64 },

    // Map lifecycle errors
    #[error("Map halted after fatal error: {0}")]
    Halted(String),

    #[error("Map is read only")]
    ReadOnly,

    #[error("Map is closed")]
    Closed,

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter { name: String, value: String },

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl VirtaError {
    /// Builds an `InvalidParameter` error from any displayable value.
    pub fn invalid_parameter(name: &str, value: impl std::fmt::Display) -> Self {
        VirtaError::InvalidParameter {
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    /// Returns true for I/O errors that are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            VirtaError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn test_io_error_conversion() {
        let io_err = IoError::new(ErrorKind::NotFound, "file not found");
        let err: VirtaError = io_err.into();
        assert!(matches!(err, VirtaError::Io(_)));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_transient_classification() {
        let err: VirtaError = IoError::new(ErrorKind::Interrupted, "signal").into();
        assert!(err.is_transient());

        let err: VirtaError = IoError::new(ErrorKind::TimedOut, "slow disk").into();
        assert!(err.is_transient());

        let err: VirtaError = IoError::new(ErrorKind::NotFound, "gone").into();
        assert!(!err.is_transient());

        assert!(!VirtaError::Internal("x".to_string()).is_transient());
    }

    #[test]
    fn test_file_errors_display() {
        let err = VirtaError::FileNotFound { file_index: 7 };
        assert_eq!(err.to_string(), "Data file not found: 7");

        let err = VirtaError::Corrupted {
            location: "3:128".to_string(),
            reason: "checksum mismatch".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Data corrupted at 3:128: checksum mismatch"
        );

        let err = VirtaError::RetriesExhausted {
            attempts: 5,
            reason: "file closed".to_string(),
        };
        assert_eq!(err.to_string(), "I/O failed after 5 attempts: file closed");
    }

    #[test]
    fn test_config_errors_display() {
        let err = VirtaError::ConfigError("threshold changed".to_string());
        assert_eq!(err.to_string(), "Configuration error: threshold changed");

        let err = VirtaError::invalid_parameter("min_number_of_files_in_compaction", 1);
        assert_eq!(
            err.to_string(),
            "Invalid parameter: min_number_of_files_in_compaction = 1"
        );
    }

    #[test]
    fn test_lifecycle_errors_display() {
        let err = VirtaError::Halted("flush failed".to_string());
        assert_eq!(err.to_string(), "Map halted after fatal error: flush failed");
        assert_eq!(VirtaError::ReadOnly.to_string(), "Map is read only");
        assert_eq!(VirtaError::Closed.to_string(), "Map is closed");
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<i32> {
            Ok(42)
        }

        fn returns_err() -> Result<i32> {
            Err(VirtaError::Internal("test".to_string()))
        }

        assert!(returns_ok().is_ok());
        assert!(returns_err().is_err());
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<VirtaError>();
    }
}
