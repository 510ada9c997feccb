//! Error types for xboxtest

use std::io::ErrorKind;
use thiserror::Error;

/// Result type alias using the xboxtest Error
pub type Result<T> = std::result::Result<T, Error>;

/// xboxtest error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Cannot move {from} to {to}: directories can only be moved within one drive")]
    CrossDrive { from: String, to: String },

    #[error("Cannot {operation} while the instance is {state}")]
    InvalidState { operation: String, state: String },

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Transient error: {0}")]
    Transient(String),

    /// A peer that accepted the connection stopped answering
    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("QMP error: {0}")]
    Qmp(String),

    #[error("FTP error: {code} {message}")]
    Ftp { code: u16, message: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the error is expected while a remote listener is still coming up.
    ///
    /// Only these errors are retried by [`crate::retry::RetryPolicy`].
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Io(e) => matches!(
                e.kind(),
                ErrorKind::ConnectionRefused
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::NotConnected
                    | ErrorKind::UnexpectedEof
                    | ErrorKind::BrokenPipe
            ),
            Error::Transient(_) | Error::ConnectionClosed(_) => true,
            // 421: service not available, the guest server is still starting
            Error::Ftp { code, .. } => *code == 421,
            _ => false,
        }
    }

    /// An operation was attempted in a lifecycle state that does not allow it
    pub fn invalid_state(operation: &str, state: impl std::fmt::Display) -> Self {
        Error::InvalidState {
            operation: operation.to_string(),
            state: state.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refused_is_transient() {
        let err = Error::from(std::io::Error::from(ErrorKind::ConnectionRefused));
        assert!(err.is_transient());
    }

    #[test]
    fn test_config_is_not_transient() {
        assert!(!Error::Config("missing firmware".to_string()).is_transient());
        assert!(!Error::InvalidPath("C:/x".to_string()).is_transient());
        let denied = Error::from(std::io::Error::from(ErrorKind::PermissionDenied));
        assert!(!denied.is_transient());
    }

    #[test]
    fn test_timeout_is_not_transient() {
        assert!(!Error::Timeout("FTP reply after 60s".to_string()).is_transient());
    }

    #[test]
    fn test_ftp_service_unavailable_is_transient() {
        let err = Error::Ftp {
            code: 421,
            message: "Service not available".to_string(),
        };
        assert!(err.is_transient());
        let err = Error::Ftp {
            code: 550,
            message: "No such file".to_string(),
        };
        assert!(!err.is_transient());
    }
}
