//! Error types for the session protocol and the metadata store

use std::path::PathBuf;
use thiserror::Error;

/// Failures of the metadata store. These may carry filesystem paths and are
/// only ever logged, never sent to a client verbatim.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Filesystem operation failed
    #[error("{context} ({path}): {source}")]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Persisted metadata could not be parsed
    #[error("corrupt metadata file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Snapshot could not be serialized
    #[error("failed to encode metadata: {0}")]
    Encode(#[from] serde_json::Error),

    /// Blocking filesystem work panicked or was cancelled
    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// Filename is not usable as a storage path component
    #[error("invalid filename: {0}")]
    InvalidFilename(String),
}

impl StoreError {
    pub(crate) fn io(context: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            context,
            path: path.into(),
            source,
        }
    }
}

/// Two-phase transfer failures. Recovered at command scope.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TransferError {
    #[error("received {actual} bytes, expected {expected}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("file data was not sent as a binary frame")]
    NotBinary,

    #[error("timed out waiting for file data")]
    TimedOut,

    #[error("file is not available")]
    Unavailable,
}

/// Anything a single command can fail with short of a connection fault.
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("{0}")]
    BadArguments(String),

    #[error("authenticate first")]
    NotAuthenticated,

    #[error("file not found: {0}")]
    NotFound(String),

    #[error("transfer failed: {0}")]
    Transfer(#[from] TransferError),

    #[error("storage failure")]
    Storage(#[from] StoreError),
}

/// What ends a command's processing early
#[derive(Error, Debug)]
pub enum SessionError {
    /// Reported to the client; the session keeps going
    #[error(transparent)]
    Command(#[from] CommandError),

    /// Peer or outbound queue is gone; terminal for this session only
    #[error("connection closed")]
    ConnectionClosed,
}

impl From<TransferError> for SessionError {
    fn from(e: TransferError) -> Self {
        SessionError::Command(e.into())
    }
}

impl From<StoreError> for SessionError {
    fn from(e: StoreError) -> Self {
        SessionError::Command(e.into())
    }
}

impl CommandError {
    /// Message sent to the client in an ERROR response.
    pub fn user_message(&self) -> String {
        match self {
            CommandError::Storage(StoreError::InvalidFilename(name)) => {
                format!("invalid filename: {name}")
            }
            // Display of Storage is fixed text; the source (with paths) is logged only
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_hide_paths() {
        let err = CommandError::Storage(StoreError::io(
            "write artifact",
            "/srv/picshare/imagens/1_cat.png",
            std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        ));
        let msg = err.user_message();
        assert_eq!(msg, "storage failure");
        assert!(!msg.contains("/srv"));
    }

    #[test]
    fn transfer_errors_describe_mismatch() {
        let err = CommandError::from(TransferError::SizeMismatch {
            expected: 10,
            actual: 7,
        });
        assert_eq!(err.user_message(), "transfer failed: received 7 bytes, expected 10");
    }

    #[test]
    fn invalid_filename_is_reported() {
        let err = CommandError::from(StoreError::InvalidFilename("../x".into()));
        assert_eq!(err.user_message(), "invalid filename: ../x");
    }
}
