// Re-export dependencies used in public interfaces of common types

use std::error::Error as StdError;

pub use serde::{Deserialize, Serialize};
use thiserror::Error;
pub use uuid;

pub mod entity;
pub mod id;
pub mod info;

pub use entity::{
    CopyCreateOptions, DataReader, Params, ProtectedEntity, ProtectedEntityManager,
    ProtectedEntityTypeManager,
};
pub use id::{EntityId, SnapshotId, ID_DELIMITER};
pub use info::{DataTransport, EntityInfo, S3Config};

type BoxError = Box<dyn StdError + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum WardenError {
    #[error("Invalid Format: {0}")]
    InvalidFormat(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Not Found: {0}")]
    NotFound(String),

    #[error("Already Exists: {0}")]
    AlreadyExists(String),

    #[error("Illegal Operation: {0}")]
    IllegalOperation(String),

    #[error("Unsupported Operation: {0}")]
    Unsupported(String),

    #[error("Backend Error: {operation} failed for {target}: {source}")]
    Backend {
        operation: String,
        target: String,
        #[source]
        source: BoxError,
    },

    #[error("Transfer failed after {bytes_copied} bytes: {source}")]
    Transfer {
        bytes_copied: u64,
        #[source]
        source: Box<WardenError>,
    },

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization Error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl WardenError {
    /// Wraps a lower-level failure with the operation and the object it targeted.
    pub fn backend(
        operation: impl Into<String>,
        target: impl ToString,
        source: impl Into<BoxError>,
    ) -> Self {
        WardenError::Backend {
            operation: operation.into(),
            target: target.to_string(),
            source: source.into(),
        }
    }

    /// Whether the host framework should retry the operation that produced this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            WardenError::InvalidFormat(_)
            | WardenError::Config(_)
            | WardenError::IllegalOperation(_)
            | WardenError::Unsupported(_) => false,
            WardenError::NotFound(_)
            | WardenError::AlreadyExists(_)
            | WardenError::Backend { .. }
            | WardenError::Io(_)
            | WardenError::Serialization(_) => true,
            WardenError::Transfer { source, .. } => source.is_retryable(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, WardenError::NotFound(_))
    }
}

/// Adds operation context to errors crossing a layer boundary.
pub trait ResultExt<T> {
    fn context_op(self, operation: &str, target: impl ToString) -> Result<T>;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<BoxError>,
{
    fn context_op(self, operation: &str, target: impl ToString) -> Result<T> {
        self.map_err(|e| WardenError::backend(operation, target, e))
    }
}

// Define the primary Result type for Warden operations
pub type Result<T> = std::result::Result<T, WardenError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(!WardenError::InvalidFormat("x".into()).is_retryable());
        assert!(!WardenError::IllegalOperation("snap of snap".into()).is_retryable());
        assert!(!WardenError::Unsupported("combined info".into()).is_retryable());

        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let backend = WardenError::backend("snapshot", "psql:abc", io);
        assert!(backend.is_retryable());
        assert!(backend.to_string().contains("snapshot failed for psql:abc"));

        let transfer = WardenError::Transfer {
            bytes_copied: 12,
            source: Box::new(WardenError::Unsupported("overwrite".into())),
        };
        assert!(!transfer.is_retryable());
    }

    #[test]
    fn test_context_op_wraps_source() {
        let res: std::result::Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            "connection reset",
        ));
        let err = res.context_op("get secret", "default/postgres").unwrap_err();
        match err {
            WardenError::Backend {
                operation, target, ..
            } => {
                assert_eq!(operation, "get secret");
                assert_eq!(target, "default/postgres");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
