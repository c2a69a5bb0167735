//! Error taxonomy shared by the stream, the session loop and the ingestion pipeline

use thiserror::Error;

use crate::storage::StoreError;

#[derive(Debug, Error)]
pub enum BackupError {
    /// Caller handed us something we refuse to put on the wire
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A framed payload (or its length prefix) could not be decoded
    #[error("parse error: {0}")]
    Parse(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("{client_path} is already tracked for owner {owner_id}")]
    AlreadyTracked { owner_id: i64, client_path: String },

    /// Side-channel content retrieval failed
    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    /// The stream was closed (locally or by the peer) before a result existed
    #[error("connection closed")]
    Closed,

    /// The server answered a request with NACK
    #[error("server rejected request: {0}")]
    Rejected(String),

    /// The peer answered with something that does not fit the exchange
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl BackupError {
    /// Errors after which the connection cannot continue
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BackupError::Io(_) | BackupError::Closed | BackupError::Authentication(_)
        )
    }
}

impl From<serde_json::Error> for BackupError {
    fn from(e: serde_json::Error) -> Self {
        BackupError::Parse(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(BackupError::Closed.is_fatal());
        assert!(BackupError::Authentication("x".into()).is_fatal());
        assert!(BackupError::Io(std::io::Error::other("boom")).is_fatal());
        assert!(!BackupError::Parse("bad".into()).is_fatal());
        assert!(!BackupError::Transfer("404".into()).is_fatal());
        assert!(!BackupError::AlreadyTracked {
            owner_id: 1,
            client_path: "/a".into()
        }
        .is_fatal());
    }

    #[test]
    fn test_already_tracked_message_names_path() {
        let e = BackupError::AlreadyTracked {
            owner_id: 7,
            client_path: "/a/b".into(),
        };
        assert_eq!(e.to_string(), "/a/b is already tracked for owner 7");
    }
}
