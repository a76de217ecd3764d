//! Error types for Vesper

use thiserror::Error;

/// Result type alias using Vesper's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Vesper
#[derive(Error, Debug)]
pub enum Error {
    // Storage backend errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    // Transaction and locking errors
    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    // Not found
    #[error("{0} not found: {1}")]
    NotFound(String, String),

    // Invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    // Cancelled
    #[error("Operation cancelled: {0}")]
    Cancelled(String),
}

/// Errors raised by a key-column-value backend.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Transient failure; the operation may succeed if retried.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Non-retryable failure such as a malformed key.
    #[error("Permanent backend failure: {0}")]
    PermanentFailure(String),

    #[error("Store closed: {0}")]
    Closed(String),
}

/// Errors raised by the locking protocol and transaction lifecycle.
#[derive(Error, Debug)]
pub enum TransactionError {
    /// Another local transaction holds the key column.
    #[error("Local lock contention on {0}")]
    LocalLockContention(String),

    /// A remote claim won the tie-break, or our claim write was rejected.
    #[error("Lock conflict on {0}")]
    LockConflict(String),

    /// Our claim expired before it could be verified.
    #[error("Lock expired before verification on {0}")]
    ExpirationRaceAborted(String),

    /// A locked cell no longer holds the value observed when it was locked.
    #[error("Expected value mismatch on {0}")]
    ExpectedValueMismatch(String),

    #[error("Operation {op} not allowed in state {state}")]
    InvalidState { state: String, op: String },
}

impl Error {
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::NotFound(kind.into(), name.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Error::Storage(StorageError::BackendUnavailable(msg.into()))
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Error::Storage(StorageError::PermanentFailure(msg.into()))
    }

    pub fn lock_conflict(msg: impl Into<String>) -> Self {
        Error::Transaction(TransactionError::LockConflict(msg.into()))
    }

    /// Whether a backend operation failing with this error may be retried
    /// as-is against a fresh store transaction.
    pub fn is_temporary(&self) -> bool {
        matches!(
            self,
            Error::Storage(StorageError::BackendUnavailable(_)) | Error::Timeout(_)
        )
    }

    /// Whether this error means the transaction lost a lock. Callers should
    /// retry the whole transaction, since the set of locks may change.
    pub fn is_lock_failure(&self) -> bool {
        matches!(
            self,
            Error::Transaction(
                TransactionError::LocalLockContention(_)
                    | TransactionError::LockConflict(_)
                    | TransactionError::ExpirationRaceAborted(_)
                    | TransactionError::ExpectedValueMismatch(_)
            )
        )
    }

    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Storage(se) => match se {
                StorageError::BackendUnavailable(_) => "STORAGE_UNAVAILABLE",
                StorageError::PermanentFailure(_) => "STORAGE_PERMANENT",
                StorageError::Closed(_) => "STORAGE_CLOSED",
            },
            Error::Transaction(te) => match te {
                TransactionError::LocalLockContention(_) => "LOCAL_LOCK_CONTENTION",
                TransactionError::LockConflict(_) => "LOCK_CONFLICT",
                TransactionError::ExpirationRaceAborted(_) => "LOCK_EXPIRED",
                TransactionError::ExpectedValueMismatch(_) => "EXPECTED_VALUE_MISMATCH",
                TransactionError::InvalidState { .. } => "INVALID_TXN_STATE",
            },
            Error::Io(_) => "IO",
            Error::Serialization(_) => "SERIALIZATION",
            Error::Config(_) => "CONFIG",
            Error::Internal(_) => "INTERNAL",
            Error::NotFound(_, _) => "NOT_FOUND",
            Error::InvalidArgument(_) => "INVALID_ARGUMENT",
            Error::Timeout(_) => "TIMEOUT",
            Error::Cancelled(_) => "CANCELLED",
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::not_found("Store", "edgestore");
        assert_eq!(err.to_string(), "Store not found: edgestore");

        let err = Error::lock_conflict("v1/p_name");
        assert_eq!(err.to_string(), "Transaction error: Lock conflict on v1/p_name");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_temporary_classification() {
        assert!(Error::unavailable("region server down").is_temporary());
        assert!(Error::Timeout("slow".into()).is_temporary());
        assert!(!Error::permanent("bad key").is_temporary());
        assert!(!Error::lock_conflict("k").is_temporary());
        assert!(!Error::Storage(StorageError::Closed("s".into())).is_temporary());
    }

    #[test]
    fn test_lock_failure_classification() {
        assert!(Error::lock_conflict("k").is_lock_failure());
        assert!(Error::Transaction(TransactionError::LocalLockContention("k".into())).is_lock_failure());
        assert!(Error::Transaction(TransactionError::ExpirationRaceAborted("k".into())).is_lock_failure());
        assert!(!Error::unavailable("x").is_lock_failure());
        assert!(!Error::Transaction(TransactionError::InvalidState {
            state: "COMMITTED".into(),
            op: "mutate".into(),
        })
        .is_lock_failure());
    }

    #[test]
    fn test_codes() {
        assert_eq!(Error::unavailable("x").code(), "STORAGE_UNAVAILABLE");
        assert_eq!(Error::permanent("x").code(), "STORAGE_PERMANENT");
        assert_eq!(Error::lock_conflict("x").code(), "LOCK_CONFLICT");
        assert_eq!(
            Error::Transaction(TransactionError::ExpirationRaceAborted("x".into())).code(),
            "LOCK_EXPIRED"
        );
        assert_eq!(Error::internal("oops").code(), "INTERNAL");
    }
}
