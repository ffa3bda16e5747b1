//! Error types for the Tessera library.
//!
//! Every fallible operation returns [`Result`], whose error side is the
//! [`TesseraError`] enum. The variants follow the failure taxonomy of the
//! index engine:
//!
//! - [`TesseraError::Corruption`] is raised when a checksum, header or footer
//!   does not match. It is never retried.
//! - [`TesseraError::Io`] and [`TesseraError::Storage`] surface to the
//!   operation that touched the failing file.
//! - [`TesseraError::IllegalArgument`], [`TesseraError::IllegalState`] and
//!   [`TesseraError::AlreadyClosed`] report contract violations at the call
//!   site.
//! - [`TesseraError::MergeFailed`] carries a background merge failure that is
//!   re-raised on the next synchronous writer call.
//!
//! # Examples
//!
//! ```
//! use tessera::error::{Result, TesseraError};
//!
//! fn check_term(term: &[u8]) -> Result<()> {
//!     if term.is_empty() {
//!         return Err(TesseraError::illegal_argument("empty term"));
//!     }
//!     Ok(())
//! }
//!
//! assert!(check_term(b"").is_err());
//! ```

use std::io;

use thiserror::Error;

/// The main error type for Tessera operations.
#[derive(Error, Debug)]
pub enum TesseraError {
    /// I/O errors from the underlying storage.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Storage backend errors.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A file that was expected to exist is missing.
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// Checksum mismatch or malformed header/footer.
    #[error("Corrupt index file {resource}: {message}")]
    Corruption { resource: String, message: String },

    /// No commit point exists in the storage.
    #[error("Index not found: {0}")]
    IndexNotFound(String),

    /// The write lock is held by someone else.
    #[error("Lock obtain failed: {0}")]
    LockObtainFailed(String),

    /// The writer or reader was already closed.
    #[error("Already closed: {0}")]
    AlreadyClosed(String),

    /// The caller passed an invalid argument.
    #[error("Illegal argument: {0}")]
    IllegalArgument(String),

    /// The operation is not valid in the current state.
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Analysis (tokenization) failed.
    #[error("Analysis error: {0}")]
    Analysis(String),

    /// A merge was aborted by rollback, close or delete-all.
    #[error("Merge aborted: {0}")]
    MergeAborted(String),

    /// A background merge failed.
    #[error("Merge failed: {0}")]
    MergeFailed(String),

    /// JSON serialization/deserialization errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error for other cases.
    #[error("Error: {0}")]
    Other(String),

    /// Generic anyhow error.
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

/// Result type alias for operations that may fail with TesseraError.
pub type Result<T> = std::result::Result<T, TesseraError>;

impl TesseraError {
    /// Create a new storage error.
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        TesseraError::Storage(msg.into())
    }

    /// Create a new corruption error for the named file.
    pub fn corruption<R: Into<String>, S: Into<String>>(resource: R, msg: S) -> Self {
        TesseraError::Corruption {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a new index-not-found error.
    pub fn index_not_found<S: Into<String>>(msg: S) -> Self {
        TesseraError::IndexNotFound(msg.into())
    }

    /// Create a new already-closed error.
    pub fn already_closed<S: Into<String>>(msg: S) -> Self {
        TesseraError::AlreadyClosed(msg.into())
    }

    /// Create a new illegal argument error.
    pub fn illegal_argument<S: Into<String>>(msg: S) -> Self {
        TesseraError::IllegalArgument(msg.into())
    }

    /// Create a new illegal state error.
    pub fn illegal_state<S: Into<String>>(msg: S) -> Self {
        TesseraError::IllegalState(msg.into())
    }

    /// Create a new analysis error.
    pub fn analysis<S: Into<String>>(msg: S) -> Self {
        TesseraError::Analysis(msg.into())
    }

    /// Create a new merge-aborted error.
    pub fn merge_aborted<S: Into<String>>(msg: S) -> Self {
        TesseraError::MergeAborted(msg.into())
    }

    /// Create a new merge failure.
    pub fn merge_failed<S: Into<String>>(msg: S) -> Self {
        TesseraError::MergeFailed(msg.into())
    }

    /// Create a new generic error.
    pub fn other<S: Into<String>>(msg: S) -> Self {
        TesseraError::Other(msg.into())
    }

    /// True for checksum or structural corruption.
    pub fn is_corruption(&self) -> bool {
        matches!(self, TesseraError::Corruption { .. })
    }

    /// True when a file was not found by the storage layer.
    pub fn is_not_found(&self) -> bool {
        match self {
            TesseraError::FileNotFound(_) => true,
            TesseraError::Io(e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_construction() {
        let error = TesseraError::storage("disk full");
        assert_eq!(error.to_string(), "Storage error: disk full");

        let error = TesseraError::corruption("_0.tim", "checksum mismatch");
        assert_eq!(
            error.to_string(),
            "Corrupt index file _0.tim: checksum mismatch"
        );
        assert!(error.is_corruption());

        let error = TesseraError::illegal_argument("term too long");
        assert_eq!(error.to_string(), "Illegal argument: term too long");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "File not found");
        let error = TesseraError::from(io_error);

        match error {
            TesseraError::Io(_) => {}
            _ => panic!("Expected IO error variant"),
        }
        assert!(error.is_not_found());
    }
}
