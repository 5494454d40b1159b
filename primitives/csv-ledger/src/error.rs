//! Ledger error types.

/// Errors produced by ledger storage and imports.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// Storage could not be read or written.
    #[error("ledger I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV encoding or decoding failed.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// An upload was not recognised as a CSV file.
    #[error("not a CSV file: {filename}")]
    InvalidUpload {
        /// Name of the rejected file.
        filename: String,
    },
}

impl From<tempfile::PersistError> for LedgerError {
    fn from(err: tempfile::PersistError) -> Self {
        Self::Io(err.error)
    }
}

/// Result alias for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;
