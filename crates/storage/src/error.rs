use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Hash mismatch or a blob missing behind live metadata. Non-retryable.
    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Deny surfaced at the file-service boundary. The permission engine
    /// itself returns deny as a value; this is the file API refusing to act
    /// on it.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error(transparent)]
    Rebac(#[from] nexus_rebac::RebacError),
}
