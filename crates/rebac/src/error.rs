use thiserror::Error;

pub type Result<T> = std::result::Result<T, RebacError>;

#[derive(Debug, Error)]
pub enum RebacError {
    /// Transient storage failure. Decision paths surface this as an error,
    /// never as a deny.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Cannot create cross-tenant relationship: {0}")]
    TenantIsolation(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
