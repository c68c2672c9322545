use thiserror::Error;

/// Result type alias for cratedig operations.
pub type Result<T> = std::result::Result<T, CrateDigError>;

#[derive(Debug, Error)]
pub enum CrateDigError {
    #[error("No Bandcamp user named {0}")]
    UnknownUser(String),

    #[error("User {0} has fewer than 2 collected items")]
    CollectionTooSmall(String),

    #[error("No crawl job for user {0}")]
    NoActiveJob(String),

    #[error("Transient fetch failure: {0}")]
    TransientFetch(String),

    #[error("Resource no longer available: {0}")]
    Gone(String),

    #[error("Unexpected page format: {0}")]
    PageFormat(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CrateDigError {
    /// Transient conditions keep the failing work unit queued and are retried
    /// with backoff; everything else either drops the unit or surfaces to the
    /// caller.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CrateDigError::TransientFetch(_) | CrateDigError::Database(_)
        )
    }
}
