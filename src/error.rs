use std::sync::Arc;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// The data provider answered but reported a failure for the call.
    #[error("Remote error in {method}: {message}")]
    Remote { method: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    /// Stage 1 of the picker failed; the whole run is abandoned.
    #[error("Bulk fetch failed: {0}")]
    BulkFetch(#[source] Box<AppError>),

    /// The same failure handed to every caller that waited on one remote call.
    #[error(transparent)]
    Shared(Arc<AppError>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    pub fn remote(method: impl Into<String>, message: impl Into<String>) -> Self {
        AppError::Remote {
            method: method.into(),
            message: message.into(),
        }
    }
}
