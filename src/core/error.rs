use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Follower {follower_id} already has a pending response for post {post_id}")]
    DuplicateActive { post_id: String, follower_id: String },

    #[error("Follower {follower_id} already liked post {post_id}")]
    DuplicateLike { post_id: String, follower_id: String },

    #[error("Invalid thread target {target_id} for post {post_id}")]
    InvalidThreadTarget { post_id: String, target_id: String },

    #[error("Generator timed out after {0:?}")]
    GeneratorTimeout(Duration),

    #[error("Generator error: {0}")]
    GeneratorError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

impl EngineError {
    /// Failures worth another attempt after a backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::GeneratorTimeout(_) | EngineError::GeneratorError(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
