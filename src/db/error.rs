use thiserror::Error;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("resource {0} not found")]
    NotFound(i64),
    #[error("resource {0} is already published or has no draft")]
    AlreadyPublished(i64),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
