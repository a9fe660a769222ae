use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("event.at={at} outside allowed skew of {max_skew_s}s from now={now}")]
    Skew { at: i64, now: i64, max_skew_s: i64 },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
