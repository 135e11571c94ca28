use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Corrupt pending request row {id}: {reason}")]
    CorruptRow { id: i64, reason: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Insert or update refused by the one-PROCESSING-row-per-hearing index
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}
