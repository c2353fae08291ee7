use thiserror::Error;

/// A missing conversation is not an error here — `load_from_db` returns
/// `Ok(None)` for that, mirroring the database lookup it wraps.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("database error: {0}")]
    Database(#[from] anima_db::DbError),
}

pub type Result<T> = std::result::Result<T, SessionError>;
