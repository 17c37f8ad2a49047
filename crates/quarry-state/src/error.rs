use thiserror::Error;

/// State store errors.
///
/// Nothing here crosses the claim/complete boundary as a panic; callers get
/// a value they can classify. Busy-database conditions are retried inside
/// the store and only surface after the bounded retry is exhausted.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("row not found: {entity} {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("invalid {field} value '{value}' in row")]
    InvalidColumn { field: &'static str, value: String },

    #[error("artifact storage policy violation: {reason}")]
    ArtifactPolicy { reason: String },

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
}

impl StateError {
    /// Busy/locked SQLite conditions that merit a jittered claim retry.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        match self {
            StateError::Database(sqlx::Error::Database(db)) => {
                let code = db.code().map(|c| c.to_string());
                matches!(code.as_deref(), Some("5") | Some("6") | Some("517"))
                    || db.message().contains("database is locked")
            }
            _ => false,
        }
    }
}
