use thiserror::Error;

/// Errors from canonical serialization and content hashing.
#[derive(Error, Debug)]
pub enum CanonicalError {
    #[error("failed to serialize value to JSON: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("canonical JSON emission failed: {reason}")]
    Emit { reason: String },

    #[error("canonical output contained invalid UTF-8")]
    InvalidUtf8,
}
