use thiserror::Error;

/// Errors raised while building or decoding identities, stamps, and records.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid identity {0:?}: must be non-empty and free of whitespace")]
    InvalidIdentity(String),

    #[error("invalid clock stamp identity: {0}")]
    InvalidClockStamp(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}
