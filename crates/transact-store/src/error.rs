use transact_types::Identity;

/// Errors produced by repository backends.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Commit or rollback targeted a transaction that is already finalized
    /// or was never saved.
    #[error("transaction {0} is already committed or does not exist")]
    TransactionAlreadyCommitted(Identity),

    /// Fewer replicas acknowledged than a majority requires.
    #[error("quorum unavailable: required {required}, reached {reached}")]
    QuorumUnavailable { required: usize, reached: usize },

    /// The save producer failed before yielding a batch.
    #[error("event producer aborted: {0}")]
    ProducerAborted(String),

    /// The produced batch does not match what was announced.
    #[error("batch size mismatch: expected {expected} events, produced {produced}")]
    BatchSizeMismatch { expected: usize, produced: usize },

    /// The produced batch is not a well-formed transaction.
    #[error("malformed batch: {0}")]
    MalformedBatch(String),

    #[error("invalid store configuration: {0}")]
    InvalidConfig(String),

    #[error("{0} lock poisoned")]
    LockPoisoned(&'static str),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result alias for repository operations.
pub type StoreResult<T> = Result<T, StoreError>;
