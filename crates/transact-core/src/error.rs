use thiserror::Error;
use transact_store::StoreError;
use transact_types::{Identity, TypeError};

/// Errors surfaced by the transactional engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// Events were recorded or a save was attempted after the transaction
    /// was saved, or on a transaction loaded from storage.
    #[error("transaction is read-only")]
    TransactionReadOnly,

    #[error("transaction {0} is already committed or does not exist")]
    TransactionAlreadyCommitted(Identity),

    #[error("entity {0} not found")]
    EntityNotFound(Identity),

    #[error("object has no identity in this transaction")]
    EntityHasNoIdentity,

    #[error("entity type {0} is not reachable from this transaction")]
    UnsupportedEntityType(String),

    #[error("parameter {param} of {event} holds an object this transaction does not track")]
    UnsupportedParameterType { event: String, param: String },

    #[error("event {type_name}::{event} must be callable by external code")]
    MethodMustBeCallable { type_name: String, event: String },

    #[error("event {type_name}::{event} must be intercepted by the framework")]
    MethodMustBeOverridable { type_name: String, event: String },

    #[error("event {type_name}::{event} must return unit or an entity, not {returns}")]
    MethodMustReturnVoidOrClass {
        type_name: String,
        event: String,
        returns: String,
    },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("{type_name} declares no event {event}({params})")]
    UnknownEvent {
        type_name: String,
        event: String,
        params: String,
    },

    #[error("event {event} is missing parameter {param}")]
    MissingParam { event: String, param: String },

    #[error("parameter {param} of {event} expects {expected}, found {found}")]
    ParamKindMismatch {
        event: String,
        param: String,
        expected: String,
        found: String,
    },

    #[error("entity {identity} is a {found}, not a {expected}")]
    EntityTypeMismatch {
        identity: Identity,
        expected: String,
        found: String,
    },

    #[error("transaction {identity} opens with {found}, expected {expected}")]
    TransactionTypeMismatch {
        identity: Identity,
        expected: String,
        found: String,
    },

    #[error("no transaction type registered as {0}")]
    UnknownTransactionType(String),

    /// A reference outlived the transaction context it was bound to.
    #[error("transaction context was dropped")]
    ContextClosed,

    #[error("store error: {0}")]
    Store(StoreError),

    #[error("configuration error: {0}")]
    Config(String),

    /// A saved transaction could not be handed to the delivery channel.
    #[error("delivery failed: {0}")]
    Delivery(String),
}

impl CoreError {
    /// Returns `true` for errors caused by schema or configuration mistakes,
    /// which retrying cannot fix.
    pub fn is_configuration(&self) -> bool {
        match self {
            Self::UnsupportedEntityType(_)
            | Self::UnsupportedParameterType { .. }
            | Self::MethodMustBeCallable { .. }
            | Self::MethodMustBeOverridable { .. }
            | Self::MethodMustReturnVoidOrClass { .. }
            | Self::UnknownEvent { .. }
            | Self::MissingParam { .. }
            | Self::ParamKindMismatch { .. }
            | Self::EntityTypeMismatch { .. }
            | Self::TransactionTypeMismatch { .. }
            | Self::UnknownTransactionType(_)
            | Self::Config(_) => true,
            Self::Store(e) => matches!(e, StoreError::InvalidConfig(_)),
            _ => false,
        }
    }

    /// Returns `true` for losing a finalization race or reading ahead of a
    /// commit; the next attempt may observe a different outcome.
    pub fn is_race(&self) -> bool {
        matches!(
            self,
            Self::TransactionAlreadyCommitted(_) | Self::EntityNotFound(_)
        )
    }
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::TransactionAlreadyCommitted(id) => Self::TransactionAlreadyCommitted(id),
            other => Self::Store(other),
        }
    }
}

impl From<TypeError> for CoreError {
    fn from(err: TypeError) -> Self {
        Self::Store(StoreError::Serialization(err.to_string()))
    }
}

/// Result alias for engine operations.
pub type CoreResult<T> = Result<T, CoreError>;

pub(crate) fn poisoned(what: &'static str) -> CoreError {
    CoreError::Store(StoreError::LockPoisoned(what))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn already_committed_is_lifted_out_of_store_errors() {
        let id = Identity::from_sequence(3);
        let err: CoreError = StoreError::TransactionAlreadyCommitted(id.clone()).into();
        assert_eq!(err, CoreError::TransactionAlreadyCommitted(id));
        assert!(err.is_race());
    }

    #[test]
    fn quorum_loss_is_transient() {
        let err: CoreError = StoreError::QuorumUnavailable {
            required: 2,
            reached: 1,
        }
        .into();
        assert!(!err.is_configuration());
        assert!(!err.is_race());
    }

    #[test]
    fn schema_errors_are_configuration() {
        let err = CoreError::UnsupportedEntityType("Product".into());
        assert!(err.is_configuration());
        assert!(CoreError::Store(StoreError::InvalidConfig("x".into())).is_configuration());
        assert!(!CoreError::TransactionReadOnly.is_configuration());
    }
}
