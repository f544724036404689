use serde::{Deserialize, Serialize};

use crate::error::TypeError;
use crate::identity::Identity;
use crate::value::Params;

/// The persisted shape of one intercepted event call.
///
/// `root` is the aggregate the event is replayed against, `transaction` the
/// batch it was saved in, and `identity` the event's own id. Events sharing a
/// root are replayed in ascending `identity` order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub transaction: Identity,
    pub identity: Identity,
    pub root: Identity,
    pub event_name: String,
    pub params: Params,
}

impl EventRecord {
    /// Returns `true` for the first event of a transaction, whose identity,
    /// root, and transaction are all the same value.
    pub fn is_transaction_root(&self) -> bool {
        self.identity == self.root && self.root == self.transaction
    }

    /// Parameter names in key order.
    pub fn param_names(&self) -> impl Iterator<Item = &str> {
        self.params.keys().map(String::as_str)
    }
}

/// Marker for a transaction that was saved but not yet committed or rolled
/// back. Backends keep one from save until finalization.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WaitingTransactionMarker {
    pub identity: Identity,
    pub root_event_name: String,
}

/// Wire shape of a transaction handed to a remote finalizer.
///
/// Given access to the same repository, this is enough for another process
/// to reload the transaction and commit or roll it back.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRef {
    pub identity: Identity,
    pub transaction_type_name: String,
}

impl TransactionRef {
    pub fn new(identity: Identity, transaction_type_name: impl Into<String>) -> Self {
        Self {
            identity,
            transaction_type_name: transaction_type_name.into(),
        }
    }

    /// Encode as JSON bytes.
    pub fn to_json(&self) -> Result<Vec<u8>, TypeError> {
        serde_json::to_vec(self).map_err(|e| TypeError::Serialization(e.to_string()))
    }

    /// Decode from JSON bytes.
    pub fn from_json(bytes: &[u8]) -> Result<Self, TypeError> {
        serde_json::from_slice(bytes).map_err(|e| TypeError::Serialization(e.to_string()))
    }
}
