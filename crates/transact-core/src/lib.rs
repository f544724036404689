//! Transactional event interception, identity resolution, and commit
//! protocol for Transact.
//!
//! Aggregates declare their events once, through [`Aggregate::schema`].
//! Applications drive them through [`Entity`] handles obtained from a
//! [`Transaction`]: every call is recorded in the transaction's queue and
//! applied immediately. Saving assigns identities, rewrites entity arguments
//! into identity references, and stages the batch in a repository; commit
//! makes it visible to readers and rollback discards it.
//!
//! - [`EventStore`] — entry point: start, load, and enumerate transactions
//! - [`Transaction`] / [`AnyTransaction`] — save, commit, rollback, and entity lookup
//! - [`Entity`] — recording decorator over an aggregate value
//! - [`Reference`] — lazily resolved link to another entity
//! - [`delivery`] — post-save hand-off to an asynchronous finalizer
//! - [`RecoveryWorker`] — periodic finalization of waiting transactions
//! - [`EngineConfig`] — TOML configuration of backend, recovery, and delivery

pub mod args;
pub mod config;
mod context;
pub mod delivery;
pub mod entity;
pub mod error;
pub mod recovery;
pub mod reference;
mod registry;
mod resolver;
pub mod schema;
pub mod store;
pub mod transaction;

#[cfg(test)]
mod testing;

pub use args::{Arg, Args, EventArgs, IntoArg, ObjectKey};
pub use config::{Backend, DeliveryConfig, EngineConfig, RecoveryConfig};
pub use delivery::{
    resolve, AlwaysCommit, DeliveryReport, TransactionChecker, TransactionReceiver,
    TransactionSender, Verdict,
};
pub use entity::Entity;
pub use error::{CoreError, CoreResult};
pub use recovery::{RecoveryReport, RecoveryWorker};
pub use reference::Reference;
pub use schema::{
    Access, Aggregate, Apply, Constructor, Dispatch, EventSignature, ParamKind, Returns,
    SchemaBuilder, TransactionType,
};
pub use store::{EventStore, PendingTransaction, SaveHook};
pub use transaction::{AnyTransaction, Transaction};
