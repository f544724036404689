//! Foundation types for Transact.
//!
//! This crate provides the identity, value, and record types shared by the
//! storage backends and the transactional engine. Every other Transact crate
//! depends on `transact-types`.
//!
//! # Key Types
//!
//! - [`Identity`] — Totally ordered identifier for events, entities, and transactions
//! - [`Value`] — A storable event parameter: a primitive or an identity reference
//! - [`EventRecord`] — The persisted shape of one intercepted event call
//! - [`WaitingTransactionMarker`] — Saved-but-unfinalized transaction marker
//! - [`TransactionRef`] — Wire shape used to hand a transaction to a remote finalizer
//! - [`ClockStamp`] — Hybrid Logical Clock reading used for time-ordered identities

pub mod error;
pub mod identity;
pub mod record;
pub mod temporal;
pub mod value;

pub use error::TypeError;
pub use identity::Identity;
pub use record::{EventRecord, TransactionRef, WaitingTransactionMarker};
pub use temporal::ClockStamp;
pub use value::{Params, Value};
