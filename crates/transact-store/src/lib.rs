//! Storage layer for Transact.
//!
//! This crate defines the boundary the transactional engine talks to and
//! ships two backends that satisfy it:
//!
//! - [`RepositoryContract`] — load committed entity events, load transaction
//!   events, stage a batch as pending, commit or roll it back, and enumerate
//!   waiting transactions for recovery
//! - [`IdentityGenerator`] — totally ordered identity allocation handed to the
//!   save producer
//! - [`InMemoryRepository`] — single lock-guarded event list with counter
//!   identities, for tests and embedding
//! - [`QuorumRepository`] — in-process replica set with majority reads and
//!   writes and last-write-wins merging, with clock-based identities

pub mod error;
pub mod memory;
pub mod quorum;
pub mod sequence;
pub mod stamps;
pub mod traits;

pub use error::{StoreError, StoreResult};
pub use memory::InMemoryRepository;
pub use quorum::{QuorumConfig, QuorumRepository};
pub use sequence::{BlockGenerator, SequenceGenerator};
pub use stamps::StampAllocator;
pub use traits::{check_batch, EventProducer, IdentityGenerator, RepositoryContract};
