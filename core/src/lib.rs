//! # Anti-entropy sync core
//!
//! The bloom-filter set-reconciliation protocol, the schema registry and
//! upgrade engine, and the cooperative scheduler shim that a peer-to-peer
//! append-only commit store's convergence depends on. The authorization
//! matcher lives in the sibling `ledgersync-auth` crate; the two compose
//! in the root `ledgersync` facade.
//!
//! ## Convergence
//! Two peers exchange [`message::SyncMessage`]s built by [`engine::SyncEngine`].
//! Each message carries a [`bloom::BloomFilter`] over the sender's
//! collection at an adaptive false-positive rate (`engine::adaptive_fpr`):
//! large enough to keep bandwidth down, small enough that the expected
//! number of cycles to full convergence stays near the caller's target.
//! Hash seeds are randomly chosen per filter instance — two peers over an
//! identical set produce different filters with different false-positive
//! surfaces, which is what lets repeated cycles eventually surface every
//! element either side is missing.
//!
//! ## Schema evolution
//! Every stored [`commit::Commit`] carries a schema marker. The
//! [`schema::SchemaRegistry`] enforces that a namespace's versions form a
//! dense chain and walks a commit's payload forward through every
//! registered upgrader between its stored version and the target, never
//! mutating the caller's copy.
//!
//! ## Concurrency
//! Large scans and decodes yield to the caller's executor between items,
//! never mid-item, through the runtime-agnostic [`scheduler::Scheduler`].
#![warn(missing_docs)]
mod bloom;
mod commit;
mod config;
mod engine;
pub mod error;
mod message;
mod scheduler;
mod schema;
mod store;

pub use crate::bloom::BloomFilter;
pub use crate::commit::{now_ms, Commit, NULL_MARKER};
pub use crate::config::{Config, DEFAULT_TTL_MS};
pub use crate::engine::{adaptive_fpr, BuildOutcome, Pacer, ProcessOutcome, SyncEngine};
pub use crate::error::{Metrics, SyncError};
pub use crate::message::{DecodeReport, SyncMessage};
pub use crate::scheduler::{Priority, Scheduler};
pub use crate::schema::{Schema, SchemaRegistry, Upgrader};
pub use crate::store::{CommitStore, PutOutcome};
