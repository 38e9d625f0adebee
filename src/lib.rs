//! Performance subsystems for a sharded document-database server.
//!
//! Four cores, usable independently:
//!
//! - [`coalescer`] — per-namespace leader/follower coalescing of
//!   config-metadata queries, with bounded waiting, version-gap rejection,
//!   and safe shutdown.
//! - [`extract`] — one-pass BSON field extraction through a pre-registered,
//!   signature-indexed slot table.
//! - [`shard_lock`] — reference-counted mutexes keyed by
//!   `(namespace, shard-key value)` with RAII release.
//! - [`repair`] — single-entry index reconciliation (insert a missing entry,
//!   remove an orphan) with strict validation and a dry-run mode.
//!
//! The BSON codec (the `bson` crate's raw API) and the storage engine are
//! external collaborators; [`catalog`] and [`storage`] carry the thin
//! in-memory seam the repair protocol is exercised against.

pub mod catalog;
pub mod coalescer;
pub mod config;
pub mod error;
pub mod extract;
pub mod index;
pub mod integrity;
pub mod repair;
pub mod shard_lock;
pub mod storage;
pub mod util;

pub use catalog::{Catalog, Collection, IndexDescriptor};
pub use coalescer::{CoalescerStats, QueryCoalescer};
pub use config::{CoalescerConfig, CoalescerSettings};
pub use error::{DocshardError, DocshardErrorCode};
pub use extract::{FieldExtractor, SlotTable};
pub use repair::{RepairContext, RepairRequest};
pub use shard_lock::{ShardKeyLockGuard, ShardKeyLockManager};
pub use storage::{RecordId, ReplicaRole};
