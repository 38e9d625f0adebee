//! Storage-engine seam: record identity, replica role, and the
//! write-conflict retry loop. The engine itself is external; the in-memory
//! collection in [`crate::catalog`] implements just enough of it to drive the
//! repair protocol end to end.

pub mod encoded_key;

pub use encoded_key::{canonicalize_key_document, EncodedKey};

use crate::error::DocshardError;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

/// Opaque storage-engine handle for a physical document location.
///
/// Zero is the null sentinel; normal ids are strictly positive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordId(pub i64);

impl RecordId {
    pub const NULL: RecordId = RecordId(0);

    pub fn is_normal(self) -> bool {
        self.0 > 0
    }

    /// Order-preserving tail encoding for index entries.
    pub fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub fn from_be_bytes(bytes: [u8; 8]) -> Self {
        RecordId(i64::from_be_bytes(bytes))
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stand-in for the replication coordinator's write-acceptance answer.
pub struct ReplicaRole {
    writable: AtomicBool,
}

impl ReplicaRole {
    pub fn new(writable: bool) -> Self {
        Self {
            writable: AtomicBool::new(writable),
        }
    }

    pub fn can_accept_writes(&self, _namespace: &str) -> bool {
        self.writable.load(Ordering::Acquire)
    }

    pub fn set_writable(&self, writable: bool) {
        self.writable.store(writable, Ordering::Release);
    }
}

impl Default for ReplicaRole {
    fn default() -> Self {
        Self::new(true)
    }
}

const WRITE_CONFLICT_RETRY_LIMIT: u32 = 100;

/// Run `op` in a fresh attempt until it stops reporting a write conflict.
///
/// Exhausting the attempt budget surfaces the final conflict to the caller.
pub fn with_write_conflict_retry<R>(
    namespace: &str,
    op_name: &str,
    mut op: impl FnMut() -> Result<R, DocshardError>,
) -> Result<R, DocshardError> {
    let mut attempts = 0u32;
    loop {
        match op() {
            Err(DocshardError::Conflict(message)) => {
                attempts += 1;
                if attempts >= WRITE_CONFLICT_RETRY_LIMIT {
                    return Err(DocshardError::Conflict(message));
                }
                warn!(namespace, op = op_name, attempts, "write conflict, retrying");
            }
            other => return other,
        }
    }
}
