//! Fine-grained locking keyed by `(namespace, shard-key value)`.
//!
//! Serializes operations that target the same shard-key value without holding
//! a collection-wide lock. Entries are reference counted and collected as
//! soon as the last holder releases; the table mutex is never held while an
//! entry mutex is being acquired.

use bson::RawDocument;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

type EntryGuard = ArcMutexGuard<RawMutex, ()>;

struct LockEntry {
    mutex: Arc<Mutex<()>>,
    /// Live acquirers. Mutated only under the table mutex.
    ref_count: u32,
}

/// Lock table keyed by namespace, then by the shard-key document's canonical
/// bytes. The shard-key bytes are copied in, so callers may free their
/// buffers immediately.
#[derive(Default)]
pub struct ShardKeyLockManager {
    table: Mutex<HashMap<String, BTreeMap<Vec<u8>, LockEntry>>>,
}

impl ShardKeyLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `shard_key` within `namespace`, blocking until it
    /// is free. An empty shard-key document needs no lock and yields `None`.
    pub fn acquire(
        &self,
        namespace: &str,
        shard_key: &RawDocument,
    ) -> Option<ShardKeyLockGuard<'_>> {
        if shard_key.is_empty() {
            return None;
        }
        let key = shard_key.as_bytes().to_vec();

        let entry = {
            let mut table = self.table.lock();
            let per_namespace = table.entry(namespace.to_string()).or_default();
            let slot = per_namespace.entry(key.clone()).or_insert_with(|| LockEntry {
                mutex: Arc::new(Mutex::new(())),
                ref_count: 0,
            });
            slot.ref_count += 1;
            Arc::clone(&slot.mutex)
        };

        // Entry mutex is taken outside the table mutex; blocking here cannot
        // stall unrelated keys.
        let guard = entry.lock_arc();
        debug!(namespace, "shard key lock acquired");
        Some(ShardKeyLockGuard {
            manager: self,
            namespace: namespace.to_string(),
            key,
            guard: Some(guard),
        })
    }

    fn release(&self, namespace: &str, key: &[u8]) {
        let mut table = self.table.lock();
        let Some(per_namespace) = table.get_mut(namespace) else {
            return;
        };
        let Some(slot) = per_namespace.get_mut(key) else {
            return;
        };
        slot.ref_count -= 1;
        if slot.ref_count == 0 {
            per_namespace.remove(key);
            if per_namespace.is_empty() {
                table.remove(namespace);
            }
        }
    }

    /// Number of live lock entries across all namespaces.
    pub fn entry_count(&self) -> usize {
        self.table.lock().values().map(BTreeMap::len).sum()
    }

    /// True when no entry exists, i.e. no lock is held or being waited on.
    pub fn is_idle(&self) -> bool {
        self.table.lock().is_empty()
    }
}

/// Held shard-key lock. Releasing happens on drop: the entry mutex is
/// unlocked first, then the entry reference is returned under the table
/// mutex. Moving the guard transfers ownership; the guard is not clonable.
pub struct ShardKeyLockGuard<'a> {
    manager: &'a ShardKeyLockManager,
    namespace: String,
    key: Vec<u8>,
    guard: Option<EntryGuard>,
}

impl ShardKeyLockGuard<'_> {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Canonical bytes of the locked shard-key document.
    pub fn shard_key_bytes(&self) -> &[u8] {
        &self.key
    }
}

impl Drop for ShardKeyLockGuard<'_> {
    fn drop(&mut self) {
        if let Some(guard) = self.guard.take() {
            drop(guard);
            self.manager.release(&self.namespace, &self.key);
            debug!(namespace = self.namespace.as_str(), "shard key lock released");
        }
    }
}
