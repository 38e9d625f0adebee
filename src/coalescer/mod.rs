//! Request coalescing for config-metadata queries.
//!
//! Concurrent callers asking for the same namespace's metadata are grouped:
//! the first caller (the leader) executes the backing query while the rest
//! wait on its result. A follower whose wait slice expires with no query in
//! flight promotes itself to leader; a follower whose version is too far from
//! the group's, or that would overflow the group, opts out and runs the query
//! independently. Waiter state is co-owned by the caller and the group, so a
//! caller that gave up (timeout, shutdown) can never invalidate the leader's
//! result distribution.

use crate::config::CoalescerConfig;
use crate::error::DocshardError;
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

type Outcome<T> = Result<Arc<Vec<T>>, DocshardError>;

/// Completion state shared between one caller and its group.
///
/// The group stores the outcome under the registry lock and then
/// release-stores `done`; the caller acquire-loads `done` before reading.
/// Either side may outlive the other.
struct WaiterState<T> {
    done: AtomicBool,
    outcome: Mutex<Option<Outcome<T>>>,
}

impl<T> WaiterState<T> {
    fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
            outcome: Mutex::new(None),
        }
    }
}

struct CoalescingGroup<T> {
    /// Stamp detecting registry-slot reuse: a participant holding only the
    /// namespace can tell whether the group it sees is still its own.
    generation: u64,
    min_version: u64,
    max_version: u64,
    query_in_progress: bool,
    query_completed: bool,
    waiters: Vec<Arc<WaiterState<T>>>,
}

struct Registry<T> {
    shutdown: bool,
    next_generation: u64,
    groups: HashMap<String, CoalescingGroup<T>>,
}

#[derive(Default)]
struct StatsCells {
    total_requests: AtomicU64,
    actual_queries: AtomicU64,
    coalesced_requests: AtomicU64,
    timeout_requests: AtomicU64,
    overflow_requests: AtomicU64,
    version_gap_skipped_requests: AtomicU64,
    active_groups: AtomicU64,
}

/// Snapshot of coalescer counters. Serializes to the diagnostics document
/// with the camelCase field names the wire surface documents.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoalescerStats {
    pub total_requests: u64,
    pub actual_queries: u64,
    pub coalesced_requests: u64,
    pub timeout_requests: u64,
    pub overflow_requests: u64,
    pub version_gap_skipped_requests: u64,
    pub active_groups: u64,
    pub coalescing_rate: f64,
}

impl CoalescerStats {
    pub fn to_document(&self) -> bson::Document {
        bson::to_document(self).expect("stats serialize")
    }
}

enum Admission {
    Lead,
    Join(u64),
    VersionGap,
    Overflow,
}

/// Per-namespace leader/follower coalescer. Generic over the metadata row
/// type; the config server instantiates it with raw chunk documents.
pub struct QueryCoalescer<T> {
    config: CoalescerConfig,
    registry: Mutex<Registry<T>>,
    cv: Condvar,
    stats: StatsCells,
}

impl<T> Default for QueryCoalescer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> QueryCoalescer<T> {
    pub fn new() -> Self {
        Self::with_config(CoalescerConfig::default())
    }

    pub fn with_config(config: CoalescerConfig) -> Self {
        Self {
            config,
            registry: Mutex::new(Registry {
                shutdown: false,
                next_generation: 0,
                groups: HashMap::new(),
            }),
            cv: Condvar::new(),
            stats: StatsCells::default(),
        }
    }

    pub fn config(&self) -> &CoalescerConfig {
        &self.config
    }

    /// Coalesce a metadata query for `namespace` at `request_version`.
    ///
    /// At most one concurrent execution of `query_fn` runs per live
    /// namespace group; every participant of a completed group receives the
    /// same shared result. Returns the query result, or
    /// `deadline_exceeded` / `shutdown_in_progress` when the caller could not
    /// be served.
    pub fn try_coalesce<F>(
        &self,
        namespace: &str,
        request_version: u64,
        query_fn: F,
    ) -> Result<Arc<Vec<T>>, DocshardError>
    where
        F: FnOnce() -> Result<Vec<T>, DocshardError>,
    {
        let mut registry = self.registry.lock();
        if registry.shutdown {
            return Err(shutdown_error());
        }
        self.stats.total_requests.fetch_add(1, Ordering::Relaxed);

        let waiter = Arc::new(WaiterState::new());

        let admission = match registry.groups.get_mut(namespace) {
            None => Admission::Lead,
            Some(group) => {
                let new_min = group.min_version.min(request_version);
                let new_max = group.max_version.max(request_version);
                if new_max - new_min > self.config.max_version_gap {
                    Admission::VersionGap
                } else if group.waiters.len() >= self.config.max_waiters_per_group {
                    Admission::Overflow
                } else {
                    group.min_version = new_min;
                    group.max_version = new_max;
                    group.waiters.push(Arc::clone(&waiter));
                    Admission::Join(group.generation)
                }
            }
        };

        match admission {
            Admission::Lead => self.lead(registry, namespace, request_version, waiter, query_fn),
            Admission::Join(generation) => {
                self.follow(registry, namespace, generation, waiter, query_fn)
            }
            Admission::VersionGap => {
                drop(registry);
                self.stats
                    .version_gap_skipped_requests
                    .fetch_add(1, Ordering::Relaxed);
                self.stats.actual_queries.fetch_add(1, Ordering::Relaxed);
                debug!(
                    namespace,
                    request_version, "version gap too large, executing independent query"
                );
                query_fn().map(Arc::new)
            }
            Admission::Overflow => {
                drop(registry);
                self.stats.overflow_requests.fetch_add(1, Ordering::Relaxed);
                self.stats.actual_queries.fetch_add(1, Ordering::Relaxed);
                debug!(namespace, "group overflow, executing independent query");
                query_fn().map(Arc::new)
            }
        }
    }

    fn lead<F>(
        &self,
        mut registry: MutexGuard<'_, Registry<T>>,
        namespace: &str,
        request_version: u64,
        waiter: Arc<WaiterState<T>>,
        query_fn: F,
    ) -> Result<Arc<Vec<T>>, DocshardError>
    where
        F: FnOnce() -> Result<Vec<T>, DocshardError>,
    {
        registry.next_generation += 1;
        let generation = registry.next_generation;
        registry.groups.insert(
            namespace.to_string(),
            CoalescingGroup {
                generation,
                min_version: request_version,
                max_version: request_version,
                query_in_progress: true,
                query_completed: false,
                waiters: vec![Arc::clone(&waiter)],
            },
        );
        self.stats
            .active_groups
            .store(registry.groups.len() as u64, Ordering::Relaxed);
        drop(registry);

        debug!(namespace, generation, "coalescer leader executing query");
        let query_result = query_fn();
        self.stats.actual_queries.fetch_add(1, Ordering::Relaxed);

        let registry = self.registry.lock();
        if registry.shutdown {
            return Err(shutdown_error());
        }
        self.distribute(registry, namespace, generation, query_result.map(Arc::new));

        self.consume(&waiter, false)
    }

    fn follow<F>(
        &self,
        mut registry: MutexGuard<'_, Registry<T>>,
        namespace: &str,
        generation: u64,
        waiter: Arc<WaiterState<T>>,
        query_fn: F,
    ) -> Result<Arc<Vec<T>>, DocshardError>
    where
        F: FnOnce() -> Result<Vec<T>, DocshardError>,
    {
        let mut query_fn = Some(query_fn);
        let start = Instant::now();
        let max_total = self.config.max_total_wait;

        loop {
            let elapsed = start.elapsed();
            if elapsed >= max_total {
                if let Some(group) = registry.groups.get_mut(namespace) {
                    if group.generation == generation {
                        group.waiters.retain(|w| !Arc::ptr_eq(w, &waiter));
                    }
                }
                drop(registry);
                self.stats.timeout_requests.fetch_add(1, Ordering::Relaxed);
                return Err(DocshardError::DeadlineExceeded(format!(
                    "coalescing wait timed out for {namespace}"
                )));
            }

            let slice = self.config.max_wait.min(max_total - elapsed);
            let timed_out = self.cv.wait_for(&mut registry, slice).timed_out();

            if waiter.done.load(Ordering::Acquire) || registry.shutdown {
                break;
            }

            if !timed_out {
                continue;
            }

            // A slice expired with no query running and no result: the group
            // lost its leader. Take over.
            let mut promoted = false;
            if let Some(group) = registry.groups.get_mut(namespace) {
                if group.generation == generation
                    && !group.query_in_progress
                    && !group.query_completed
                {
                    group.query_in_progress = true;
                    group.waiters.retain(|w| !Arc::ptr_eq(w, &waiter));
                    promoted = true;
                }
            }
            if !promoted {
                continue;
            }

            let Some(run_query) = query_fn.take() else {
                break;
            };
            debug!(namespace, generation, "follower promoted to leader");
            drop(registry);
            let query_result = run_query();
            self.stats.actual_queries.fetch_add(1, Ordering::Relaxed);

            let reacquired = self.registry.lock();
            if reacquired.shutdown {
                return Err(shutdown_error());
            }
            let outcome = query_result.map(Arc::new);
            self.distribute(reacquired, namespace, generation, outcome.clone());
            // The promoted caller answers from its own query, not the waiter.
            return outcome;
        }

        let shutdown = registry.shutdown;
        drop(registry);
        if waiter.done.load(Ordering::Acquire) {
            return self.consume(&waiter, true);
        }
        if shutdown {
            return Err(shutdown_error());
        }
        self.consume(&waiter, true)
    }

    /// Write `outcome` into every waiter of the group and erase it, provided
    /// the registry still holds the generation the caller worked for.
    fn distribute(
        &self,
        mut registry: MutexGuard<'_, Registry<T>>,
        namespace: &str,
        generation: u64,
        outcome: Outcome<T>,
    ) {
        let matches = registry
            .groups
            .get(namespace)
            .is_some_and(|g| g.generation == generation);
        if matches {
            if let Some(mut group) = registry.groups.remove(namespace) {
                group.query_completed = true;
                for w in &group.waiters {
                    *w.outcome.lock() = Some(outcome.clone());
                    w.done.store(true, Ordering::Release);
                }
                self.stats
                    .active_groups
                    .store(registry.groups.len() as u64, Ordering::Relaxed);
            }
        }
        // On a generation mismatch the group was rebuilt while the query ran;
        // whoever erased the old group already served its waiters.
        drop(registry);
        self.cv.notify_all();
    }

    /// Read the caller's own waiter state. A waiter whose group vanished
    /// without delivering gets an empty OK result.
    fn consume(
        &self,
        waiter: &WaiterState<T>,
        follower: bool,
    ) -> Result<Arc<Vec<T>>, DocshardError> {
        if waiter.done.load(Ordering::Acquire) {
            if let Some(outcome) = waiter.outcome.lock().take() {
                if follower && !matches!(outcome, Err(DocshardError::ShutdownInProgress(_))) {
                    self.stats.coalesced_requests.fetch_add(1, Ordering::Relaxed);
                }
                return outcome;
            }
        }
        if follower {
            self.stats.coalesced_requests.fetch_add(1, Ordering::Relaxed);
        }
        Ok(Arc::new(Vec::new()))
    }

    pub fn get_stats(&self) -> CoalescerStats {
        let total = self.stats.total_requests.load(Ordering::Relaxed);
        let coalesced = self.stats.coalesced_requests.load(Ordering::Relaxed);
        CoalescerStats {
            total_requests: total,
            actual_queries: self.stats.actual_queries.load(Ordering::Relaxed),
            coalesced_requests: coalesced,
            timeout_requests: self.stats.timeout_requests.load(Ordering::Relaxed),
            overflow_requests: self.stats.overflow_requests.load(Ordering::Relaxed),
            version_gap_skipped_requests: self
                .stats
                .version_gap_skipped_requests
                .load(Ordering::Relaxed),
            active_groups: self.stats.active_groups.load(Ordering::Relaxed),
            coalescing_rate: if total > 0 {
                coalesced as f64 / total as f64
            } else {
                0.0
            },
        }
    }

    pub fn reset_stats(&self) {
        self.stats.total_requests.store(0, Ordering::Relaxed);
        self.stats.actual_queries.store(0, Ordering::Relaxed);
        self.stats.coalesced_requests.store(0, Ordering::Relaxed);
        self.stats.timeout_requests.store(0, Ordering::Relaxed);
        self.stats.overflow_requests.store(0, Ordering::Relaxed);
        self.stats
            .version_gap_skipped_requests
            .store(0, Ordering::Relaxed);
    }

    /// Flag shutdown, deliver a shutdown status to every queued waiter
    /// through the co-owned state, clear the registry, and wake everyone.
    /// Idempotent.
    pub fn shutdown(&self) {
        let mut registry = self.registry.lock();
        if registry.shutdown {
            return;
        }
        registry.shutdown = true;
        for (_, group) in registry.groups.drain() {
            for w in group.waiters {
                *w.outcome.lock() = Some(Err(shutdown_error()));
                w.done.store(true, Ordering::Release);
            }
        }
        self.stats.active_groups.store(0, Ordering::Relaxed);
        drop(registry);
        self.cv.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.registry.lock().shutdown
    }
}

impl<T> Drop for QueryCoalescer<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn shutdown_error() -> DocshardError {
    DocshardError::ShutdownInProgress("query coalescer is shutting down".into())
}
