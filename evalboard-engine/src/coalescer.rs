// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Request coalescing
//!
//! Individual key lookups are grouped into one remote call per scope and
//! resolution window:
//!
//! ```text
//! submit(scope, "s1") ─┐
//! submit(scope, "s2") ─┼─> [open batch] ──tick──> loader.load(["s1", "s2"])
//! submit(scope, "s1") ─┘         (deduplicated)            │
//!                                                          ▼
//!                                   {s1: Some(..), s2: None} fanned out
//! ```
//!
//! - One open batch per scope. It is dispatched once one of its waiters is
//!   first polled, on the next scheduler tick or after the configured
//!   window, so a synchronous run of submits always lands in one batch.
//! - A key that is already pending or in flight reuses the same shared
//!   result, so identical concurrent requests cost one round trip.
//! - Every submitted key settles: keys the loader did not return map to `None`.
//! - A failed load rejects every waiter of that load with the same error.
//!   With several partitions only the failing partition's keys are
//!   rejected. Nothing is retried here.
//! - Invalidating a scope drops its batcher. Batches already dispatched run
//!   to completion but are never reused.
//! - A scope with nothing open or in flight is dropped once its last batch
//!   settles.

use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Fetches a batch of keys for one scope
#[async_trait]
pub trait BatchLoader: Send + Sync + 'static {
    type Value: Clone + Send + Sync + 'static;

    /// Backing partition of a key. Keys of different partitions are loaded
    /// with separate remote calls within the same dispatch.
    fn partition(&self, _scope: &str, _key: &str) -> Option<String> {
        None
    }

    /// Load the given keys. Keys absent from the returned map resolve to `None`.
    async fn load(
        &self,
        scope: &str,
        partition: Option<&str>,
        keys: Vec<String>,
    ) -> EngineResult<HashMap<String, Self::Value>>;
}

/// Per-key outcome; the outer error only reports a batch that never ran
type BatchOutput<V> = Result<Arc<HashMap<String, EngineResult<Option<V>>>>, EngineError>;
type SharedBatch<V> = Shared<BoxFuture<'static, BatchOutput<V>>>;

struct OpenBatch<V> {
    id: u64,
    keys: BTreeSet<String>,
    result: SharedBatch<V>,
    tx: oneshot::Sender<BatchOutput<V>>,
    dispatched: bool,
}

struct ScopeState<V> {
    open: Option<OpenBatch<V>>,
    /// Keys of open and dispatched batches, tagged with their batch id
    in_flight: HashMap<String, (u64, SharedBatch<V>)>,
    /// Removed from the scope map; submits must look the scope up again
    retired: bool,
}

struct ScopeBatcher<V> {
    scope: String,
    state: Mutex<ScopeState<V>>,
}

impl<V> ScopeBatcher<V> {
    fn new(scope: &str) -> Self {
        Self {
            scope: scope.to_string(),
            state: Mutex::new(ScopeState {
                open: None,
                in_flight: HashMap::new(),
                retired: false,
            }),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    deduplicated: AtomicU64,
    batches: AtomicU64,
    remote_calls: AtomicU64,
    failures: AtomicU64,
}

/// Coalescer statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoalescerStats {
    pub submitted: u64,
    pub deduplicated: u64,
    pub batches: u64,
    pub remote_calls: u64,
    pub failures: u64,
    pub scopes: usize,
}

type Scopes<V> = Arc<DashMap<String, Arc<ScopeBatcher<V>>>>;

/// Everything a batch needs to dispatch itself on first poll
struct Launch<L: BatchLoader> {
    loader: Arc<L>,
    scopes: Scopes<L::Value>,
    batcher: Arc<ScopeBatcher<L::Value>>,
    counters: Arc<Counters>,
    window: Duration,
    id: u64,
}

impl<L: BatchLoader> Launch<L> {
    /// Spawn the batch's dispatch unless it already started or settled
    fn start(self) {
        let start = {
            let mut state = self.batcher.state.lock();
            match state.open.as_mut() {
                Some(open) if open.id == self.id && !open.dispatched => {
                    open.dispatched = true;
                    true
                }
                _ => false,
            }
        };
        if start {
            tokio::spawn(dispatch(self));
        }
    }
}

/// Groups per-key requests into batched loads
pub struct RequestCoalescer<L: BatchLoader> {
    loader: Arc<L>,
    scopes: Scopes<L::Value>,
    window: Duration,
    next_batch_id: AtomicU64,
    counters: Arc<Counters>,
}

impl<L: BatchLoader> RequestCoalescer<L> {
    pub fn new(loader: L, window: Duration) -> Self {
        Self::with_shared_loader(Arc::new(loader), window)
    }

    pub fn with_shared_loader(loader: Arc<L>, window: Duration) -> Self {
        Self {
            loader,
            scopes: Arc::new(DashMap::new()),
            window,
            next_batch_id: AtomicU64::new(1),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Request one key.
    ///
    /// Registration happens immediately, so every call made before the
    /// batch is dispatched joins it. Dispatch starts when a returned future
    /// is first polled, which must happen within a Tokio runtime.
    pub fn submit(
        &self,
        scope: &str,
        key: &str,
    ) -> impl Future<Output = EngineResult<Option<L::Value>>> + Send + 'static {
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);

        let (batcher, id, shared) = loop {
            let batcher = self
                .scopes
                .entry(scope.to_string())
                .or_insert_with(|| Arc::new(ScopeBatcher::new(scope)))
                .clone();

            let mut state = batcher.state.lock();
            if state.retired {
                continue;
            }
            let pending = state.in_flight.get(key).cloned();
            let (id, shared) = match pending {
                Some(pending) => {
                    self.counters.deduplicated.fetch_add(1, Ordering::Relaxed);
                    pending
                }
                None => {
                    let joined = state.open.as_mut().map(|open| {
                        open.keys.insert(key.to_string());
                        (open.id, open.result.clone())
                    });
                    let (id, result) = match joined {
                        Some(entry) => entry,
                        None => {
                            let open = self.open_batch(key);
                            let entry = (open.id, open.result.clone());
                            state.open = Some(open);
                            entry
                        }
                    };
                    state.in_flight.insert(key.to_string(), (id, result.clone()));
                    (id, result)
                }
            };
            drop(state);
            break (batcher, id, shared);
        };

        let launch = Launch {
            loader: Arc::clone(&self.loader),
            scopes: Arc::clone(&self.scopes),
            batcher,
            counters: Arc::clone(&self.counters),
            window: self.window,
            id,
        };
        let key = key.to_string();
        async move {
            launch.start();
            let results = shared.await?;
            match results.get(&key) {
                Some(outcome) => outcome.clone(),
                None => Ok(None),
            }
        }
    }

    fn open_batch(&self, first_key: &str) -> OpenBatch<L::Value> {
        let id = self.next_batch_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel::<BatchOutput<L::Value>>();
        let result = rx
            .map(|received| received.unwrap_or(Err(EngineError::BatchCancelled)))
            .boxed()
            .shared();

        OpenBatch {
            id,
            keys: BTreeSet::from([first_key.to_string()]),
            result,
            tx,
            dispatched: false,
        }
    }

    /// Drop the batcher of one scope
    pub fn invalidate(&self, scope: &str) {
        if self.scopes.remove(scope).is_some() {
            debug!(scope, "Invalidated batch scope");
        }
    }

    pub fn stats(&self) -> CoalescerStats {
        CoalescerStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            deduplicated: self.counters.deduplicated.load(Ordering::Relaxed),
            batches: self.counters.batches.load(Ordering::Relaxed),
            remote_calls: self.counters.remote_calls.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            scopes: self.scopes.len(),
        }
    }
}

async fn dispatch<L: BatchLoader>(launch: Launch<L>) {
    let Launch {
        loader,
        scopes,
        batcher,
        counters,
        window,
        id,
    } = launch;

    if window.is_zero() {
        tokio::task::yield_now().await;
    } else {
        tokio::time::sleep(window).await;
    }

    let batch = {
        let mut state = batcher.state.lock();
        match state.open.take() {
            Some(open) if open.id == id => open,
            other => {
                state.open = other;
                return;
            }
        }
    };

    counters.batches.fetch_add(1, Ordering::Relaxed);
    let keys: Vec<String> = batch.keys.into_iter().collect();
    debug!(scope = %batcher.scope, batch = id, keys = keys.len(), "Dispatching batch");

    let settled = load_partitions(loader.as_ref(), &batcher.scope, id, keys, &counters).await;

    {
        let mut state = batcher.state.lock();
        // Settled batches are never joined again
        state.in_flight.retain(|_, (batch_id, _)| *batch_id != id);
        if state.open.is_none() && state.in_flight.is_empty() {
            let removed = scopes
                .remove_if(&batcher.scope, |_, current| Arc::ptr_eq(current, &batcher))
                .is_some();
            state.retired = removed;
        }
    }
    let _ = batch.tx.send(Ok(Arc::new(settled)));
}

async fn load_partitions<L: BatchLoader>(
    loader: &L,
    scope: &str,
    batch: u64,
    keys: Vec<String>,
    counters: &Counters,
) -> HashMap<String, EngineResult<Option<L::Value>>> {
    let mut partitions: BTreeMap<Option<String>, Vec<String>> = BTreeMap::new();
    for key in keys {
        partitions
            .entry(loader.partition(scope, &key))
            .or_default()
            .push(key);
    }

    counters
        .remote_calls
        .fetch_add(partitions.len() as u64, Ordering::Relaxed);
    let loads = partitions
        .iter()
        .map(|(partition, keys)| loader.load(scope, partition.as_deref(), keys.clone()));
    let loaded = futures::future::join_all(loads).await;

    let mut settled = HashMap::new();
    for ((partition, keys), outcome) in partitions.into_iter().zip(loaded) {
        match outcome {
            Ok(mut found) => {
                for key in keys {
                    let value = found.remove(&key);
                    settled.insert(key, Ok(value));
                }
            }
            Err(e) => {
                counters.failures.fetch_add(1, Ordering::Relaxed);
                warn!(scope, batch, partition = ?partition, error = %e, "Batch load failed");
                for key in keys {
                    settled.insert(key, Err(e.clone()));
                }
            }
        }
    }
    settled
}
