//! # Request Coalescing
//!
//! Collapses concurrent calls for the same key into one execution. The first caller for a
//! key registers a shared future; callers arriving while it is in flight await a clone of
//! it instead of starting their own. The registry lock is held only while looking up or
//! inserting an entry, never across the underlying I/O.
//!
//! The entry is removed once the leading caller finishes (or is dropped), so the next call
//! after completion starts a fresh execution. Results are not cached here.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

use crate::error::ArgusResult;

type SharedCall<V> = Shared<BoxFuture<'static, ArgusResult<V>>>;

struct InFlight<V> {
    generation: u64,
    call: SharedCall<V>,
}

type Registry<K, V> = Arc<Mutex<HashMap<K, InFlight<V>>>>;

pub struct RequestCoalescer<K, V> {
    in_flight: Registry<K, V>,
    generations: AtomicU64,
}

impl<K, V> std::fmt::Debug for RequestCoalescer<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCoalescer")
            .field("in_flight", &self.in_flight.lock().len())
            .finish()
    }
}

impl<K, V> Default for RequestCoalescer<K, V> {
    fn default() -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            generations: AtomicU64::new(0),
        }
    }
}

/// Removes the leader's registry entry when the leader finishes or is cancelled.
struct LeaderGuard<K: Eq + Hash, V> {
    registry: Registry<K, V>,
    key: K,
    generation: u64,
}

impl<K: Eq + Hash, V> Drop for LeaderGuard<K, V> {
    fn drop(&mut self) {
        let mut registry = self.registry.lock();
        if registry
            .get(&self.key)
            .is_some_and(|entry| entry.generation == self.generation)
        {
            registry.remove(&self.key);
        }
    }
}

impl<K, V> RequestCoalescer<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `make()` for `key`, or join the execution already in flight for it.
    ///
    /// Returns the result and whether it was shared from another caller's execution.
    pub async fn run<F, Fut>(&self, key: K, make: F) -> (ArgusResult<V>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ArgusResult<V>> + Send + 'static,
    {
        let (call, guard) = {
            let mut registry = self.in_flight.lock();
            match registry.get(&key) {
                Some(existing) => (existing.call.clone(), None),
                None => {
                    let generation = self.generations.fetch_add(1, Ordering::Relaxed);
                    let call = make().boxed().shared();
                    registry.insert(
                        key.clone(),
                        InFlight {
                            generation,
                            call: call.clone(),
                        },
                    );
                    let guard = LeaderGuard {
                        registry: Arc::clone(&self.in_flight),
                        key,
                        generation,
                    };
                    (call, Some(guard))
                }
            }
        };

        let shared = guard.is_none();
        let result = call.await;
        drop(guard);
        (result, shared)
    }

    /// Keys with an execution in flight
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }
}
