//! Keyed request coalescing.
//!
//! At most one operation per key is outstanding; concurrent callers for the
//! same key await the same result. The operation runs as its own tokio task,
//! so it completes even when every caller stops waiting, and it removes its
//! map entry the moment it settles so the key can be retried.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

pub type Flight<T> = Shared<BoxFuture<'static, T>>;

pub struct SingleFlight<K, T> {
    inflight: Arc<Mutex<HashMap<K, Flight<T>>>>,
}

impl<K, T> Clone for SingleFlight<K, T> {
    fn clone(&self) -> Self {
        Self {
            inflight: Arc::clone(&self.inflight),
        }
    }
}

impl<K, T> Default for SingleFlight<K, T> {
    fn default() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K, T> SingleFlight<K, T>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Clone + Default + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// The outstanding operation for `key`, if any.
    pub fn in_flight(&self, key: &K) -> Option<Flight<T>> {
        self.inflight.lock().get(key).cloned()
    }

    pub fn is_running(&self, key: &K) -> bool {
        self.inflight.lock().contains_key(key)
    }

    /// Attach to the outstanding operation for `key`, or start `make()` as
    /// the new one.
    pub async fn run<F, Fut>(&self, key: K, make: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let flight = {
            let mut map = self.inflight.lock();
            match map.get(&key) {
                Some(f) => f.clone(),
                None => {
                    let work = make();
                    let registry = Arc::clone(&self.inflight);
                    let k = key.clone();
                    // The entry is inserted below while this lock is still
                    // held, so the task cannot remove it before it exists.
                    let handle = tokio::spawn(async move {
                        let out = work.await;
                        registry.lock().remove(&k);
                        out
                    });
                    let f = async move {
                        match handle.await {
                            Ok(v) => v,
                            Err(e) => {
                                tracing::error!("single_flight: task failed: {e}");
                                T::default()
                            }
                        }
                    }
                    .boxed()
                    .shared();
                    map.insert(key, f.clone());
                    f
                }
            }
        };
        flight.await
    }
}
