//! Per-key fetch barrier: under N concurrent misses for the same key, the
//! fetcher runs exactly once and every waiter observes the same result.
//!
//! Grounded in the "Singleflight across cache misses" design note: a map of
//! `{once, result}` entries guarded by a mutex, implemented here with
//! `tokio::sync::broadcast` standing in for the "once" primitive.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};

use crate::error::{Error, Result};

struct InFlight<V> {
    tx: broadcast::Sender<std::result::Result<V, String>>,
}

pub struct SingleFlight<K, V> {
    inflight: Mutex<HashMap<K, InFlight<V>>>,
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `fetch` for `key`, coalescing concurrent callers. Only one
    /// caller per key actually invokes `fetch`; the rest await its result.
    pub async fn run<F, Fut>(&self, key: K, fetch: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<V>>,
    {
        let mut guard = self.inflight.lock().await;
        if let Some(inflight) = guard.get(&key) {
            let mut rx = inflight.tx.subscribe();
            drop(guard);
            return match rx.recv().await {
                Ok(Ok(v)) => Ok(v),
                Ok(Err(msg)) => Err(Error::Internal(msg)),
                Err(_) => Err(Error::Internal("singleflight sender dropped".into())),
            };
        }

        let (tx, _rx) = broadcast::channel(1);
        guard.insert(key.clone(), InFlight { tx: tx.clone() });
        drop(guard);

        let outcome = fetch().await;
        let broadcast_result = match &outcome {
            Ok(v) => Ok(v.clone()),
            Err(e) => Err(e.to_string()),
        };
        let _ = tx.send(broadcast_result);

        let mut guard = self.inflight.lock().await;
        guard.remove(&key);
        drop(guard);

        outcome
    }
}

pub type SharedSingleFlight<K, V> = Arc<SingleFlight<K, V>>;
