//! Batch loader.
//!
//! Keys requested within one window are sent to the backend as a single
//! call; each caller receives the value at its key's position in the
//! response. Resolved values may be cached for a TTL.
//!
//! # Lifecycle of a key
//! ```text
//! cached (fresh)    → returned immediately
//! in a dispatched batch → caller joins it
//! otherwise         → added to the collecting batch; the first key of a
//!                     batch starts the window timer
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::error::ErrorKind;
use crate::observability::metrics;

type BatchResult = Result<Value, ErrorKind>;
type Waiter = (u64, oneshot::Sender<BatchResult>);

/// Loads many keys in one backend call.
#[async_trait]
pub trait BatchFn: Send + Sync {
    /// Must return exactly one value per key, in the same order.
    async fn load(&self, keys: Vec<String>) -> Result<Vec<Value>, ErrorKind>;
}

#[derive(Debug)]
struct Resolved {
    value: Value,
    expires_at: u64,
}

#[derive(Debug, Default)]
struct Collecting {
    id: u64,
    order: Vec<String>,
    waiters: HashMap<String, Vec<Waiter>>,
}

#[derive(Debug, Default)]
struct State {
    cache: HashMap<String, Resolved>,
    collecting: Option<Collecting>,
    dispatched: HashMap<String, Vec<Waiter>>,
    next_batch: u64,
}

pub struct BatchLoader {
    service: String,
    window: Duration,
    cache_ttl_ms: u64,
    clock: Arc<dyn Clock>,
    load_fn: Arc<dyn BatchFn>,
    state: Mutex<State>,
    next_waiter: AtomicU64,
}

impl std::fmt::Debug for BatchLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchLoader")
            .field("service", &self.service)
            .field("window", &self.window)
            .field("cache_ttl_ms", &self.cache_ttl_ms)
            .finish()
    }
}

enum Admission {
    Ready(Value),
    Wait(u64, oneshot::Receiver<BatchResult>),
}

impl BatchLoader {
    pub fn new(
        service: impl Into<String>,
        window: Duration,
        cache_ttl_ms: u64,
        clock: Arc<dyn Clock>,
        load_fn: Arc<dyn BatchFn>,
    ) -> Self {
        Self {
            service: service.into(),
            window,
            cache_ttl_ms,
            clock,
            load_fn,
            state: Mutex::new(State::default()),
            next_waiter: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolve `key`, joining the current batch window.
    pub async fn load(self: &Arc<Self>, key: &str) -> Result<Value, ErrorKind> {
        self.load_with_cancel(key, None).await
    }

    /// Like [`BatchLoader::load`]; if `cancel` fires before the batch is sent
    /// the key is withdrawn (when no one else waits on it).
    pub async fn load_with_cancel(
        self: &Arc<Self>,
        key: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value, ErrorKind> {
        let (waiter_id, mut rx) = match self.admit(key) {
            Admission::Ready(value) => return Ok(value),
            Admission::Wait(id, rx) => (id, rx),
        };

        let received = match cancel {
            Some(token) => tokio::select! {
                received = &mut rx => received,
                _ = token.cancelled() => {
                    self.withdraw(key, waiter_id);
                    return Err(ErrorKind::Cancelled);
                }
            },
            None => rx.await,
        };
        received.unwrap_or(Err(ErrorKind::Cancelled))
    }

    fn admit(self: &Arc<Self>, key: &str) -> Admission {
        let now = self.clock.now_ms();
        let waiter_id = self.next_waiter.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let mut state = self.lock();

        let cached = state
            .cache
            .get(key)
            .map(|entry| (entry.expires_at > now, entry.value.clone()));
        match cached {
            Some((true, value)) => return Admission::Ready(value),
            Some((false, _)) => {
                state.cache.remove(key);
            }
            None => {}
        }

        if let Some(waiters) = state.dispatched.get_mut(key) {
            waiters.push((waiter_id, tx));
            return Admission::Wait(waiter_id, rx);
        }

        let start_timer = state.collecting.is_none();
        if start_timer {
            let id = state.next_batch;
            state.next_batch += 1;
            state.collecting = Some(Collecting {
                id,
                ..Collecting::default()
            });
        }
        let Some(batch) = state.collecting.as_mut() else {
            return Admission::Wait(waiter_id, rx);
        };
        let batch_id = batch.id;
        let waiters = batch.waiters.entry(key.to_string()).or_default();
        if waiters.is_empty() {
            batch.order.push(key.to_string());
        }
        waiters.push((waiter_id, tx));
        drop(state);

        if start_timer {
            let loader = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(loader.window).await;
                loader.dispatch(batch_id).await;
            });
        }
        Admission::Wait(waiter_id, rx)
    }

    fn withdraw(&self, key: &str, waiter_id: u64) {
        let mut state = self.lock();
        if let Some(batch) = state.collecting.as_mut() {
            if let Some(waiters) = batch.waiters.get_mut(key) {
                waiters.retain(|(id, _)| *id != waiter_id);
                if waiters.is_empty() {
                    batch.waiters.remove(key);
                    batch.order.retain(|k| k != key);
                    tracing::debug!(service = %self.service, key, "Key withdrawn from batch");
                }
                return;
            }
        }
        // Already sent: only this caller's result is discarded.
        if let Some(waiters) = state.dispatched.get_mut(key) {
            waiters.retain(|(id, _)| *id != waiter_id);
        }
    }

    async fn dispatch(&self, batch_id: u64) {
        let keys = {
            let mut state = self.lock();
            let batch = match state.collecting.take() {
                Some(batch) if batch.id == batch_id => batch,
                other => {
                    state.collecting = other;
                    return;
                }
            };
            for (key, waiters) in batch.waiters {
                state.dispatched.entry(key).or_default().extend(waiters);
            }
            batch.order
        };
        if keys.is_empty() {
            return;
        }

        metrics::record_batch(&self.service, keys.len());
        tracing::debug!(service = %self.service, keys = keys.len(), "Dispatching batch");

        // Own task: a panicking BatchFn must still settle every waiter.
        let load_fn = self.load_fn.clone();
        let batch_keys = keys.clone();
        let loaded = tokio::spawn(async move { load_fn.load(batch_keys).await }).await;
        let outcome = match loaded {
            Ok(Ok(values)) if values.len() == keys.len() => Ok(values),
            Ok(Ok(values)) => Err(ErrorKind::Decode(format!(
                "batch returned {} values for {} keys",
                values.len(),
                keys.len()
            ))),
            Ok(Err(e)) => Err(e),
            Err(e) => {
                tracing::error!(service = %self.service, error = %e, "Batch load task failed");
                Err(ErrorKind::Cancelled)
            }
        };

        let expires_at = self.clock.now_ms().saturating_add(self.cache_ttl_ms);
        let mut state = self.lock();
        match outcome {
            Ok(values) => {
                for (key, value) in keys.into_iter().zip(values) {
                    for (_, tx) in state.dispatched.remove(&key).unwrap_or_default() {
                        let _ = tx.send(Ok(value.clone()));
                    }
                    if self.cache_ttl_ms > 0 {
                        state.cache.insert(key, Resolved { value, expires_at });
                    }
                }
            }
            Err(e) => {
                tracing::warn!(service = %self.service, error = %e, "Batch load failed");
                for key in keys {
                    for (_, tx) in state.dispatched.remove(&key).unwrap_or_default() {
                        let _ = tx.send(Err(e.clone()));
                    }
                }
            }
        }
    }

    /// Drop a cached value so the next load goes to the backend.
    pub fn invalidate(&self, key: &str) -> bool {
        self.lock().cache.remove(key).is_some()
    }

    pub fn invalidate_all(&self) {
        self.lock().cache.clear();
    }
}
