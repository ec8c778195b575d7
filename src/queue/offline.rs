//! Durable offline queue.
//!
//! Requests that could not be delivered are persisted under `queue/<id>`
//! and replayed later. The in-memory index mirrors the store; every state
//! change is written through before the next replay starts.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::join_all;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{ErrorKind, ServiceError, ServiceResult, Stage};
use crate::observability::metrics;
use crate::queue::entry::{
    store_key, DrainReport, EntryStatus, QueueEntry, QueueEvent, QueueStats, ENTRY_PREFIX,
};
use crate::request::{RequestDescriptor, Response};
use crate::resilience::{BackoffPolicy, RetryPolicy};
use crate::store::{KeyValueStore, StoreError};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug)]
struct Index {
    entries: HashMap<Uuid, QueueEntry>,
    next_sequence: u64,
}

#[derive(Debug, Clone)]
struct Policies {
    backoff: BackoffPolicy,
    retry: RetryPolicy,
}

pub struct OfflineQueue {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    index: Mutex<Index>,
    policies: Mutex<Policies>,
    draining: tokio::sync::Mutex<()>,
    events: broadcast::Sender<QueueEvent>,
}

impl std::fmt::Debug for OfflineQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineQueue")
            .field("stats", &self.stats())
            .finish()
    }
}

/// Outcome of one replay, decided under the index lock.
enum Settled {
    Replayed,
    Rescheduled,
    DeadLettered,
}

impl OfflineQueue {
    /// Load persisted entries and return a queue ready for work.
    /// Entries caught mid-replay by a crash are demoted to `Pending`.
    pub async fn open(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        backoff: BackoffPolicy,
        retry: RetryPolicy,
    ) -> Result<Self, StoreError> {
        let mut entries = HashMap::new();
        let mut next_sequence = 0;
        let mut demoted = Vec::new();

        for (key, bytes) in store.list_by_prefix(ENTRY_PREFIX).await? {
            let mut entry: QueueEntry = match serde_json::from_slice(&bytes) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::error!(key = %key, error = %e, "Skipping unreadable queue entry");
                    continue;
                }
            };
            match entry.status {
                EntryStatus::Done => {
                    store.delete(&key).await?;
                    continue;
                }
                EntryStatus::InFlight => {
                    entry.status = EntryStatus::Pending;
                    demoted.push(entry.clone());
                }
                EntryStatus::Pending | EntryStatus::Failed => {}
            }
            next_sequence = next_sequence.max(entry.sequence + 1);
            entries.insert(entry.id(), entry);
        }

        for entry in &demoted {
            store.put(&store_key(&entry.id()), serde_json::to_vec(entry)?).await?;
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let queue = Self {
            store,
            clock,
            index: Mutex::new(Index {
                entries,
                next_sequence,
            }),
            policies: Mutex::new(Policies { backoff, retry }),
            draining: tokio::sync::Mutex::new(()),
            events,
        };

        let stats = queue.stats();
        tracing::info!(
            pending = stats.pending,
            failed = stats.failed,
            demoted = demoted.len(),
            "Offline queue loaded"
        );
        metrics::record_queue_depth(stats.pending);
        Ok(queue)
    }

    fn lock(&self) -> MutexGuard<'_, Index> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn policies(&self) -> Policies {
        self.policies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Swap backoff and retry classification for subsequent replays.
    pub fn reconfigure(&self, backoff: BackoffPolicy, retry: RetryPolicy) {
        *self.policies.lock().unwrap_or_else(PoisonError::into_inner) = Policies { backoff, retry };
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: QueueEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn persist(&self, entry: &QueueEntry) -> Result<(), StoreError> {
        self.store
            .put(&store_key(&entry.id()), serde_json::to_vec(entry)?)
            .await
    }

    /// Persist `request` for later replay. The entry id is the request id.
    pub async fn enqueue(&self, request: RequestDescriptor) -> Result<Uuid, StoreError> {
        let now = self.clock.now_ms();
        let entry = {
            let mut index = self.lock();
            let sequence = index.next_sequence;
            index.next_sequence += 1;
            QueueEntry {
                request,
                attempts: 0,
                next_attempt_at: now,
                status: EntryStatus::Pending,
                sequence,
                last_error: None,
            }
        };
        let id = entry.id();
        self.persist(&entry).await?;
        self.lock().entries.insert(id, entry.clone());

        tracing::info!(
            entry_id = %id,
            service = %entry.request.service_name,
            priority = ?entry.request.priority,
            "Request queued for replay"
        );
        metrics::record_queue_depth(self.stats().pending);
        self.emit(QueueEvent::Enqueued { id });
        Ok(id)
    }

    pub fn stats(&self) -> QueueStats {
        let index = self.lock();
        let mut stats = QueueStats::default();
        for entry in index.entries.values() {
            match entry.status {
                EntryStatus::Pending => stats.pending += 1,
                EntryStatus::InFlight => stats.in_flight += 1,
                EntryStatus::Failed => stats.failed += 1,
                EntryStatus::Done => {}
            }
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn get(&self, id: &Uuid) -> Option<QueueEntry> {
        self.lock().entries.get(id).cloned()
    }

    /// Whether a request for `resource_key` is still waiting to be replayed.
    /// Dead letters do not count.
    pub fn has_pending_for(&self, resource_key: &str) -> bool {
        self.lock().entries.values().any(|e| {
            matches!(e.status, EntryStatus::Pending | EntryStatus::InFlight)
                && e.request.resource_key() == resource_key
        })
    }

    /// All entries in replay order.
    pub fn entries(&self) -> Vec<QueueEntry> {
        let mut entries: Vec<_> = self.lock().entries.values().cloned().collect();
        entries.sort_by(replay_order);
        entries
    }

    pub fn dead_letters(&self) -> Vec<QueueEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.status == EntryStatus::Failed)
            .collect()
    }

    /// Give a dead letter a fresh retry budget. Returns false if `id` is not
    /// a dead letter.
    pub async fn retry_dead_letter(&self, id: &Uuid) -> Result<bool, StoreError> {
        let now = self.clock.now_ms();
        let entry = {
            let mut index = self.lock();
            match index.entries.get_mut(id) {
                Some(entry) if entry.status == EntryStatus::Failed => {
                    entry.status = EntryStatus::Pending;
                    entry.attempts = 0;
                    entry.next_attempt_at = now;
                    entry.clone()
                }
                _ => return Ok(false),
            }
        };
        self.persist(&entry).await?;
        tracing::info!(entry_id = %id, "Dead letter requeued");
        metrics::record_queue_depth(self.stats().pending);
        Ok(true)
    }

    /// Drop a dead letter for good.
    pub async fn discard(&self, id: &Uuid) -> Result<Option<QueueEntry>, StoreError> {
        let removed = {
            let mut index = self.lock();
            match index.entries.get(id) {
                Some(entry) if entry.status == EntryStatus::Failed => index.entries.remove(id),
                _ => None,
            }
        };
        if removed.is_some() {
            self.store.delete(&store_key(id)).await?;
            tracing::info!(entry_id = %id, "Dead letter discarded");
        }
        Ok(removed)
    }

    /// Replay every due entry through `replay`.
    ///
    /// Entries are grouped by resource key. Groups run concurrently; inside
    /// a group entries run one at a time in submission order, and the group
    /// stops at the first entry that is not due or must be retried later.
    /// Only one drain runs at a time; a concurrent call returns a `busy`
    /// report immediately.
    pub async fn drain<F, Fut>(&self, replay: F) -> Result<DrainReport, StoreError>
    where
        F: Fn(QueueEntry) -> Fut,
        Fut: Future<Output = ServiceResult<Response>>,
    {
        let Ok(_guard) = self.draining.try_lock() else {
            return Ok(DrainReport {
                busy: true,
                ..DrainReport::default()
            });
        };

        let groups = self.due_groups();
        let replay = &replay;
        let results = join_all(groups.into_iter().map(|group| self.drain_group(group, replay))).await;

        let mut report = DrainReport::default();
        for result in results {
            let part = result?;
            report.replayed.extend(part.replayed);
            report.rescheduled.extend(part.rescheduled);
            report.dead_lettered.extend(part.dead_lettered);
            report.deferred += part.deferred;
        }

        metrics::record_queue_depth(self.stats().pending);
        if !report.is_empty() {
            tracing::info!(
                replayed = report.replayed.len(),
                rescheduled = report.rescheduled.len(),
                dead_lettered = report.dead_lettered.len(),
                deferred = report.deferred,
                "Queue drained"
            );
        }
        Ok(report)
    }

    /// Pending entries grouped by resource, groups ordered by their most
    /// urgent entry, entries inside a group in submission order.
    fn due_groups(&self) -> Vec<Vec<QueueEntry>> {
        let mut pending: Vec<_> = self
            .lock()
            .entries
            .values()
            .filter(|e| e.status == EntryStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(replay_order);

        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<QueueEntry>> = HashMap::new();
        for entry in pending {
            let key = entry.request.resource_key();
            if !groups.contains_key(&key) {
                order.push(key.clone());
            }
            groups.entry(key).or_default().push(entry);
        }

        order
            .into_iter()
            .filter_map(|key| groups.remove(&key))
            .map(|mut group| {
                group.sort_by(|a, b| {
                    (a.request.created_at, a.sequence).cmp(&(b.request.created_at, b.sequence))
                });
                group
            })
            .collect()
    }

    async fn drain_group<F, Fut>(
        &self,
        group: Vec<QueueEntry>,
        replay: &F,
    ) -> Result<DrainReport, StoreError>
    where
        F: Fn(QueueEntry) -> Fut,
        Fut: Future<Output = ServiceResult<Response>>,
    {
        let mut report = DrainReport::default();
        let total = group.len();

        for (position, entry) in group.into_iter().enumerate() {
            let id = entry.id();
            if !entry.is_due(self.clock.now_ms()) {
                report.deferred += total - position;
                break;
            }

            let Some(in_flight) = self.mark(&id, |e| e.status = EntryStatus::InFlight) else {
                // Discarded while we were sorting.
                continue;
            };
            self.persist(&in_flight).await?;

            tracing::debug!(
                entry_id = %id,
                service = %in_flight.request.service_name,
                attempt = in_flight.attempts + 1,
                "Replaying queued request"
            );
            let result = replay(in_flight).await;

            match self.settle(&id, result).await? {
                Settled::Replayed => report.replayed.push(id),
                Settled::DeadLettered => report.dead_lettered.push(id),
                Settled::Rescheduled => {
                    report.rescheduled.push(id);
                    report.deferred += total - position - 1;
                    break;
                }
            }
        }
        Ok(report)
    }

    fn mark(&self, id: &Uuid, change: impl FnOnce(&mut QueueEntry)) -> Option<QueueEntry> {
        let mut index = self.lock();
        let entry = index.entries.get_mut(id)?;
        change(entry);
        Some(entry.clone())
    }

    async fn settle(&self, id: &Uuid, result: ServiceResult<Response>) -> Result<Settled, StoreError> {
        let error = match result {
            Ok(_) => {
                self.lock().entries.remove(id);
                self.store.delete(&store_key(id)).await?;
                tracing::info!(entry_id = %id, "Queued request delivered");
                self.emit(QueueEvent::Replayed { id: *id });
                return Ok(Settled::Replayed);
            }
            Err(error) => error,
        };

        let now = self.clock.now_ms();
        let policies = self.policies();

        // An open circuit says nothing about this request; try again later
        // without spending an attempt.
        if error.is_circuit_open() {
            let Some(entry) = self.mark(id, |e| {
                e.status = EntryStatus::Pending;
                e.last_error = Some(error.to_string());
            }) else {
                return Ok(Settled::Rescheduled);
            };
            self.persist(&entry).await?;
            tracing::debug!(entry_id = %id, "Circuit open, replay postponed");
            return Ok(Settled::Rescheduled);
        }

        let retryable = policies.retry.is_retryable(&error.kind);
        let Some(entry) = self.mark(id, |e| {
            e.attempts += 1;
            e.last_error = Some(error.to_string());
            if retryable && e.attempts <= e.request.max_retries {
                e.status = EntryStatus::Pending;
                e.next_attempt_at = now + policies.backoff.delay_ms(e.attempts);
            } else {
                e.status = EntryStatus::Failed;
            }
        }) else {
            return Ok(Settled::DeadLettered);
        };
        self.persist(&entry).await?;

        if entry.status == EntryStatus::Pending {
            tracing::warn!(
                entry_id = %id,
                service = %entry.request.service_name,
                attempts = entry.attempts,
                next_attempt_at = entry.next_attempt_at,
                error = %error,
                "Replay failed, rescheduled"
            );
            self.emit(QueueEvent::Rescheduled {
                id: *id,
                attempts: entry.attempts,
                next_attempt_at: entry.next_attempt_at,
            });
            return Ok(Settled::Rescheduled);
        }

        metrics::record_dead_letter(&entry.request.service_name);
        if retryable {
            let exhausted = ServiceError::new(ErrorKind::QueueExhausted, Stage::Queue, &entry.request)
                .with_attempts(entry.attempts);
            tracing::error!(
                entry_id = %id,
                service = %entry.request.service_name,
                attempts = entry.attempts,
                last_error = %error,
                "Queued request exhausted its retries"
            );
            self.emit(QueueEvent::Exhausted {
                entry,
                error: exhausted,
            });
        } else {
            tracing::error!(
                entry_id = %id,
                service = %entry.request.service_name,
                error = %error,
                "Queued request rejected"
            );
            self.emit(QueueEvent::Rejected {
                error: error.with_attempts(entry.attempts),
                entry,
            });
        }
        Ok(Settled::DeadLettered)
    }
}

/// Priority first (High before Low), then age, then enqueue order.
fn replay_order(a: &QueueEntry, b: &QueueEntry) -> std::cmp::Ordering {
    b.request
        .priority
        .cmp(&a.request.priority)
        .then(a.request.created_at.cmp(&b.request.created_at))
        .then(a.sequence.cmp(&b.sequence))
}
