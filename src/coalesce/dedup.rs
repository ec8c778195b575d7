//! In-flight request deduplication.
//!
//! Identical requests (same dedup key) arriving while a call is in flight
//! share its result instead of hitting the transport again. Non-idempotent
//! methods only coalesce when the caller supplied an idempotency key.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};

use crate::error::{ErrorKind, ServiceError, ServiceResult, Stage};
use crate::observability::metrics;
use crate::request::{RequestDescriptor, Response};

type SharedCall = Shared<BoxFuture<'static, ServiceResult<Response>>>;

#[derive(Default)]
pub struct Deduplicator {
    inflight: Arc<DashMap<String, (u64, SharedCall)>>,
    next_slot: AtomicU64,
}

impl std::fmt::Debug for Deduplicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deduplicator")
            .field("inflight", &self.inflight.len())
            .finish()
    }
}

/// Whether a request may share a result with an identical one.
pub fn is_coalescable(request: &RequestDescriptor) -> bool {
    request.idempotency_key.is_some() || request.method.is_idempotent()
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct calls currently in flight.
    pub fn inflight(&self) -> usize {
        self.inflight.len()
    }

    /// Run `call` unless an identical request is already in flight, in which
    /// case wait for that one instead. `call` is only polled when this caller
    /// starts the slot.
    pub async fn run(
        &self,
        request: &RequestDescriptor,
        call: BoxFuture<'static, ServiceResult<Response>>,
    ) -> ServiceResult<Response> {
        if !is_coalescable(request) {
            return call.await;
        }

        let key = request.dedup_key();
        let shared = match self.inflight.entry(key.clone()) {
            Entry::Occupied(slot) => {
                metrics::record_dedup_hit();
                tracing::debug!(
                    service = %request.service_name,
                    request_id = %request.id,
                    "Joined in-flight request"
                );
                slot.get().1.clone()
            }
            Entry::Vacant(slot) => {
                let id = self.next_slot.fetch_add(1, Ordering::Relaxed);
                let inflight = self.inflight.clone();
                let slot_key = key.clone();
                let handle = tokio::spawn(async move {
                    let result = call.await;
                    inflight.remove_if(&slot_key, |_, (slot_id, _)| *slot_id == id);
                    result
                });

                let origin = request.clone();
                let shared = async move {
                    match handle.await {
                        Ok(result) => result,
                        Err(e) => {
                            tracing::error!(error = %e, "In-flight call task failed");
                            Err(ServiceError::new(ErrorKind::Cancelled, Stage::Dedup, &origin))
                        }
                    }
                }
                .boxed()
                .shared();
                slot.insert((id, shared.clone()));
                shared
            }
        };

        // Joiners report their own request id; the outcome itself is shared.
        shared.await.map_err(|mut e| {
            e.request_id = request.id;
            e
        })
    }
}
