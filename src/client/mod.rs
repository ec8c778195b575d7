//! Client facade.
//!
//! # Data Flow
//! ```text
//! execute(descriptor)
//!     → interceptors.on_request
//!     → version negotiator (stamp version, convert body)
//!     → offline, or an earlier write to the same resource still queued?
//!       queue it behind (unless fail-fast)
//!     → batch loader (batch_key + endpoint) or deduplicator
//!     → dispatch.rs: circuit breaker → transport (bounded by timeouts)
//!     → success: convert body, learn version, interceptors.on_response
//!     → failure: queue if offline (or circuit open, when configured),
//!                otherwise interceptors.on_error
//! ```
//!
//! # Design Decisions
//! - The client owns every registry; nothing is global
//! - Live configuration sits in an `ArcSwap`; reloads never block requests
//! - Queued replays bypass the interceptor request hooks: the descriptor was
//!   already rewritten when it was enqueued

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use futures_util::FutureExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::coalesce::{BatchLoader, Deduplicator};
use crate::config::schema::ClientConfig;
use crate::config::validation::{validate_config, ValidationError};
use crate::connectivity::Connectivity;
use crate::error::{ErrorKind, ServiceError, ServiceResult, Stage};
use crate::interceptor::{ErrorDisposition, InterceptorChain};
use crate::optimistic::{
    ConflictStrategy, LocalState, MutationContext, MutationError, MutationManager,
};
use crate::queue::{DrainReport, OfflineQueue, QueueEntry, QueueEvent, QueueStats};
use crate::request::{QueuePolicy, RequestDescriptor, Response};
use crate::resilience::{BackoffPolicy, BreakerRegistry, CircuitState, RetryPolicy};
use crate::store::StoreError;
use crate::transport::Transport;
use crate::version::VersionNegotiator;

mod background;
mod builder;
mod dispatch;

pub use builder::{BuildError, ClientBuilder};

/// Result of [`Client::execute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecuteOutcome {
    Completed(Response),
    /// Parked in the offline queue; replayed later.
    Queued { entry_id: Uuid },
}

impl ExecuteOutcome {
    pub fn response(&self) -> Option<&Response> {
        match self {
            ExecuteOutcome::Completed(response) => Some(response),
            ExecuteOutcome::Queued { .. } => None,
        }
    }

    pub fn into_response(self) -> Option<Response> {
        match self {
            ExecuteOutcome::Completed(response) => Some(response),
            ExecuteOutcome::Queued { .. } => None,
        }
    }
}

/// Result of [`Client::mutate`].
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
    Committed {
        context: MutationContext,
        response: Response,
    },
    /// The request was queued; the speculative value stays applied until the
    /// replay commits it or the entry becomes a dead letter.
    Pending {
        entry_id: Uuid,
        context: MutationContext,
    },
}

pub(crate) struct ClientInner {
    pub(crate) config: ArcSwap<ClientConfig>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) connectivity: Connectivity,
    pub(crate) breakers: BreakerRegistry,
    pub(crate) dedup: Deduplicator,
    pub(crate) batchers: HashMap<String, Arc<BatchLoader>>,
    pub(crate) queue: OfflineQueue,
    pub(crate) mutations: MutationManager,
    /// Mutations waiting on a queued request, keyed by request id.
    pub(crate) pending_mutations: DashMap<Uuid, MutationContext>,
    pub(crate) negotiator: VersionNegotiator,
    pub(crate) interceptors: InterceptorChain,
}

/// Resilient client for outbound service calls. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("online", &self.inner.connectivity.is_online())
            .field("queue", &self.inner.queue.stats())
            .field("batchers", &self.inner.batchers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Client {
    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder::new(config)
    }

    pub fn config(&self) -> Arc<ClientConfig> {
        self.inner.config.load_full()
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.inner.connectivity
    }

    /// Local state the optimistic mutations write into.
    pub fn state(&self) -> &LocalState {
        self.inner.mutations.state()
    }

    pub fn mutations(&self) -> &MutationManager {
        &self.inner.mutations
    }

    pub fn subscribe_queue(&self) -> tokio::sync::broadcast::Receiver<QueueEvent> {
        self.inner.queue.subscribe()
    }

    /// Run `request` through the full pipeline.
    pub async fn execute(&self, request: RequestDescriptor) -> ServiceResult<ExecuteOutcome> {
        self.run(request, None).await
    }

    /// Like [`Client::execute`], giving up when `cancel` fires. A request
    /// still collecting in a batch window is withdrawn; one already sent
    /// completes in the background and only this caller's result is dropped.
    pub async fn execute_with_cancel(
        &self,
        request: RequestDescriptor,
        cancel: CancellationToken,
    ) -> ServiceResult<ExecuteOutcome> {
        self.run(request, Some(cancel)).await
    }

    async fn run(
        &self,
        mut request: RequestDescriptor,
        cancel: Option<CancellationToken>,
    ) -> ServiceResult<ExecuteOutcome> {
        let inner = &self.inner;
        inner.interceptors.on_request(&mut request);
        let version = inner.negotiator.rewrite_request(&mut request);

        if request.queue_policy == QueuePolicy::Allow {
            if !inner.connectivity.is_online() {
                return self.park(request).await;
            }
            // A live write must not overtake a queued one for the same resource.
            if request.method.is_write() && inner.queue.has_pending_for(&request.resource_key()) {
                tracing::debug!(
                    request_id = %request.id,
                    resource = %request.resource_key(),
                    "Earlier write still queued, queueing behind it"
                );
                return self.park(request).await;
            }
        }

        match self.deliver(&request, cancel.as_ref()).await {
            Ok(response) => {
                let mut response = inner.negotiator.transform_response(&version, response);
                inner.negotiator.observe(&request.service_name, &response);
                inner.interceptors.on_response(&request, &mut response);
                Ok(ExecuteOutcome::Completed(response))
            }
            Err(error) => {
                if request.queue_policy == QueuePolicy::Allow && self.should_queue(&error) {
                    tracing::info!(
                        request_id = %request.id,
                        service = %request.service_name,
                        error = %error,
                        "Queueing failed request"
                    );
                    return self.park(request).await;
                }
                match inner.interceptors.on_error(&request, &error) {
                    ErrorDisposition::Handled(response) => Ok(ExecuteOutcome::Completed(response)),
                    ErrorDisposition::UseDefault => Err(error),
                }
            }
        }
    }

    async fn deliver(
        &self,
        request: &RequestDescriptor,
        cancel: Option<&CancellationToken>,
    ) -> ServiceResult<Response> {
        let inner = &self.inner;
        if let Some(key) = &request.batch_key {
            if let Some(loader) = inner.batchers.get(&request.service_name) {
                let value = loader
                    .load_with_cancel(key, cancel)
                    .await
                    .map_err(|kind| ServiceError::new(kind, Stage::Batch, request))?;
                return Ok(Response::json_value(&value));
            }
        }

        let call = {
            let inner = self.inner.clone();
            let request = request.clone();
            async move { dispatch::dispatch(&inner, &request).await }.boxed()
        };
        let shared = inner.dedup.run(request, call);
        match cancel {
            Some(token) => tokio::select! {
                result = shared => result,
                _ = token.cancelled() => {
                    Err(ServiceError::new(ErrorKind::Cancelled, Stage::Dedup, request))
                }
            },
            None => shared.await,
        }
    }

    fn should_queue(&self, error: &ServiceError) -> bool {
        if error.kind.is_connectivity() && !self.inner.connectivity.is_online() {
            return true;
        }
        error.is_circuit_open() && self.inner.config.load().queue.queue_on_open_circuit
    }

    async fn park(&self, request: RequestDescriptor) -> ServiceResult<ExecuteOutcome> {
        match self.inner.queue.enqueue(request.clone()).await {
            Ok(entry_id) => Ok(ExecuteOutcome::Queued { entry_id }),
            Err(e) => Err(ServiceError::new(
                ErrorKind::Store(e.to_string()),
                Stage::Queue,
                &request,
            )),
        }
    }

    /// Apply `speculative` to `target_key` locally, then send `request`.
    /// Success commits the server's value, failure rolls back, and a queued
    /// request leaves the mutation pending until its replay settles.
    pub async fn mutate(
        &self,
        target_key: &str,
        speculative: Value,
        request: RequestDescriptor,
        strategy: ConflictStrategy,
    ) -> ServiceResult<MutationOutcome> {
        let mutations = &self.inner.mutations;
        let mut context = mutations
            .begin(target_key, speculative, strategy)
            .map_err(|e| mutation_error(e, &request))?;

        let request = match request.target_key {
            Some(_) => request,
            None => request.with_target_key(target_key),
        };
        let origin = request.clone();

        match self.execute(request).await {
            Ok(ExecuteOutcome::Completed(response)) => {
                mutations
                    .commit(&mut context, response_value(&response))
                    .map_err(|e| mutation_error(e, &origin))?;
                Ok(MutationOutcome::Committed { context, response })
            }
            Ok(ExecuteOutcome::Queued { entry_id }) => {
                self.inner.pending_mutations.insert(entry_id, context.clone());
                Ok(MutationOutcome::Pending { entry_id, context })
            }
            Err(error) => {
                if let Err(e) = mutations.rollback(&mut context) {
                    tracing::warn!(error = %e, "Rollback after failed mutation was refused");
                }
                Err(error)
            }
        }
    }

    /// Replay due queue entries now. Does nothing while offline.
    pub async fn process_queue(&self) -> Result<DrainReport, StoreError> {
        if !self.inner.connectivity.is_online() {
            tracing::debug!("Offline, queue drain skipped");
            return Ok(DrainReport::default());
        }
        let inner = self.inner.clone();
        let report = self
            .inner
            .queue
            .drain(|entry| dispatch::replay(inner.clone(), entry))
            .await?;

        for id in &report.dead_lettered {
            if let Some((_, mut context)) = self.inner.pending_mutations.remove(id) {
                if let Err(e) = self.inner.mutations.rollback(&mut context) {
                    tracing::warn!(entry_id = %id, error = %e, "Could not roll back mutation");
                }
            }
        }
        Ok(report)
    }

    pub fn get_queue_stats(&self) -> QueueStats {
        self.inner.queue.stats()
    }

    pub fn queue_entries(&self) -> Vec<QueueEntry> {
        self.inner.queue.entries()
    }

    pub fn dead_letters(&self) -> Vec<QueueEntry> {
        self.inner.queue.dead_letters()
    }

    pub async fn retry_dead_letter(&self, id: &Uuid) -> Result<bool, StoreError> {
        self.inner.queue.retry_dead_letter(id).await
    }

    pub async fn discard_dead_letter(&self, id: &Uuid) -> Result<Option<QueueEntry>, StoreError> {
        self.inner.queue.discard(id).await
    }

    pub fn get_circuit_state(&self, service: &str) -> CircuitState {
        let config = self.inner.config.load().breaker.for_service(service);
        self.inner.breakers.get_or_create(service, config).snapshot()
    }

    pub fn circuit_states(&self) -> Vec<CircuitState> {
        self.inner.breakers.snapshots()
    }

    /// Version last advertised by `service`, if any.
    pub fn negotiated_version(&self, service: &str) -> Option<String> {
        self.inner.negotiator.negotiated_version(service)
    }

    /// Drop a cached batch result. Returns whether anything was cached.
    pub fn invalidate_batch_key(&self, key: &str) -> bool {
        self.inner
            .batchers
            .values()
            .fold(false, |found, loader| loader.invalidate(key) || found)
    }

    /// Validate and apply a new configuration. Breaker thresholds, backoff,
    /// retry classification and version settings take effect immediately;
    /// batch endpoints are fixed at build time.
    pub fn reload_config(&self, config: ClientConfig) -> Result<(), Vec<ValidationError>> {
        validate_config(&config)?;
        let inner = &self.inner;
        inner.breakers.reconfigure(|service| config.breaker.for_service(service));
        inner.queue.reconfigure(
            BackoffPolicy::from(&config.queue),
            RetryPolicy::from(&config.retry),
        );
        inner.negotiator.reconfigure(config.version.clone());
        inner.config.store(Arc::new(config));
        tracing::info!("Client configuration reloaded");
        Ok(())
    }
}

fn mutation_error(error: MutationError, request: &RequestDescriptor) -> ServiceError {
    let kind = match error {
        MutationError::Conflict(key) => ErrorKind::Conflict(key),
        other => ErrorKind::Invalid(other.to_string()),
    };
    ServiceError::new(kind, Stage::Mutation, request)
}

/// Server-confirmed value carried by a response, if it has a JSON body.
pub(crate) fn response_value(response: &Response) -> Option<Value> {
    if response.body.is_empty() {
        return None;
    }
    response.json().ok()
}
