//! Client construction.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use thiserror::Error;

use crate::client::dispatch::EndpointBatchFn;
use crate::client::{Client, ClientInner};
use crate::clock::{Clock, SystemClock};
use crate::coalesce::{BatchFn, BatchLoader, Deduplicator};
use crate::config::loader::ConfigError;
use crate::config::schema::ClientConfig;
use crate::config::validation::validate_config;
use crate::connectivity::Connectivity;
use crate::interceptor::{Interceptor, InterceptorChain};
use crate::optimistic::{LocalState, MergeFn, MutationManager};
use crate::queue::OfflineQueue;
use crate::resilience::{BackoffPolicy, BreakerRegistry, RetryPolicy};
use crate::store::{FileStore, KeyValueStore, MemoryStore, StoreError};
use crate::transport::{HttpTransport, Transport, TransportError};
use crate::version::{VersionNegotiator, VersionTransformer};

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("transport setup failed: {0}")]
    Transport(#[from] TransportError),

    #[error("queue store unavailable: {0}")]
    Store(#[from] StoreError),
}

/// Assembles a [`Client`]. Every collaborator has a production default:
/// reqwest transport, system clock, file store when `queue.store_path` is
/// set (memory otherwise), online connectivity.
pub struct ClientBuilder {
    config: ClientConfig,
    transport: Option<Arc<dyn Transport>>,
    store: Option<Arc<dyn KeyValueStore>>,
    clock: Arc<dyn Clock>,
    connectivity: Connectivity,
    interceptors: InterceptorChain,
    transformers: Vec<(String, Arc<dyn VersionTransformer>)>,
    merge_fn: Option<MergeFn>,
    local_state: LocalState,
    batch_fns: HashMap<String, Arc<dyn BatchFn>>,
}

impl ClientBuilder {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            transport: None,
            store: None,
            clock: Arc::new(SystemClock),
            connectivity: Connectivity::default(),
            interceptors: InterceptorChain::new(),
            transformers: Vec::new(),
            merge_fn: None,
            local_state: LocalState::new(),
            batch_fns: HashMap::new(),
        }
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn connectivity(mut self, connectivity: Connectivity) -> Self {
        self.connectivity = connectivity;
        self
    }

    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn transformer(mut self, version: impl Into<String>, transformer: Arc<dyn VersionTransformer>) -> Self {
        self.transformers.push((version.into(), transformer));
        self
    }

    pub fn merge_fn(mut self, merge_fn: MergeFn) -> Self {
        self.merge_fn = Some(merge_fn);
        self
    }

    pub fn local_state(mut self, state: LocalState) -> Self {
        self.local_state = state;
        self
    }

    /// Batch `service` through a custom loader instead of a configured endpoint.
    pub fn batch_fn(mut self, service: impl Into<String>, batch_fn: Arc<dyn BatchFn>) -> Self {
        self.batch_fns.insert(service.into(), batch_fn);
        self
    }

    pub async fn build(self) -> Result<Client, BuildError> {
        let config = self.config;
        validate_config(&config).map_err(ConfigError::Validation)?;

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(&config.transport)?),
        };
        let store: Arc<dyn KeyValueStore> = match (self.store, &config.queue.store_path) {
            (Some(store), _) => store,
            (None, Some(path)) => Arc::new(FileStore::open(path).await?),
            (None, None) => Arc::new(MemoryStore::new()),
        };
        let queue = OfflineQueue::open(
            store,
            self.clock.clone(),
            BackoffPolicy::from(&config.queue),
            RetryPolicy::from(&config.retry),
        )
        .await?;

        let negotiator = self
            .transformers
            .into_iter()
            .fold(VersionNegotiator::new(config.version.clone()), |n, (version, t)| {
                n.with_transformer(version, t)
            });

        let clock = self.clock;
        let mut batch_fns = self.batch_fns;
        let window = Duration::from_millis(config.batch.window_ms);
        let ttl = config.batch.cache_ttl_ms;
        let endpoints = config.batch.endpoints.clone();

        let inner = Arc::new_cyclic(|weak| {
            for (service, endpoint) in endpoints {
                batch_fns.entry(service.clone()).or_insert_with(|| {
                    Arc::new(EndpointBatchFn {
                        inner: weak.clone(),
                        service,
                        endpoint,
                    }) as Arc<dyn BatchFn>
                });
            }
            let batchers = batch_fns
                .into_iter()
                .map(|(service, batch_fn)| {
                    let loader = BatchLoader::new(service.clone(), window, ttl, clock.clone(), batch_fn);
                    (service, Arc::new(loader))
                })
                .collect();

            ClientInner {
                config: ArcSwap::from_pointee(config),
                transport,
                connectivity: self.connectivity,
                breakers: BreakerRegistry::new(clock.clone()),
                dedup: Deduplicator::new(),
                batchers,
                queue,
                mutations: MutationManager::new(self.local_state, self.merge_fn),
                pending_mutations: DashMap::new(),
                negotiator,
                interceptors: self.interceptors,
            }
        });

        tracing::info!(
            batchers = inner.batchers.len(),
            interceptors = inner.interceptors.len(),
            queued = inner.queue.len(),
            "Client ready"
        );
        Ok(Client { inner })
    }
}
