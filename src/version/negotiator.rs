use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use serde_json::Value;

use crate::config::schema::VersionConfig;
use crate::request::{RequestDescriptor, Response};
use crate::version::{VersionStrategy, VersionTransformer};

pub struct VersionNegotiator {
    config: ArcSwap<VersionConfig>,
    transformers: HashMap<String, Arc<dyn VersionTransformer>>,
    negotiated: DashMap<String, String>,
}

impl std::fmt::Debug for VersionNegotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionNegotiator")
            .field("config", &self.config.load_full())
            .field("transformers", &self.transformers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl VersionNegotiator {
    pub fn new(config: VersionConfig) -> Self {
        Self {
            config: ArcSwap::from_pointee(config),
            transformers: HashMap::new(),
            negotiated: DashMap::new(),
        }
    }

    pub fn with_transformer(
        mut self,
        version: impl Into<String>,
        transformer: Arc<dyn VersionTransformer>,
    ) -> Self {
        self.transformers.insert(version.into(), transformer);
        self
    }

    pub fn reconfigure(&self, config: VersionConfig) {
        self.config.store(Arc::new(config));
    }

    pub fn negotiated_version(&self, service: &str) -> Option<String> {
        self.negotiated.get(service).map(|v| v.value().clone())
    }

    /// Version a request to `service` goes out with.
    pub fn version_for(&self, request: &RequestDescriptor) -> String {
        if let Some(version) = &request.version {
            return version.clone();
        }
        self.negotiated_version(&request.service_name)
            .unwrap_or_else(|| self.config.load().client_version.clone())
    }

    /// Stamp the version onto `request` and convert its body. Returns the
    /// version used.
    pub fn rewrite_request(&self, request: &mut RequestDescriptor) -> String {
        let version = self.version_for(request);
        let config = self.config.load();

        match &config.strategy {
            VersionStrategy::Header { name } => {
                request
                    .headers
                    .insert(name.to_ascii_lowercase(), version.clone());
            }
            VersionStrategy::Query { param } => {
                request.query.insert(param.clone(), version.clone());
            }
            VersionStrategy::Path => {
                let prefix = format!("/v{}", version);
                let already = request.path == prefix || request.path.starts_with(&format!("{}/", prefix));
                if !already {
                    let rest = request.path.trim_start_matches('/');
                    request.path = format!("{}/{}", prefix, rest);
                }
            }
            VersionStrategy::MediaType { base } => {
                request
                    .headers
                    .insert("accept".to_string(), format!("{}; version={}", base, version));
            }
        }

        if let Some(transformer) = self.transformers.get(&version) {
            request.body = request.body.take().map(|body| transformer.request(body));
        }
        request.version = Some(version.clone());
        version
    }

    /// Convert a response body received for `version`. Bodies that are not
    /// JSON pass through untouched.
    pub fn transform_response(&self, version: &str, mut response: Response) -> Response {
        let Some(transformer) = self.transformers.get(version) else {
            return response;
        };
        if response.body.is_empty() {
            return response;
        }
        let Ok(body) = serde_json::from_slice::<Value>(&response.body) else {
            return response;
        };
        response.body = transformer.response(body).to_string().into_bytes();
        response
    }

    /// Remember the version a service advertised on a successful response.
    pub fn observe(&self, service: &str, response: &Response) {
        if !response.is_success() {
            return;
        }
        let config = self.config.load();
        let Some(header) = &config.advertise_header else {
            return;
        };
        let Some(advertised) = response.header(header) else {
            return;
        };
        let advertised = advertised.trim();
        if advertised.is_empty() {
            return;
        }
        let previous = self
            .negotiated
            .insert(service.to_string(), advertised.to_string());
        if previous.as_deref() != Some(advertised) {
            tracing::info!(service, version = advertised, "Negotiated API version");
        }
    }
}
