//! Circuit-gated dispatch of a single request.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use url::Url;

use crate::client::{response_value, ClientInner};
use crate::config::schema::{BatchEndpoint, TransportConfig};
use crate::coalesce::BatchFn;
use crate::error::{ErrorKind, ServiceError, ServiceResult, Stage};
use crate::observability::metrics;
use crate::queue::QueueEntry;
use crate::request::{RequestDescriptor, Response};
use crate::resilience::timeouts::{self, Elapsed};
use crate::resilience::RetryPolicy;
use crate::transport::TransportRequest;

/// Resolve the absolute URL of `request` against its service's base URL.
pub(crate) fn build_url(config: &TransportConfig, request: &RequestDescriptor) -> Result<String, String> {
    let base = config
        .base_url(&request.service_name)
        .ok_or_else(|| format!("no base URL configured for service '{}'", request.service_name))?;
    let mut url = Url::parse(base).map_err(|e| format!("invalid base URL '{}': {}", base, e))?;

    let path = format!(
        "{}/{}",
        url.path().trim_end_matches('/'),
        request.path.trim_start_matches('/')
    );
    url.set_path(&path);
    if !request.query.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (name, value) in &request.query {
            pairs.append_pair(name, value);
        }
    }
    Ok(url.into())
}

/// Send one request through its service's circuit breaker.
pub(crate) async fn dispatch(inner: &ClientInner, request: &RequestDescriptor) -> ServiceResult<Response> {
    let config = inner.config.load_full();
    let service = request.service_name.as_str();

    let url = build_url(&config.transport, request)
        .map_err(|msg| ServiceError::new(ErrorKind::Invalid(msg), Stage::Transport, request).with_attempts(0))?;
    let body = match &request.body {
        Some(body) => Some(
            serde_json::to_vec(body)
                .map_err(|e| ServiceError::new(ErrorKind::Invalid(e.to_string()), Stage::Transport, request).with_attempts(0))?,
        ),
        None => None,
    };
    let mut headers = request.headers.clone();
    if body.is_some() {
        headers
            .entry("content-type".to_string())
            .or_insert_with(|| "application/json".to_string());
    }

    let breaker_config = config.breaker.for_service(service);
    let breaker = inner.breakers.get_or_create(service, breaker_config);
    let Ok(permit) = breaker.acquire() else {
        tracing::debug!(service, request_id = %request.id, "Circuit open, call rejected");
        return Err(ServiceError::new(ErrorKind::CircuitOpen, Stage::Circuit, request));
    };

    let call_timeout = Duration::from_millis(breaker_config.call_timeout_ms);
    let deadline = request
        .deadline_ms
        .map(|ms| tokio::time::Instant::now() + Duration::from_millis(ms));
    let transport_request = TransportRequest {
        method: request.method,
        url,
        headers,
        body,
        timeout: Some(call_timeout),
    };

    tracing::debug!(
        service,
        request_id = %request.id,
        method = %request.method,
        url = %transport_request.url,
        probe = permit.is_probe(),
        "Dispatching request"
    );
    let start = Instant::now();
    let outcome = timeouts::bounded(call_timeout, deadline, inner.transport.send(transport_request)).await;

    match outcome {
        Err(Elapsed::CallTimeout(ms)) => {
            permit.failure();
            metrics::record_request(service, "timeout", start);
            tracing::warn!(service, request_id = %request.id, timeout_ms = ms, "Call timed out");
            Err(ServiceError::new(ErrorKind::Timeout(ms), Stage::Transport, request))
        }
        Err(Elapsed::Deadline) => {
            // The caller gave up; says nothing about the dependency.
            drop(permit);
            metrics::record_request(service, "deadline", start);
            Err(ServiceError::new(ErrorKind::DeadlineExceeded, Stage::Transport, request))
        }
        Ok(Err(e)) => {
            permit.failure();
            metrics::record_request(service, "transport_error", start);
            tracing::warn!(service, request_id = %request.id, error = %e, "Transport failure");
            Err(ServiceError::new(e.into(), Stage::Transport, request))
        }
        Ok(Ok(received)) => {
            let retry = RetryPolicy::from(&config.retry);
            if retry.is_failure_status(received.status) {
                permit.failure();
            } else {
                permit.success();
            }
            let response = Response {
                status: received.status,
                headers: received.headers,
                body: received.body,
            };
            if response.is_success() {
                metrics::record_request(service, "success", start);
                return Ok(response);
            }
            metrics::record_request(service, "status", start);
            tracing::debug!(service, request_id = %request.id, status = response.status, "Error status");
            Err(ServiceError::new(
                ErrorKind::HttpStatus {
                    status: response.status,
                    body: response.text(),
                },
                Stage::Transport,
                request,
            ))
        }
    }
}

/// Replay a queued entry and settle any mutation waiting on it.
pub(crate) async fn replay(inner: Arc<ClientInner>, entry: QueueEntry) -> ServiceResult<Response> {
    let request = &entry.request;
    let response = dispatch(&inner, request)
        .await
        .map_err(|e| e.with_attempts(entry.attempts + 1))?;

    let version = request
        .version
        .clone()
        .unwrap_or_else(|| inner.negotiator.version_for(request));
    let mut response = inner.negotiator.transform_response(&version, response);
    inner.negotiator.observe(&request.service_name, &response);
    inner.interceptors.on_response(request, &mut response);

    if let Some((_, mut context)) = inner.pending_mutations.remove(&request.id) {
        if let Err(e) = inner.mutations.commit(&mut context, response_value(&response)) {
            tracing::warn!(request_id = %request.id, error = %e, "Could not commit replayed mutation");
        }
    }
    Ok(response)
}

/// Batch function backed by a configured service endpoint. The endpoint
/// takes `{"keys": [...]}` and answers with a JSON array in key order.
pub(crate) struct EndpointBatchFn {
    pub(crate) inner: Weak<ClientInner>,
    pub(crate) service: String,
    pub(crate) endpoint: BatchEndpoint,
}

#[async_trait]
impl BatchFn for EndpointBatchFn {
    async fn load(&self, keys: Vec<String>) -> Result<Vec<Value>, ErrorKind> {
        let Some(inner) = self.inner.upgrade() else {
            return Err(ErrorKind::Cancelled);
        };
        let mut request = RequestDescriptor::new(
            self.service.clone(),
            self.endpoint.method,
            self.endpoint.path.clone(),
        )
        .with_body(json!({ "keys": keys }))
        .fail_fast();
        inner.interceptors.on_request(&mut request);
        inner.negotiator.rewrite_request(&mut request);

        let response = dispatch(&inner, &request).await.map_err(|e| e.kind)?;
        response
            .json::<Vec<Value>>()
            .map_err(|e| ErrorKind::Decode(format!("batch response is not a JSON array: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport(default: Option<&str>) -> TransportConfig {
        TransportConfig {
            default_base_url: default.map(str::to_string),
            ..TransportConfig::default()
        }
    }

    #[test]
    fn test_build_url_joins_base_path_and_query() {
        let config = transport(Some("http://api.local/base/"));
        let req = RequestDescriptor::get("users", "/users/1").with_query("v", "2").with_query("a b", "c");
        assert_eq!(
            build_url(&config, &req).unwrap(),
            "http://api.local/base/users/1?a+b=c&v=2"
        );
    }

    #[test]
    fn test_build_url_requires_base() {
        let req = RequestDescriptor::get("users", "/users");
        assert!(build_url(&transport(None), &req).unwrap_err().contains("users"));
    }
}
