//! Interceptor pipeline.
//!
//! Interceptors run in registration order around every executed request:
//! `on_request` before version negotiation, `on_response` after the
//! response was transformed, `on_error` when the pipeline fails. The first
//! interceptor that handles an error wins.

use std::sync::Arc;

use crate::error::ServiceError;
use crate::request::{RequestDescriptor, Response};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// Replace the error with this response.
    Handled(Response),
    /// Let the error propagate.
    UseDefault,
}

pub trait Interceptor: Send + Sync {
    fn on_request(&self, _request: &mut RequestDescriptor) {}

    fn on_response(&self, _request: &RequestDescriptor, _response: &mut Response) {}

    fn on_error(&self, _request: &RequestDescriptor, _error: &ServiceError) -> ErrorDisposition {
        ErrorDisposition::UseDefault
    }
}

#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl std::fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("len", &self.interceptors.len())
            .finish()
    }
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, interceptor: Arc<dyn Interceptor>) {
        self.interceptors.push(interceptor);
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub fn on_request(&self, request: &mut RequestDescriptor) {
        for interceptor in &self.interceptors {
            interceptor.on_request(request);
        }
    }

    pub fn on_response(&self, request: &RequestDescriptor, response: &mut Response) {
        for interceptor in &self.interceptors {
            interceptor.on_response(request, response);
        }
    }

    pub fn on_error(&self, request: &RequestDescriptor, error: &ServiceError) -> ErrorDisposition {
        for interceptor in &self.interceptors {
            if let ErrorDisposition::Handled(response) = interceptor.on_error(request, error) {
                tracing::debug!(
                    request_id = %request.id,
                    error = %error,
                    "Error handled by interceptor"
                );
                return ErrorDisposition::Handled(response);
            }
        }
        ErrorDisposition::UseDefault
    }
}

/// Attaches a caller-supplied bearer credential.
#[derive(Clone)]
pub struct BearerAuth {
    token: String,
}

impl std::fmt::Debug for BearerAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BearerAuth").field("token", &"<redacted>").finish()
    }
}

impl BearerAuth {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }
}

impl Interceptor for BearerAuth {
    fn on_request(&self, request: &mut RequestDescriptor) {
        request
            .headers
            .entry("authorization".to_string())
            .or_insert_with(|| format!("Bearer {}", self.token));
    }
}

/// Sends the request id as `x-request-id` so server logs can be correlated.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestIdHeader;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

impl Interceptor for RequestIdHeader {
    fn on_request(&self, request: &mut RequestDescriptor) {
        let id = request.id.to_string();
        request
            .headers
            .entry(REQUEST_ID_HEADER.to_string())
            .or_insert(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, Stage};

    struct Fallback(u16);

    impl Interceptor for Fallback {
        fn on_error(&self, _request: &RequestDescriptor, _error: &ServiceError) -> ErrorDisposition {
            ErrorDisposition::Handled(Response::new(self.0, vec![]))
        }
    }

    #[test]
    fn test_request_interceptors_run_in_order() {
        let mut chain = InterceptorChain::new();
        chain.push(Arc::new(BearerAuth::new("t0k")));
        chain.push(Arc::new(RequestIdHeader));

        let mut req = RequestDescriptor::get("users", "/users");
        chain.on_request(&mut req);
        assert_eq!(req.headers["authorization"], "Bearer t0k");
        assert_eq!(req.headers[REQUEST_ID_HEADER], req.id.to_string());
    }

    #[test]
    fn test_first_handler_wins() {
        let mut chain = InterceptorChain::new();
        chain.push(Arc::new(RequestIdHeader));
        chain.push(Arc::new(Fallback(203)));
        chain.push(Arc::new(Fallback(204)));

        let req = RequestDescriptor::get("users", "/users");
        let err = ServiceError::new(ErrorKind::CircuitOpen, Stage::Circuit, &req);
        assert_eq!(
            chain.on_error(&req, &err),
            ErrorDisposition::Handled(Response::new(203, vec![]))
        );
        assert_eq!(InterceptorChain::new().on_error(&req, &err), ErrorDisposition::UseDefault);
    }
}
