//! API version negotiation.
//!
//! # Data Flow
//! ```text
//! Outgoing: pick version (request > negotiated > client default)
//!     → stamp it per strategy (header, query, path prefix, media type)
//!     → transformer.request(body)
//! Incoming: transformer.response(body)
//!     → advertised version cached per service
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod negotiator;

pub use negotiator::VersionNegotiator;

/// Where the version travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VersionStrategy {
    /// `name: <version>` request header.
    Header { name: String },
    /// `?param=<version>` query parameter.
    Query { param: String },
    /// Path prefixed with `/v<version>`.
    Path,
    /// `Accept: <base>; version=<version>`.
    MediaType { base: String },
}

/// Converts JSON bodies between the client's shape and one API version's.
pub trait VersionTransformer: Send + Sync {
    fn request(&self, body: Value) -> Value;

    fn response(&self, body: Value) -> Value;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityTransformer;

impl VersionTransformer for IdentityTransformer {
    fn request(&self, body: Value) -> Value {
        body
    }

    fn response(&self, body: Value) -> Value {
        body
    }
}

type BodyFn = Box<dyn Fn(Value) -> Value + Send + Sync>;

/// Transformer built from a pair of closures.
pub struct FnTransformer {
    request: BodyFn,
    response: BodyFn,
}

impl FnTransformer {
    pub fn new(
        request: impl Fn(Value) -> Value + Send + Sync + 'static,
        response: impl Fn(Value) -> Value + Send + Sync + 'static,
    ) -> Self {
        Self {
            request: Box::new(request),
            response: Box::new(response),
        }
    }
}

impl VersionTransformer for FnTransformer {
    fn request(&self, body: Value) -> Value {
        (self.request)(body)
    }

    fn response(&self, body: Value) -> Value {
        (self.response)(body)
    }
}
