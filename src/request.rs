//! Request and response value types shared by every subsystem.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::clock;
use crate::interceptor::REQUEST_ID_HEADER;

/// Replay budget used when a descriptor does not set one.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// HTTP method of an outbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }

    pub fn is_idempotent(&self) -> bool {
        !matches!(self, Method::Post | Method::Patch)
    }

    /// Whether the method changes server state.
    pub fn is_write(&self) -> bool {
        !matches!(self, Method::Get | Method::Head)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Method {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "HEAD" => Ok(Method::Head),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "PATCH" => Ok(Method::Patch),
            "DELETE" => Ok(Method::Delete),
            other => Err(format!("unsupported method '{}'", other)),
        }
    }
}

/// Replay priority inside the offline queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

/// Whether a connectivity failure may park the request in the offline queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePolicy {
    #[default]
    Allow,
    /// Surface the failure immediately (reads that must not wait).
    FailFast,
}

/// A single outbound call, immutable once it has been enqueued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestDescriptor {
    pub id: Uuid,
    pub service_name: String,
    pub method: Method,
    pub path: String,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
    #[serde(default)]
    pub priority: Priority,
    pub idempotency_key: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
    pub max_retries: u32,
    pub version: Option<String>,
    /// Lookup key for the batch loader of this service.
    #[serde(default)]
    pub batch_key: Option<String>,
    /// Resource addressed by this request; replay order is kept per resource.
    #[serde(default)]
    pub target_key: Option<String>,
    #[serde(default)]
    pub queue_policy: QueuePolicy,
    /// Caller-side time budget in milliseconds.
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

impl RequestDescriptor {
    pub fn new(service_name: impl Into<String>, method: Method, path: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            service_name: service_name.into(),
            method,
            path: path.into(),
            query: BTreeMap::new(),
            headers: BTreeMap::new(),
            body: None,
            priority: Priority::Normal,
            idempotency_key: None,
            created_at: clock::epoch_ms(),
            max_retries: DEFAULT_MAX_RETRIES,
            version: None,
            batch_key: None,
            target_key: None,
            queue_policy: QueuePolicy::Allow,
            deadline_ms: None,
        }
    }

    pub fn get(service_name: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(service_name, Method::Get, path)
    }

    pub fn post(service_name: impl Into<String>, path: impl Into<String>, body: Value) -> Self {
        Self::new(service_name, Method::Post, path).with_body(body)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_batch_key(mut self, key: impl Into<String>) -> Self {
        self.batch_key = Some(key.into());
        self
    }

    pub fn with_target_key(mut self, key: impl Into<String>) -> Self {
        self.target_key = Some(key.into());
        self
    }

    pub fn with_created_at(mut self, created_at: u64) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn with_deadline_ms(mut self, deadline_ms: u64) -> Self {
        self.deadline_ms = Some(deadline_ms);
        self
    }

    pub fn fail_fast(mut self) -> Self {
        self.queue_policy = QueuePolicy::FailFast;
        self
    }

    /// Key under which identical in-flight calls are coalesced. Two requests
    /// only share a key when they would put the same bytes on the wire, so
    /// the negotiated version and every header except the per-request id are
    /// part of it.
    pub fn dedup_key(&self) -> String {
        let version = self.version.as_deref().unwrap_or_default();
        let headers = self
            .headers
            .iter()
            .filter(|(name, _)| name.as_str() != REQUEST_ID_HEADER)
            .map(|(k, v)| format!("{}:{}", k, v))
            .collect::<Vec<_>>()
            .join(";");
        if let Some(key) = &self.idempotency_key {
            return format!("idem:{}:{}@{}[{}]", self.service_name, key, version, headers);
        }
        let query = self
            .query
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        let body = self.body.as_ref().map(Value::to_string).unwrap_or_default();
        format!(
            "req:{}:{} {}?{}#{}@{}[{}]",
            self.service_name, self.method, self.path, query, body, version, headers
        )
    }

    /// Resource key used to keep same-resource replays in submission order.
    pub fn resource_key(&self) -> String {
        match &self.target_key {
            Some(key) => key.clone(),
            None => format!("{}:{}", self.service_name, self.path),
        }
    }
}

/// Response handed back to callers after the pipeline ran.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16, body: Vec<u8>) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body,
        }
    }

    /// A 200 response carrying a JSON value.
    pub fn json_value(value: &Value) -> Self {
        let mut response = Self::new(200, value.to_string().into_bytes());
        response
            .headers
            .insert("content-type".to_string(), "application/json".to_string());
        response
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dedup_key_prefers_idempotency_key() {
        let a = RequestDescriptor::post("users", "/users", json!({"name": "a"}))
            .with_idempotency_key("create-a");
        let b = RequestDescriptor::post("users", "/users", json!({"name": "b"}))
            .with_idempotency_key("create-a");
        assert_eq!(a.dedup_key(), b.dedup_key());
    }

    #[test]
    fn test_dedup_key_distinguishes_body() {
        let a = RequestDescriptor::post("users", "/users", json!({"name": "a"}));
        let b = RequestDescriptor::post("users", "/users", json!({"name": "b"}));
        assert_ne!(a.dedup_key(), b.dedup_key());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_dedup_key_distinguishes_version_and_headers() {
        let v1 = RequestDescriptor::get("users", "/users/1").with_version("1");
        let v2 = RequestDescriptor::get("users", "/users/1").with_version("2");
        assert_ne!(v1.dedup_key(), v2.dedup_key());

        let alice = v1.clone().with_header("Authorization", "Bearer alice");
        let bob = v1.clone().with_header("Authorization", "Bearer bob");
        assert_ne!(alice.dedup_key(), bob.dedup_key());

        let a = v1.clone().with_header(REQUEST_ID_HEADER, "a");
        let b = v1.clone().with_header(REQUEST_ID_HEADER, "b");
        assert_eq!(a.dedup_key(), b.dedup_key());
    }

    #[test]
    fn test_resource_key_falls_back_to_path() {
        let req = RequestDescriptor::get("users", "/users/1");
        assert_eq!(req.resource_key(), "users:/users/1");
        assert_eq!(req.with_target_key("user:1").resource_key(), "user:1");
    }

    #[test]
    fn test_method_parsing() {
        assert_eq!("patch".parse::<Method>().unwrap(), Method::Patch);
        assert!("TRACE".parse::<Method>().is_err());
        assert!(!Method::Post.is_idempotent());
        assert!(Method::Put.is_idempotent());
        assert!(Method::Delete.is_write());
        assert!(!Method::Head.is_write());
    }
}
