//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use resilient_client::clock::ManualClock;
use resilient_client::connectivity::Connectivity;
use resilient_client::store::KeyValueStore;
use resilient_client::transport::{Transport, TransportError, TransportRequest, TransportResponse};
use resilient_client::{Client, ClientConfig};

pub const BASE_URL: &str = "http://svc.test";

/// What the scripted transport does with one request.
#[derive(Debug, Clone)]
pub enum Scripted {
    Respond(u16, String),
    Fail(TransportError),
}

type Handler = Arc<dyn Fn(&TransportRequest) -> Scripted + Send + Sync>;

/// In-process transport: answers from a script, then from a handler or a
/// fixed fallback. Records every request it sees.
pub struct ScriptedTransport {
    calls: AtomicUsize,
    requests: Mutex<Vec<TransportRequest>>,
    script: Mutex<VecDeque<Scripted>>,
    fallback: Mutex<Scripted>,
    handler: Mutex<Option<Handler>>,
    delay: Mutex<Duration>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(Scripted::Respond(200, "{}".to_string())),
            handler: Mutex::new(None),
            delay: Mutex::new(Duration::ZERO),
        })
    }

    pub fn push(&self, step: Scripted) {
        self.script.lock().unwrap().push_back(step);
    }

    pub fn respond_with(&self, status: u16, body: &str) {
        *self.fallback.lock().unwrap() = Scripted::Respond(status, body.to_string());
    }

    pub fn fail_with(&self, error: TransportError) {
        *self.fallback.lock().unwrap() = Scripted::Fail(error);
    }

    pub fn handle_with(&self, handler: impl Fn(&TransportRequest) -> Scripted + Send + Sync + 'static) {
        *self.handler.lock().unwrap() = Some(Arc::new(handler));
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<TransportRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn bodies(&self) -> Vec<serde_json::Value> {
        self.requests()
            .iter()
            .filter_map(|r| r.body.as_ref())
            .map(|b| serde_json::from_slice(b).unwrap())
            .collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());

        let step = self.script.lock().unwrap().pop_front();
        let step = match step {
            Some(step) => step,
            None => {
                let handler = self.handler.lock().unwrap().clone();
                match handler {
                    Some(handler) => handler(&request),
                    None => self.fallback.lock().unwrap().clone(),
                }
            }
        };

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match step {
            Scripted::Respond(status, body) => {
                let mut headers = std::collections::BTreeMap::new();
                headers.insert("content-type".to_string(), "application/json".to_string());
                Ok(TransportResponse {
                    status,
                    headers,
                    body: body.into_bytes(),
                })
            }
            Scripted::Fail(error) => Err(error),
        }
    }
}

pub fn refused() -> TransportError {
    TransportError::Connect("connection refused".to_string())
}

/// Config pointing every service at [`BASE_URL`], with deterministic backoff.
pub fn test_config() -> ClientConfig {
    let mut config = ClientConfig::default();
    config.transport.default_base_url = Some(BASE_URL.to_string());
    config.queue.base_delay_ms = 100;
    config.queue.max_delay_ms = 10_000;
    config.queue.jitter = false;
    config
}

pub struct Harness {
    pub client: Client,
    pub transport: Arc<ScriptedTransport>,
    pub clock: Arc<ManualClock>,
    pub connectivity: Connectivity,
}

pub async fn harness(config: ClientConfig) -> Harness {
    harness_with_store(config, None).await
}

pub async fn harness_with_store(config: ClientConfig, store: Option<Arc<dyn KeyValueStore>>) -> Harness {
    let transport = ScriptedTransport::new();
    let clock = Arc::new(ManualClock::new(0));
    let connectivity = Connectivity::new(true);
    let mut builder = Client::builder(config)
        .transport(transport.clone())
        .clock(clock.clone())
        .connectivity(connectivity.clone());
    if let Some(store) = store {
        builder = builder.store(store);
    }
    Harness {
        client: builder.build().await.unwrap(),
        transport,
        clock,
        connectivity,
    }
}

/// Start a programmable HTTP backend on an ephemeral port. Each request is
/// answered with the `(status, body)` produced by `f`.
pub async fn start_programmable_backend<F, Fut>(f: F) -> SocketAddr
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (u16, String)> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let f = Arc::new(f);

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    let f = f.clone();
                    tokio::spawn(async move {
                        let mut buf = [0u8; 4096];
                        let _ = socket.read(&mut buf).await;
                        let (status, body) = f().await;
                        let status_text = match status {
                            200 => "200 OK",
                            404 => "404 Not Found",
                            429 => "429 Too Many Requests",
                            500 => "500 Internal Server Error",
                            502 => "502 Bad Gateway",
                            503 => "503 Service Unavailable",
                            _ => "200 OK",
                        };

                        let response = format!(
                            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nX-Api-Version: 2\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            status_text,
                            body.len(),
                            body
                        );
                        let _ = socket.write_all(response.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });
    addr
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}
