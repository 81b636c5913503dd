//! Shared test doubles for integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use stable_gateway::{
    GatewayItem, HttpTransport, PreparedRequest, Request, TransportError, TransportResponse,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Transport double: per-path status scripts, optional latency, in-flight
/// accounting. Paths without a script answer 200.
pub struct FakeTransport {
    scripts: Mutex<HashMap<String, Vec<u16>>>,
    latency: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::with_latency(Duration::ZERO)
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            latency,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn script(self, path: &str, statuses: &[u16]) -> Self {
        self.scripts.lock().unwrap().insert(path.to_string(), statuses.to_vec());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HttpTransport for FakeTransport {
    async fn send(&self, request: &PreparedRequest) -> Result<TransportResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let status = {
            let mut scripts = self.scripts.lock().unwrap();
            match scripts.get_mut(&request.url) {
                Some(script) if !script.is_empty() => script.remove(0),
                _ => 200,
            }
        };
        if status < 400 {
            Ok(TransportResponse::new(status, json!({ "path": request.url, "status": status })))
        } else {
            Err(TransportError::from_status(status, Value::Null))
        }
    }
}

pub fn item(id: &str, path: &str) -> GatewayItem {
    GatewayItem::request(id, Request::builder("api.example.com").path(path).build())
}
