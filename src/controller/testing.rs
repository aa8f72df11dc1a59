//! In-process API server for driving controller code in tests
//!
//! [`fake_client`] hands out a [`Client`] whose requests are answered by a
//! routing closure. Every request is logged, and the log is returned once
//! the last clone of the client is dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use http::{Method, Request, Response, StatusCode};
use kube::Client;
use kube::client::Body;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tower_test::mock;

use crate::controller::wait::Clock;

/// One request as the API server saw it
#[derive(Clone, Debug)]
pub struct Exchange {
    pub method: Method,
    pub path: String,
    pub query: String,
    pub body: Value,
}

impl Exchange {
    async fn read(request: Request<Body>) -> Self {
        let method = request.method().clone();
        let path = request.uri().path().to_string();
        let query = request.uri().query().unwrap_or_default().to_string();
        let bytes = request.into_body().collect_bytes().await.unwrap_or_default();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        Self {
            method,
            path,
            query,
            body,
        }
    }

    /// Last path segment, the object name for single-object requests
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or_default()
    }

    pub fn is(&self, method: Method, path_suffix: &str) -> bool {
        self.method == method && self.path.ends_with(path_suffix)
    }

    pub fn is_event(&self) -> bool {
        self.path.contains("/events")
    }
}

/// Answer to one request
pub struct Reply {
    status: StatusCode,
    body: Value,
}

impl Reply {
    pub fn ok(body: impl Serialize) -> Self {
        Self {
            status: StatusCode::OK,
            body: serde_json::to_value(body).unwrap_or(Value::Null),
        }
    }

    /// A list response with `items`
    pub fn list(kind: &str, api_version: &str, items: Vec<Value>) -> Self {
        Self::ok(json!({
            "apiVersion": api_version,
            "kind": kind,
            "metadata": {},
            "items": items,
        }))
    }

    pub fn not_found() -> Self {
        Self::status(StatusCode::NOT_FOUND, "NotFound")
    }

    pub fn server_error() -> Self {
        Self::status(StatusCode::INTERNAL_SERVER_ERROR, "InternalError")
    }

    fn status(status: StatusCode, reason: &str) -> Self {
        Self {
            status,
            body: json!({
                "apiVersion": "v1",
                "kind": "Status",
                "metadata": {},
                "status": "Failure",
                "message": reason,
                "reason": reason,
                "code": status.as_u16(),
            }),
        }
    }

    fn into_response(self) -> Response<Body> {
        let bytes = serde_json::to_vec(&self.body).unwrap_or_default();
        let mut response = Response::new(Body::from(bytes));
        *response.status_mut() = self.status;
        response
    }
}

/// A client served by `route`; the handle yields the request log after the client is gone
pub fn fake_client<F>(mut route: F) -> (Client, JoinHandle<Vec<Exchange>>)
where
    F: FnMut(&Exchange) -> Reply + Send + 'static,
{
    let (service, mut handle) = mock::pair::<Request<Body>, Response<Body>>();
    let server = tokio::spawn(async move {
        let mut log = Vec::new();
        while let Some((request, send)) = handle.next_request().await {
            let exchange = Exchange::read(request).await;
            send.send_response(route(&exchange).into_response());
            log.push(exchange);
        }
        log
    });
    (Client::new(service, "default"), server)
}

/// Clock that moves only when slept on; clones share the same time
#[derive(Clone, Debug)]
pub struct ManualClock {
    start: Instant,
    elapsed_ms: Arc<AtomicU64>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self {
            start: Instant::now(),
            elapsed_ms: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl ManualClock {
    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms.load(Ordering::SeqCst))
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.start + self.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self.elapsed_ms.fetch_add(millis, Ordering::SeqCst);
        tokio::task::yield_now().await;
    }
}
