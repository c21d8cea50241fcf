//! Shared test helpers for all `#[cfg(test)]` modules in the crate.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;

use crate::api::{ApiError, HttpRequest, HttpResponse, HttpTransport, RequestPipeline};
use crate::auth::SessionState;
use crate::storage::{MemoryStore, KeyValueStore, SESSION_TOKEN_KEY, TOKEN_KEY, USER_KEY};

pub const BASE_URL: &str = "http://fundflow.test";

type Handler = Box<dyn Fn(&HttpRequest) -> Result<HttpResponse, ApiError> + Send + Sync>;

/// Transport answering from a closure and recording every request.
pub struct FakeTransport {
    handler: Handler,
    delay: Duration,
    requests: Mutex<Vec<HttpRequest>>,
}

impl FakeTransport {
    pub fn new<F>(handler: F) -> Arc<Self>
    where
        F: Fn(&HttpRequest) -> Result<HttpResponse, ApiError> + Send + Sync + 'static,
    {
        Self::with_delay(Duration::ZERO, handler)
    }

    /// Every call sleeps for `delay` before answering
    pub fn with_delay<F>(delay: Duration, handler: F) -> Arc<Self>
    where
        F: Fn(&HttpRequest) -> Result<HttpResponse, ApiError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            handler: Box::new(handler),
            delay,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Number of requests whose path (ignoring the query) equals `path`
    pub fn calls_to(&self, path: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| request_path(r) == path)
            .count()
    }
}

#[async_trait]
impl HttpTransport for FakeTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, ApiError> {
        self.requests.lock().unwrap().push(request.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.handler)(&request)
    }
}

pub fn respond(status: u16, body: &str) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::new(StatusCode::from_u16(status).unwrap(), body))
}

pub fn request_path(request: &HttpRequest) -> &str {
    let path = request.url.strip_prefix(BASE_URL).unwrap_or(&request.url);
    path.split('?').next().unwrap_or(path)
}

pub fn bearer(request: &HttpRequest) -> Option<&str> {
    request
        .headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Store pre-populated with a signed-in, non-admin user holding `token`
/// and session credential `sess`.
pub fn signed_in_store(token: &str) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.set(TOKEN_KEY, token).unwrap();
    store.set(SESSION_TOKEN_KEY, "sess").unwrap();
    store.set(USER_KEY, r#"{"id":1,"is_admin":false}"#).unwrap();
    store
}

pub fn pipeline_over(
    store: Arc<MemoryStore>,
    transport: Arc<FakeTransport>,
) -> (SessionState, RequestPipeline) {
    let session = SessionState::load(store);
    let pipeline = RequestPipeline::new(BASE_URL, transport, session.clone());
    (session, pipeline)
}
