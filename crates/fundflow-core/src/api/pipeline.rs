//! Authenticated request pipeline.
//!
//! Every call goes out with the stored access token. A 401 triggers at most
//! one token refresh per request; concurrent requests that hit a 401 while a
//! refresh is running join that refresh instead of starting their own. If
//! the refresh produces no token the session is cleared and the request
//! fails as session-terminal.

use std::sync::{Arc, Mutex, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::transport::{HttpRequest, HttpResponse, HttpTransport};
use super::ApiError;
use crate::auth::SessionState;
use crate::models::{RefreshRequest, RefreshResponse};

/// Endpoint that exchanges a session token for a new access token
const REFRESH_ENDPOINT: &str = "/api/auth/refresh";

/// Method, body and extra headers for one call.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    method: Method,
    body: Option<String>,
    headers: HeaderMap,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self::new(Method::GET)
    }
}

impl RequestOptions {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            body: None,
            headers: HeaderMap::new(),
        }
    }

    pub fn get() -> Self {
        Self::new(Method::GET)
    }

    pub fn post() -> Self {
        Self::new(Method::POST)
    }

    pub fn put() -> Self {
        Self::new(Method::PUT)
    }

    pub fn patch() -> Self {
        Self::new(Method::PATCH)
    }

    pub fn delete() -> Self {
        Self::new(Method::DELETE)
    }

    /// Serialize `body` as the JSON request body
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self, ApiError> {
        self.body = Some(serde_json::to_string(body)?);
        Ok(self)
    }

    /// Add a caller header. `Authorization` is overwritten whenever a token
    /// is stored.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }
}

/// Whether a request is the original call or the single retry after a refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    First,
    Retry,
}

type RefreshFuture = Shared<BoxFuture<'static, Option<String>>>;

/// Single-flight slot for the token refresh.
///
/// Holds either nothing or the refresh every concurrent caller awaits. The
/// slot is filled by the first caller and emptied by the refresh itself
/// once it resolves.
#[derive(Default)]
pub struct RefreshCoordinator {
    in_flight: Arc<Mutex<Option<RefreshFuture>>>,
}

impl RefreshCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the running refresh, or start one with `start` if none is running
    pub fn join_or_start<F>(&self, start: F) -> RefreshFuture
    where
        F: FnOnce() -> BoxFuture<'static, Option<String>>,
    {
        let mut slot = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = slot.as_ref() {
            debug!("Joining in-flight token refresh");
            return existing.clone();
        }

        let in_flight = Arc::clone(&self.in_flight);
        let operation = start();
        let shared = async move {
            let token = operation.await;
            in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            token
        }
        .boxed()
        .shared();

        *slot = Some(shared.clone());
        shared
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

struct PipelineInner {
    base_url: String,
    transport: Arc<dyn HttpTransport>,
    session: SessionState,
    refresh: RefreshCoordinator,
}

/// Clone is cheap; clones share the transport, session and refresh slot.
#[derive(Clone)]
pub struct RequestPipeline {
    inner: Arc<PipelineInner>,
}

impl RequestPipeline {
    pub fn new(
        base_url: impl Into<String>,
        transport: Arc<dyn HttpTransport>,
        session: SessionState,
    ) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            inner: Arc::new(PipelineInner {
                base_url,
                transport,
                session,
                refresh: RefreshCoordinator::new(),
            }),
        }
    }

    pub fn session(&self) -> &SessionState {
        &self.inner.session
    }

    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    /// Send an authorized request.
    ///
    /// Returns `None` for 204 responses and the parsed JSON body otherwise.
    pub async fn send(
        &self,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<Option<Value>, ApiError> {
        let mut token = self.inner.session.access_token();
        let mut attempt = Attempt::First;

        loop {
            let response = self.issue(endpoint, &options, token.as_deref()).await?;
            debug!(
                method = %options.method,
                endpoint,
                status = response.status.as_u16(),
                retry = attempt == Attempt::Retry,
                "Request completed"
            );

            if response.is_unauthorized() && attempt == Attempt::First {
                match self.refresh_access_token().await {
                    Some(fresh) => {
                        token = Some(fresh);
                        attempt = Attempt::Retry;
                        continue;
                    }
                    None => {
                        warn!(endpoint, "Session could not be renewed, clearing credentials");
                        self.inner.session.clear();
                        return Err(ApiError::session_expired(&response.body));
                    }
                }
            }

            return self.finish(endpoint, response);
        }
    }

    /// Send and return the body, mapping an empty response to `Value::Null`
    pub async fn send_value(
        &self,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<Value, ApiError> {
        Ok(self.send(endpoint, options).await?.unwrap_or(Value::Null))
    }

    /// Send and deserialize the body into `T`
    pub async fn send_as<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<T, ApiError> {
        let body = self
            .send(endpoint, options)
            .await?
            .ok_or_else(|| ApiError::InvalidResponse(format!("{} returned no content", endpoint)))?;
        serde_json::from_value(body)
            .map_err(|e| ApiError::InvalidResponse(format!("{}: {}", endpoint, e)))
    }

    async fn issue(
        &self,
        endpoint: &str,
        options: &RequestOptions,
        token: Option<&str>,
    ) -> Result<HttpResponse, ApiError> {
        let request = HttpRequest {
            method: options.method.clone(),
            url: format!("{}{}", self.inner.base_url, endpoint),
            headers: compose_headers(&options.headers, token)?,
            body: options.body.clone(),
        };
        self.inner.transport.execute(request).await
    }

    fn finish(&self, endpoint: &str, response: HttpResponse) -> Result<Option<Value>, ApiError> {
        if !response.is_success() {
            if response.is_unauthorized() {
                warn!(endpoint, "Request rejected after refresh, clearing credentials");
                self.inner.session.clear();
            }
            return Err(ApiError::from_status(response.status.as_u16(), &response.body));
        }

        if response.status == StatusCode::NO_CONTENT {
            return Ok(None);
        }

        serde_json::from_str(&response.body).map(Some).map_err(|e| {
            ApiError::InvalidResponse(format!(
                "{}: {} in {}",
                endpoint,
                e,
                ApiError::truncate_body(&response.body)
            ))
        })
    }

    /// Await the shared refresh, starting it if this caller is first
    async fn refresh_access_token(&self) -> Option<String> {
        let inner = Arc::clone(&self.inner);
        self.inner
            .refresh
            .join_or_start(move || async move { inner.exchange_session_token().await }.boxed())
            .await
    }
}

impl PipelineInner {
    /// Exchange the session token for a new access token.
    ///
    /// Never fails: every problem yields `None`.
    async fn exchange_session_token(&self) -> Option<String> {
        let Some(session_token) = self.session.session_token() else {
            debug!("No session token stored, cannot refresh");
            return None;
        };

        info!("Refreshing access token");
        let body = serde_json::to_string(&RefreshRequest {
            session_token: &session_token,
        })
        .ok()?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let request = HttpRequest {
            method: Method::POST,
            url: format!("{}{}", self.base_url, REFRESH_ENDPOINT),
            headers,
            body: Some(body),
        };

        let response = match self.transport.execute(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Token refresh request failed");
                return None;
            }
        };

        if !response.is_success() {
            warn!(status = response.status.as_u16(), "Token refresh rejected");
            return None;
        }

        let refreshed: RefreshResponse = match serde_json::from_str(&response.body) {
            Ok(refreshed) => refreshed,
            Err(e) => {
                warn!(error = %e, "Token refresh returned an unreadable body");
                return None;
            }
        };

        if let Err(e) = self.session.set_access_token(&refreshed.access_token) {
            warn!(error = %e, "Failed to persist refreshed access token");
        }
        info!("Access token refreshed");
        Some(refreshed.access_token)
    }
}

/// Defaults, then caller headers, then the bearer token when one is stored
fn compose_headers(caller: &HeaderMap, token: Option<&str>) -> Result<HeaderMap, ApiError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.extend(caller.clone());

    if let Some(token) = token {
        let value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| ApiError::InvalidHeader(e.to_string()))?;
        headers.insert(AUTHORIZATION, value);
    }
    Ok(headers)
}
