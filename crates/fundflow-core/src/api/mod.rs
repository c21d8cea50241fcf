//! REST API access for the fundflow backend.
//!
//! This module provides:
//! - `RequestPipeline`: bearer-authenticated calls with a single shared
//!   token refresh and retry-once on 401
//! - `ApiClient`: typed operations (auth, projects, admin, AI coach)
//! - `HttpTransport`: the network seam, implemented with reqwest

pub mod client;
pub mod error;
pub mod pipeline;
pub mod transport;

pub use client::ApiClient;
pub use error::{ApiError, DEFAULT_ERROR_MESSAGE, SESSION_EXPIRED_MESSAGE};
pub use pipeline::{RefreshCoordinator, RequestOptions, RequestPipeline};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
