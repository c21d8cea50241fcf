//! Client core for the fundflow crowdfunding platform.
//!
//! Provides the authenticated request pipeline with coordinated token
//! refresh, the process-wide session state it maintains, and a typed client
//! for the backend's REST endpoints.

pub mod api;
pub mod auth;
pub mod config;
pub mod models;
pub mod storage;

#[cfg(test)]
pub(crate) mod testutil;

pub use api::{ApiClient, ApiError, RequestOptions, RequestPipeline};
pub use auth::{SessionRecord, SessionState};
pub use config::Config;
pub use models::{LoginResponse, UserSummary};
pub use storage::{FileStore, KeyValueStore, MemoryStore};
