//! Durable key-value storage for credentials and the cached user record.
//!
//! Both the session state and the request pipeline receive a store as an
//! injected `Arc<dyn KeyValueStore>`:
//! - `FileStore`: JSON file on disk, survives restarts
//! - `MemoryStore`: in-process map, used by tests and one-shot runs

pub mod store;

pub use store::{FileStore, KeyValueStore, MemoryStore, StoreError};

/// Access credential sent as the bearer token.
pub const TOKEN_KEY: &str = "token";

/// Session credential, only ever sent to the refresh endpoint.
pub const SESSION_TOKEN_KEY: &str = "session_token";

/// Serialized `UserSummary` of the signed-in user.
pub const USER_KEY: &str = "user";

/// Anonymous AI-coach conversation id.
pub const AI_SESSION_ID_KEY: &str = "ai_session_id";
