//! Client-side authentication state.
//!
//! This module provides:
//! - `SessionState`: the process-wide `{user, is_authenticated}` record,
//!   mirrored to the durable store and re-derived from it periodically
//! - `SessionRecord`: the snapshot observers receive
//!
//! The admin flag is always derived from the cached user record.

pub mod session;

pub use session::{SessionRecord, SessionState, CHECK_AUTH_INTERVAL};
