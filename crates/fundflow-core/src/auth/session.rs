use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::models::UserSummary;
use crate::storage::{KeyValueStore, StoreError, SESSION_TOKEN_KEY, TOKEN_KEY, USER_KEY};

/// How often the stored credentials are re-read to converge with changes
/// made elsewhere (another process logging out, a wiped store file).
pub const CHECK_AUTH_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct SessionRecord {
    pub user: Option<UserSummary>,
    pub is_authenticated: bool,
    /// Last time the record was re-derived from the store
    #[cfg_attr(feature = "ts", ts(type = "string | null"))]
    pub checked_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    fn authenticated(user: UserSummary) -> Self {
        Self {
            user: Some(user),
            is_authenticated: true,
            checked_at: Some(Utc::now()),
        }
    }

    fn anonymous() -> Self {
        Self {
            checked_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    pub fn is_admin(&self) -> bool {
        self.user.as_ref().map(UserSummary::is_admin).unwrap_or(false)
    }

    /// Same authentication state, ignoring bookkeeping timestamps
    fn same_state(&self, other: &SessionRecord) -> bool {
        self.is_authenticated == other.is_authenticated && self.user == other.user
    }
}

struct Inner {
    store: Arc<dyn KeyValueStore>,
    record: watch::Sender<SessionRecord>,
}

/// Handle to the shared session. Clone is cheap and every clone observes
/// the same record.
#[derive(Clone)]
pub struct SessionState {
    inner: Arc<Inner>,
}

impl SessionState {
    /// Create an anonymous session over `store` without reading it
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        let (record, _) = watch::channel(SessionRecord::default());
        Self {
            inner: Arc::new(Inner { store, record }),
        }
    }

    /// Create a session and derive its initial record from `store`
    pub fn load(store: Arc<dyn KeyValueStore>) -> Self {
        let state = Self::new(store);
        state.check_auth();
        state
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.inner.store
    }

    /// Re-derive the in-memory record from the store.
    ///
    /// A missing credential, missing user or unparsable user record all
    /// result in a cleared session.
    pub fn check_auth(&self) {
        let store = &self.inner.store;
        if let Err(e) = store.reload() {
            warn!(error = %e, "Failed to reload store, using cached values");
        }

        let user = match (store.get(TOKEN_KEY), store.get(USER_KEY)) {
            (Some(_), Some(raw)) => match serde_json::from_str::<UserSummary>(&raw) {
                Ok(user) => Some(user),
                Err(e) => {
                    warn!(error = %e, "Stored user record is unreadable");
                    None
                }
            },
            _ => None,
        };

        match user {
            Some(user) => self.publish(SessionRecord::authenticated(user)),
            None => self.clear(),
        }
    }

    /// Persist the user and access token, then mark the session authenticated
    pub fn set_user(&self, user: UserSummary, access_token: &str) -> Result<(), StoreError> {
        let raw = serde_json::to_string(&user)?;
        self.inner.store.set(TOKEN_KEY, access_token)?;
        self.inner.store.set(USER_KEY, &raw)?;
        debug!(user_id = user.id, is_admin = user.is_admin(), "Session authenticated");
        self.publish(SessionRecord::authenticated(user));
        Ok(())
    }

    /// Replace the access token after a refresh; the user record is unchanged
    pub fn set_access_token(&self, access_token: &str) -> Result<(), StoreError> {
        self.inner.store.set(TOKEN_KEY, access_token)
    }

    pub fn set_session_token(&self, session_token: &str) -> Result<(), StoreError> {
        self.inner.store.set(SESSION_TOKEN_KEY, session_token)
    }

    pub fn clear_session_token(&self) -> Result<(), StoreError> {
        self.inner.store.remove(SESSION_TOKEN_KEY)
    }

    /// Drop every persisted credential and reset to anonymous.
    ///
    /// The in-memory record is reset even when the store fails.
    pub fn clear(&self) {
        for key in [TOKEN_KEY, SESSION_TOKEN_KEY, USER_KEY] {
            if let Err(e) = self.inner.store.remove(key) {
                warn!(key, error = %e, "Failed to remove stored credential");
            }
        }
        self.publish(SessionRecord::anonymous());
    }

    pub fn access_token(&self) -> Option<String> {
        self.inner.store.get(TOKEN_KEY)
    }

    pub fn session_token(&self) -> Option<String> {
        self.inner.store.get(SESSION_TOKEN_KEY)
    }

    pub fn snapshot(&self) -> SessionRecord {
        self.inner.record.borrow().clone()
    }

    /// Receiver notified on every authenticated/anonymous transition
    pub fn subscribe(&self) -> watch::Receiver<SessionRecord> {
        self.inner.record.subscribe()
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.record.borrow().is_authenticated
    }

    pub fn is_admin(&self) -> bool {
        self.inner.record.borrow().is_admin()
    }

    pub fn user(&self) -> Option<UserSummary> {
        self.inner.record.borrow().user.clone()
    }

    /// Run `check_auth` every `period` until the returned task is aborted
    pub fn spawn_auth_poller(&self, period: Duration) -> JoinHandle<()> {
        let state = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // First tick completes immediately; the caller already checked
            ticker.tick().await;
            loop {
                ticker.tick().await;
                state.check_auth();
            }
        })
    }

    fn publish(&self, next: SessionRecord) {
        let changed = self.inner.record.send_if_modified(|current| {
            let changed = !current.same_state(&next);
            if changed {
                debug!(
                    from = current.is_authenticated,
                    to = next.is_authenticated,
                    "Session state changed"
                );
            }
            *current = next;
            changed
        });
        if !changed {
            debug!("Session check found no change");
        }
    }
}
