//! Authenticated session lifecycle.
//!
//! The session is produced by login and destroyed by logout or by the gateway
//! when the backend reports an expired token. Everything that cares about it
//! (request headers, the realtime connection, the cache) observes it through a
//! `SessionStore` handle instead of reaching for shared globals.

use chrono::Utc;
use hearth_core::{EntityId, MemberRole, Timestamp};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUser {
    #[serde(alias = "_id")]
    pub id: EntityId,
    pub name: String,
    #[serde(default)]
    pub role: MemberRole,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub token: String,
    pub user: SessionUser,
    pub household_id: Option<EntityId>,
    pub authenticated_at: Timestamp,
}

impl Session {
    pub fn new(token: impl Into<String>, user: SessionUser, household_id: Option<EntityId>) -> Self {
        Self {
            token: token.into(),
            user,
            household_id,
            authenticated_at: Utc::now(),
        }
    }
}

/// Cloneable handle to the current session.
#[derive(Clone)]
pub struct SessionStore {
    tx: Arc<watch::Sender<Option<Session>>>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    pub fn authenticate(&self, session: Session) {
        info!(user_id = %session.user.id, "Session authenticated");
        self.tx.send_replace(Some(session));
    }

    /// Drop the session. Returns false when there was none.
    pub fn clear(&self, reason: &str) -> bool {
        let previous = self.tx.send_replace(None);
        if previous.is_some() {
            info!(reason, "Session cleared");
        }
        previous.is_some()
    }

    /// Drop the session only while it still holds `token`. A newer session
    /// created in the meantime is left alone.
    pub fn clear_token(&self, token: &str, reason: &str) -> bool {
        let cleared = self.tx.send_if_modified(|current| {
            if current.as_ref().is_some_and(|s| s.token == token) {
                *current = None;
                true
            } else {
                false
            }
        });
        if cleared {
            info!(reason, "Session cleared");
        } else {
            debug!(reason, "Stale token; session kept");
        }
        cleared
    }

    pub fn current(&self) -> Option<Session> {
        self.tx.borrow().clone()
    }

    pub fn token(&self) -> Option<String> {
        self.tx.borrow().as_ref().map(|s| s.token.clone())
    }

    pub fn is_authenticated(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Session>> {
        self.tx.subscribe()
    }
}
