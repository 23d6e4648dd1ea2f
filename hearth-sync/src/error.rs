//! Error types for the sync layer.

use crate::config::ConfigError;
use crate::gateway::{ErrorKind, GatewayError};
use crate::realtime::RealtimeError;
use hearth_core::{CoreError, Domain};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Realtime(#[from] RealtimeError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("Not signed in")]
    NotAuthenticated,
    #[error("Signed-in user has no household")]
    NoHousehold,
    #[error("Not enough points: need {needed}, have {available}")]
    InsufficientPoints { needed: i64, available: i64 },
    #[error("{domain} entity {id} is not in the cache")]
    NotCached { domain: Domain, id: String },
    #[error("Malformed login response: {0}")]
    InvalidLogin(String),
}

impl SyncError {
    /// True when the failure came from an expired or rejected session token.
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, SyncError::Gateway(err) if err.kind() == ErrorKind::AuthExpired)
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
