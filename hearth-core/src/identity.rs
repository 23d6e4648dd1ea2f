//! Identity types for Hearth entities
//!
//! Upstream services disagree on how a record names itself: some send `id`,
//! some send `_id`, and a few send both with different values. Records are
//! normalized here, at ingestion, so everything downstream only ever sees a
//! single canonical `id`.

use crate::error::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Field name that wins when a record carries both identifiers.
pub const CANONICAL_FIELD: &str = "id";

/// Secondary identifier field sent by document-store backed services.
pub const ALIAS_FIELD: &str = "_id";

/// Opaque entity identifier as issued by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for EntityId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The resolved identity of one ingested record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub canonical: EntityId,
    /// The other identifier, when the record carried two distinct values.
    pub alias: Option<EntityId>,
}

impl Identity {
    pub fn new(canonical: impl Into<EntityId>) -> Self {
        Self {
            canonical: canonical.into(),
            alias: None,
        }
    }

    /// True when `id` names this identity under either field.
    pub fn matches(&self, id: &str) -> bool {
        self.canonical.as_str() == id || self.alias.as_ref().is_some_and(|a| a.as_str() == id)
    }
}

/// Resolve the identity of a raw record and rewrite it in canonical shape.
///
/// After this call the object holds exactly one identifier, under `id`.
pub fn canonicalize(record: &mut Value) -> CoreResult<Identity> {
    let object = record.as_object_mut().ok_or(CoreError::NotAnObject)?;

    let primary = object.get(CANONICAL_FIELD).and_then(id_string);
    let secondary = object.remove(ALIAS_FIELD).as_ref().and_then(id_string);

    let identity = match (primary, secondary) {
        (Some(primary), Some(secondary)) if primary != secondary => Identity {
            canonical: EntityId(primary),
            alias: Some(EntityId(secondary)),
        },
        (Some(primary), _) => Identity::new(primary),
        (None, Some(secondary)) => Identity::new(secondary),
        (None, None) => return Err(CoreError::MissingIdentity),
    };

    object.insert(
        CANONICAL_FIELD.to_string(),
        Value::String(identity.canonical.0.clone()),
    );
    Ok(identity)
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
