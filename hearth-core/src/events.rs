//! Push Event Types
//!
//! Names of the server-pushed invalidation events and the frame shape that
//! carries them over the realtime connection.

use crate::entities::Domain;
use crate::identity::EntityId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Prefix of the member-scoped point balance event (`pointsUpdated:<memberId>`).
pub const POINTS_EVENT_PREFIX: &str = "pointsUpdated:";

/// Server-pushed signals that some cached domain may be stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvalidationEvent {
    #[serde(rename = "taskUpdated")]
    TaskUpdated,
    #[serde(rename = "questUpdated")]
    QuestUpdated,
    #[serde(rename = "memberUpdated")]
    MemberUpdated,
    #[serde(rename = "storeUpdated")]
    StoreUpdated,
    #[serde(rename = "routineUpdated")]
    RoutineUpdated,
    #[serde(rename = "wishlistUpdated")]
    WishlistUpdated,
    #[serde(rename = "notification")]
    Notification,
}

impl InvalidationEvent {
    pub const ALL: [InvalidationEvent; 7] = [
        InvalidationEvent::TaskUpdated,
        InvalidationEvent::QuestUpdated,
        InvalidationEvent::MemberUpdated,
        InvalidationEvent::StoreUpdated,
        InvalidationEvent::RoutineUpdated,
        InvalidationEvent::WishlistUpdated,
        InvalidationEvent::Notification,
    ];

    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            InvalidationEvent::TaskUpdated => "taskUpdated",
            InvalidationEvent::QuestUpdated => "questUpdated",
            InvalidationEvent::MemberUpdated => "memberUpdated",
            InvalidationEvent::StoreUpdated => "storeUpdated",
            InvalidationEvent::RoutineUpdated => "routineUpdated",
            InvalidationEvent::WishlistUpdated => "wishlistUpdated",
            InvalidationEvent::Notification => "notification",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|event| event.name() == name)
    }

    /// The cached domain this event invalidates, if it maps to exactly one.
    pub fn domain(&self) -> Option<Domain> {
        match self {
            InvalidationEvent::TaskUpdated => Some(Domain::Tasks),
            InvalidationEvent::QuestUpdated => Some(Domain::Quests),
            InvalidationEvent::MemberUpdated => Some(Domain::Members),
            InvalidationEvent::StoreUpdated => Some(Domain::StoreItems),
            InvalidationEvent::RoutineUpdated => Some(Domain::Routines),
            InvalidationEvent::WishlistUpdated => Some(Domain::Wishlists),
            InvalidationEvent::Notification => None,
        }
    }
}

impl fmt::Display for InvalidationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Event name carrying point balance changes for one member.
pub fn points_event(member_id: &EntityId) -> String {
    format!("{POINTS_EVENT_PREFIX}{member_id}")
}

/// A single named message on the push connection, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushFrame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl PushFrame {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}
