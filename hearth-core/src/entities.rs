//! Household entity types
//!
//! Every record the client mirrors from the backend. Field names follow the
//! backend's camelCase JSON; anything optional upstream defaults here so a
//! sparse record still ingests.

use crate::identity::{EntityId, Timestamp};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// DOMAIN
// ============================================================================

/// The collections held by the client-side cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Domain {
    Tasks,
    Members,
    Quests,
    StoreItems,
    Meals,
    Routines,
    Wishlists,
}

impl Domain {
    pub const ALL: [Domain; 7] = [
        Domain::Tasks,
        Domain::Members,
        Domain::Quests,
        Domain::StoreItems,
        Domain::Meals,
        Domain::Routines,
        Domain::Wishlists,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Domain::Tasks => "tasks",
            Domain::Members => "members",
            Domain::Quests => "quests",
            Domain::StoreItems => "storeItems",
            Domain::Meals => "meals",
            Domain::Routines => "routines",
            Domain::Wishlists => "wishlists",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A record that can live in a [`crate::DomainCollection`].
pub trait CacheEntity: Clone + Serialize + DeserializeOwned {
    const DOMAIN: Domain;

    fn id(&self) -> &EntityId;
}

macro_rules! cache_entity {
    ($ty:ty, $domain:expr) => {
        impl CacheEntity for $ty {
            const DOMAIN: Domain = $domain;

            fn id(&self) -> &EntityId {
                &self.id
            }
        }
    };
}

// ============================================================================
// ENTITIES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: EntityId,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub assigned_to: Option<EntityId>,
    #[serde(default)]
    pub points: i64,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub due_date: Option<Timestamp>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum MemberRole {
    Parent,
    #[default]
    Child,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub id: EntityId,
    pub name: String,
    #[serde(default)]
    pub role: MemberRole,
    #[serde(default)]
    pub points: i64,
    #[serde(default)]
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum QuestStatus {
    #[default]
    Open,
    Claimed,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quest {
    pub id: EntityId,
    pub title: String,
    #[serde(default)]
    pub reward_points: i64,
    #[serde(default)]
    pub status: QuestStatus,
    #[serde(default)]
    pub claimed_by: Option<EntityId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreItem {
    pub id: EntityId,
    pub name: String,
    pub cost: i64,
    #[serde(default = "default_available")]
    pub available: bool,
}

fn default_available() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meal {
    pub id: EntityId,
    pub name: String,
    #[serde(default)]
    pub day: Option<String>,
    #[serde(default)]
    pub meal_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Routine {
    pub id: EntityId,
    pub name: String,
    #[serde(default)]
    pub member_id: Option<EntityId>,
    #[serde(default)]
    pub steps: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WishlistEntry {
    pub id: EntityId,
    pub title: String,
    #[serde(default)]
    pub member_id: Option<EntityId>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub points_goal: Option<i64>,
}

cache_entity!(Task, Domain::Tasks);
cache_entity!(Member, Domain::Members);
cache_entity!(Quest, Domain::Quests);
cache_entity!(StoreItem, Domain::StoreItems);
cache_entity!(Meal, Domain::Meals);
cache_entity!(Routine, Domain::Routines);
cache_entity!(WishlistEntry, Domain::Wishlists);
