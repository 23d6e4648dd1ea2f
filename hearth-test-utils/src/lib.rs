//! Hearth Test Utilities
//!
//! Shared test infrastructure for the Hearth workspace:
//! - Proptest generators for raw upstream records and entity types
//! - JSON fixtures shaped like backend responses
//! - Assertions for identity invariants

pub use hearth_core::{CacheEntity, Domain, DomainCollection, EntityId, MemberRole};

use serde_json::{json, Value};

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for upstream records.

    use super::*;
    use proptest::prelude::*;

    /// Which identifier fields a generated record carries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum IdShape {
        CanonicalOnly,
        AliasOnly,
        Both,
    }

    pub fn arb_entity_id() -> impl Strategy<Value = EntityId> {
        "[a-f0-9]{6,12}".prop_map(EntityId::new)
    }

    pub fn arb_id_shape() -> impl Strategy<Value = IdShape> {
        prop_oneof![
            Just(IdShape::CanonicalOnly),
            Just(IdShape::AliasOnly),
            Just(IdShape::Both),
        ]
    }

    pub fn arb_member_role() -> impl Strategy<Value = MemberRole> {
        prop_oneof![Just(MemberRole::Parent), Just(MemberRole::Child)]
    }

    /// Attach identifier fields to `record` the way a given upstream would.
    /// With `Both`, the alias is a different value than the canonical id.
    pub fn with_ids(mut record: Value, id: &EntityId, shape: IdShape) -> Value {
        if let Some(object) = record.as_object_mut() {
            match shape {
                IdShape::CanonicalOnly => {
                    object.insert("id".to_string(), json!(id.as_str()));
                }
                IdShape::AliasOnly => {
                    object.insert("_id".to_string(), json!(id.as_str()));
                }
                IdShape::Both => {
                    object.insert("id".to_string(), json!(id.as_str()));
                    object.insert("_id".to_string(), json!(format!("legacy-{}", id)));
                }
            }
        }
        record
    }

    /// Raw member record, identified in one of the upstream shapes.
    pub fn arb_raw_member() -> impl Strategy<Value = (EntityId, IdShape, Value)> {
        (
            arb_entity_id(),
            arb_id_shape(),
            "[A-Z][a-z]{2,8}",
            arb_member_role(),
            0i64..10_000,
        )
            .prop_map(|(id, shape, name, role, points)| {
                let body = json!({
                    "name": name,
                    "role": role,
                    "points": points,
                });
                let record = with_ids(body, &id, shape);
                (id, shape, record)
            })
    }

    /// Raw task records with distinct ids.
    pub fn arb_raw_tasks(max: usize) -> impl Strategy<Value = Vec<Value>> {
        proptest::collection::hash_set("[a-f0-9]{8}", 0..max).prop_flat_map(|ids| {
            let ids: Vec<String> = ids.into_iter().collect();
            let len = ids.len();
            (
                Just(ids),
                proptest::collection::vec((arb_id_shape(), any::<bool>(), 0i64..500), len),
            )
                .prop_map(|(ids, attrs)| {
                    ids.into_iter()
                        .zip(attrs)
                        .map(|(id, (shape, completed, points))| {
                            let body = json!({
                                "title": format!("task {}", id),
                                "completed": completed,
                                "points": points,
                            });
                            with_ids(body, &EntityId::new(id), shape)
                        })
                        .collect()
                })
        })
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Backend-shaped JSON for common scenarios.

    use super::*;

    pub const HOUSEHOLD_ID: &str = "H1";
    pub const PARENT_ID: &str = "p1";
    pub const CHILD_ID: &str = "m1";

    /// Success envelope around `data`.
    pub fn envelope(data: Value) -> Value {
        json!({ "status": "success", "data": data })
    }

    pub fn error_body(message: &str) -> Value {
        json!({ "status": "error", "message": message })
    }

    /// Login response: `{token, data: {parent, primaryHouseholdId}}`.
    pub fn login_response(token: &str) -> Value {
        json!({
            "status": "success",
            "token": token,
            "data": {
                "parent": { "_id": PARENT_ID, "name": "Pat", "role": "parent" },
                "primaryHouseholdId": HOUSEHOLD_ID,
            }
        })
    }

    pub fn parent_member() -> Value {
        json!({ "_id": PARENT_ID, "name": "Pat", "role": "parent", "points": 0 })
    }

    pub fn child_member(points: i64) -> Value {
        json!({ "id": CHILD_ID, "_id": "legacy-m1", "name": "Robin", "role": "child", "points": points })
    }

    pub fn task(id: &str, title: &str) -> Value {
        json!({ "_id": id, "title": title, "points": 10, "completed": false, "assignedTo": CHILD_ID })
    }

    pub fn store_item(id: &str, cost: i64) -> Value {
        json!({ "id": id, "name": format!("item {}", id), "cost": cost, "available": true })
    }

    pub fn quest(id: &str) -> Value {
        json!({ "id": id, "title": "Clean the garage", "rewardPoints": 100, "status": "open" })
    }

    pub fn meal(id: &str) -> Value {
        json!({ "id": id, "name": "Tacos", "day": "tuesday", "mealType": "dinner" })
    }

    pub fn routine(id: &str) -> Value {
        json!({ "id": id, "name": "Morning", "memberId": CHILD_ID, "steps": ["brush teeth", "make bed"] })
    }

    pub fn wishlist_entry(id: &str) -> Value {
        json!({ "_id": id, "title": "Bike", "memberId": CHILD_ID, "pointsGoal": 800 })
    }

    /// Response data for every household path, keyed by path.
    pub fn household(child_points: i64) -> Vec<(String, Value)> {
        let base = format!("/households/{}", HOUSEHOLD_ID);
        vec![
            (format!("{}/tasks", base), json!([task("t1", "Dishes"), task("t2", "Laundry")])),
            (
                format!("{}/members", base),
                json!([parent_member(), child_member(child_points)]),
            ),
            (format!("{}/quests", base), json!([quest("q1")])),
            (format!("{}/store", base), json!([store_item("s1", 50), store_item("s2", 500)])),
            (format!("{}/meals", base), json!([meal("meal1")])),
            (format!("{}/routines", base), json!([routine("r1")])),
            (format!("/members/{}/wishlist", PARENT_ID), json!([])),
            (format!("/members/{}/wishlist", CHILD_ID), json!([wishlist_entry("w1")])),
        ]
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Identity invariants over collections.

    use super::*;
    use std::collections::HashSet;

    /// Every entity is reachable by its canonical id and no id repeats.
    pub fn assert_canonical_index<T: CacheEntity>(collection: &DomainCollection<T>) {
        let mut seen = HashSet::new();
        for item in collection.iter() {
            assert!(
                seen.insert(item.id().clone()),
                "duplicate canonical id {} in {}",
                item.id(),
                T::DOMAIN
            );
            assert!(
                collection.get(item.id().as_str()).is_some(),
                "{} not reachable by its canonical id",
                item.id()
            );
        }
        assert_eq!(seen.len(), collection.len());
    }
}
