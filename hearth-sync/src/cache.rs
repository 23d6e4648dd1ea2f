//! Client-side mirror of the household's server-owned collections.
//!
//! `CacheStore` is an explicitly owned instance: whoever needs it gets an
//! `Arc<CacheStore>` handed in. Reads go through [`CacheStore::select`],
//! writes through the action methods; nothing outside this module replaces a
//! collection wholesale.

use crate::error::{SyncError, SyncResult};
use crate::gateway::{GatewayError, RequestGateway};
use chrono::Utc;
use futures_util::future::join_all;
use hearth_core::{
    CacheEntity, Domain, DomainCollection, EntityId, Meal, Member, Quest, Routine, StoreItem, Task,
    Timestamp, WishlistEntry,
};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use tracing::{debug, info, warn};

// ============================================================================
// SNAPSHOT
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct CacheSnapshot {
    pub tasks: DomainCollection<Task>,
    pub members: DomainCollection<Member>,
    pub quests: DomainCollection<Quest>,
    pub store_items: DomainCollection<StoreItem>,
    pub meals: DomainCollection<Meal>,
    pub routines: DomainCollection<Routine>,
    /// Wishlists keyed by the canonical id of the owning member.
    pub wishlists: HashMap<EntityId, DomainCollection<WishlistEntry>>,
    pub loaded_at: Option<Timestamp>,
}

impl CacheSnapshot {
    pub fn member_points(&self, member_id: &str) -> Option<i64> {
        self.members.get(member_id).map(|m| m.points)
    }

    pub fn wishlist(&self, member_id: &str) -> Option<&DomainCollection<WishlistEntry>> {
        let canonical = self.members.resolve(member_id)?;
        self.wishlists.get(canonical)
    }

    pub fn len(&self, domain: Domain) -> usize {
        match domain {
            Domain::Tasks => self.tasks.len(),
            Domain::Members => self.members.len(),
            Domain::Quests => self.quests.len(),
            Domain::StoreItems => self.store_items.len(),
            Domain::Meals => self.meals.len(),
            Domain::Routines => self.routines.len(),
            Domain::Wishlists => self.wishlists.values().map(DomainCollection::len).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        Domain::ALL.iter().all(|domain| self.len(*domain) == 0)
    }

    fn merge_patch(&mut self, domain: Domain, id: &str, patch: &Map<String, Value>) -> SyncResult<bool> {
        let matched = match domain {
            Domain::Tasks => self.tasks.merge_patch(id, patch)?,
            Domain::Members => self.members.merge_patch(id, patch)?,
            Domain::Quests => self.quests.merge_patch(id, patch)?,
            Domain::StoreItems => self.store_items.merge_patch(id, patch)?,
            Domain::Meals => self.meals.merge_patch(id, patch)?,
            Domain::Routines => self.routines.merge_patch(id, patch)?,
            Domain::Wishlists => {
                let mut matched = false;
                for list in self.wishlists.values_mut() {
                    if list.merge_patch(id, patch)? {
                        matched = true;
                        break;
                    }
                }
                matched
            }
        };
        Ok(matched)
    }
}

// ============================================================================
// LOAD REPORT
// ============================================================================

/// One collection that fell back to empty during a load.
#[derive(Debug, Clone)]
pub struct DomainFailure {
    pub domain: Domain,
    /// Set for per-member collections (wishlists).
    pub member_id: Option<EntityId>,
    pub error: GatewayError,
}

#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    pub sequence: u64,
    pub failed: Vec<DomainFailure>,
    /// False when the session changed mid-load and the result was dropped.
    pub committed: bool,
}

impl LoadReport {
    pub fn failed_domains(&self) -> Vec<Domain> {
        let mut domains: Vec<Domain> = self.failed.iter().map(|f| f.domain).collect();
        domains.dedup();
        domains
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

// ============================================================================
// ENDPOINTS
// ============================================================================

pub fn domain_path(household_id: &EntityId, domain: Domain) -> String {
    let segment = match domain {
        Domain::Tasks => "tasks",
        Domain::Members => "members",
        Domain::Quests => "quests",
        Domain::StoreItems => "store",
        Domain::Meals => "meals",
        Domain::Routines => "routines",
        Domain::Wishlists => "wishlists",
    };
    format!("/households/{}/{}", household_id, segment)
}

pub fn wishlist_path(member_id: &EntityId) -> String {
    format!("/members/{}/wishlist", member_id)
}

/// Accept either a bare array or an object wrapping the array under the
/// domain's name (`{"tasks": [...]}`).
pub fn extract_records(domain: Domain, data: Value) -> Result<Vec<Value>, GatewayError> {
    match data {
        Value::Array(items) => Ok(items),
        Value::Null => Ok(Vec::new()),
        Value::Object(mut object) => match object.remove(domain.name()) {
            Some(Value::Array(items)) => Ok(items),
            _ => Err(GatewayError::ParseError(format!(
                "expected a list of {}",
                domain.name()
            ))),
        },
        _ => Err(GatewayError::ParseError(format!(
            "expected a list of {}",
            domain.name()
        ))),
    }
}

// ============================================================================
// STORE
// ============================================================================

pub struct CacheStore {
    gateway: RequestGateway,
    state: RwLock<CacheSnapshot>,
    loads: AtomicU64,
}

impl CacheStore {
    pub fn new(gateway: RequestGateway) -> Self {
        Self {
            gateway,
            state: RwLock::new(CacheSnapshot::default()),
            loads: AtomicU64::new(0),
        }
    }

    pub fn gateway(&self) -> &RequestGateway {
        &self.gateway
    }

    /// Fetch every collection in parallel and replace the snapshot.
    ///
    /// A failing fetch only empties its own collection. Wishlists are a second
    /// wave, one request per member returned by the first wave.
    pub async fn load(&self) -> SyncResult<LoadReport> {
        self.run_load(false).await
    }

    /// Same work as [`CacheStore::load`]; `silent` only lowers log levels.
    /// Concurrent refreshes are not coalesced and the last to finish wins.
    pub async fn refresh(&self, silent: bool) -> SyncResult<LoadReport> {
        if silent {
            debug!("Silent cache refresh");
        } else {
            info!("Refreshing cache");
        }
        self.run_load(silent).await
    }

    async fn run_load(&self, silent: bool) -> SyncResult<LoadReport> {
        let session = self
            .gateway
            .session()
            .current()
            .ok_or(SyncError::NotAuthenticated)?;
        let household = session.household_id.clone().ok_or(SyncError::NoHousehold)?;
        let sequence = self.loads.fetch_add(1, Ordering::SeqCst) + 1;
        let mut report = LoadReport {
            sequence,
            ..LoadReport::default()
        };

        let (tasks, members, quests, store_items, meals, routines) = tokio::join!(
            self.fetch::<Task>(domain_path(&household, Domain::Tasks)),
            self.fetch::<Member>(domain_path(&household, Domain::Members)),
            self.fetch::<Quest>(domain_path(&household, Domain::Quests)),
            self.fetch::<StoreItem>(domain_path(&household, Domain::StoreItems)),
            self.fetch::<Meal>(domain_path(&household, Domain::Meals)),
            self.fetch::<Routine>(domain_path(&household, Domain::Routines)),
        );

        let members = settle(members, None, silent, &mut report);
        let member_ids: Vec<EntityId> = members.iter().map(|m| m.id.clone()).collect();
        let wishlist_results = join_all(
            member_ids
                .iter()
                .map(|id| self.fetch::<WishlistEntry>(wishlist_path(id))),
        )
        .await;

        let mut wishlists = HashMap::new();
        for (member_id, result) in member_ids.into_iter().zip(wishlist_results) {
            let list = settle(result, Some(member_id.clone()), silent, &mut report);
            wishlists.insert(member_id, list);
        }

        let snapshot = CacheSnapshot {
            tasks: settle(tasks, None, silent, &mut report),
            members,
            quests: settle(quests, None, silent, &mut report),
            store_items: settle(store_items, None, silent, &mut report),
            meals: settle(meals, None, silent, &mut report),
            routines: settle(routines, None, silent, &mut report),
            wishlists,
            loaded_at: Some(Utc::now()),
        };

        // A load that outlived its session must not resurrect cleared data.
        let still_current = self
            .gateway
            .session()
            .current()
            .is_some_and(|current| current.token == session.token);
        if !still_current {
            debug!(sequence, "Session changed during load; discarding result");
            return Ok(report);
        }

        self.update(|state| *state = snapshot);
        report.committed = true;
        if silent {
            debug!(sequence, failed = report.failed.len(), "Cache reloaded");
        } else {
            info!(sequence, failed = report.failed.len(), "Cache loaded");
        }
        Ok(report)
    }

    async fn fetch<T: CacheEntity>(&self, path: String) -> Result<DomainCollection<T>, GatewayError> {
        let data = self.gateway.get(&path).await?;
        let records = extract_records(T::DOMAIN, data)?;
        Ok(DomainCollection::from_raw(records))
    }

    /// Read from the current snapshot.
    pub fn select<R>(&self, f: impl FnOnce(&CacheSnapshot) -> R) -> R {
        let guard = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    /// Mutate the current snapshot. The lock is never held across an await.
    pub fn update<R>(&self, f: impl FnOnce(&mut CacheSnapshot) -> R) -> R {
        let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Apply a partial update to one entity, matched by canonical id or alias.
    /// Returns `Ok(false)` when nothing matched.
    pub fn merge_patch(&self, domain: Domain, id: &str, patch: &Map<String, Value>) -> SyncResult<bool> {
        let matched = self.update(|state| state.merge_patch(domain, id, patch))?;
        if !matched {
            debug!(domain = %domain, id, "Patch target not cached");
        }
        Ok(matched)
    }

    pub fn member_points(&self, member_id: &str) -> Option<i64> {
        self.select(|state| state.member_points(member_id))
    }

    pub fn set_member_points(&self, member_id: &str, points: i64) -> bool {
        self.update(|state| state.members.update(member_id, |m| m.points = points))
    }

    pub fn clear(&self) {
        self.update(|state| *state = CacheSnapshot::default());
        debug!("Cache cleared");
    }

    /// Number of loads started since creation.
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::SeqCst)
    }
}

fn settle<T: CacheEntity>(
    result: Result<DomainCollection<T>, GatewayError>,
    member_id: Option<EntityId>,
    silent: bool,
    report: &mut LoadReport,
) -> DomainCollection<T> {
    match result {
        Ok(collection) => collection,
        Err(error) => {
            if silent {
                debug!(domain = %T::DOMAIN, member_id = ?member_id, error = %error, "Fetch failed; using empty collection");
            } else {
                warn!(domain = %T::DOMAIN, member_id = ?member_id, error = %error, "Fetch failed; using empty collection");
            }
            report.failed.push(DomainFailure {
                domain: T::DOMAIN,
                member_id,
                error,
            });
            DomainCollection::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_records_shapes() {
        assert_eq!(
            extract_records(Domain::Tasks, json!([{"id": "1"}])).unwrap().len(),
            1
        );
        assert_eq!(
            extract_records(Domain::Tasks, json!({"tasks": [{"id": "1"}, {"id": "2"}]}))
                .unwrap()
                .len(),
            2
        );
        assert!(extract_records(Domain::Tasks, Value::Null).unwrap().is_empty());
        assert!(extract_records(Domain::Tasks, json!({"members": []})).is_err());
        assert!(extract_records(Domain::Tasks, json!("nope")).is_err());
    }

    #[test]
    fn test_paths() {
        let household = EntityId::from("H1");
        assert_eq!(domain_path(&household, Domain::StoreItems), "/households/H1/store");
        assert_eq!(wishlist_path(&EntityId::from("m1")), "/members/m1/wishlist");
    }

    #[test]
    fn test_snapshot_patch_searches_all_wishlists() {
        let mut snapshot = CacheSnapshot::default();
        snapshot.wishlists.insert(
            EntityId::from("m1"),
            DomainCollection::from_raw(vec![json!({"id": "w1", "title": "Bike"})]),
        );
        snapshot.wishlists.insert(
            EntityId::from("m2"),
            DomainCollection::from_raw(vec![json!({"_id": "w2", "title": "Kite"})]),
        );
        let patch = json!({"title": "Red kite"}).as_object().cloned().unwrap();
        assert!(snapshot.merge_patch(Domain::Wishlists, "w2", &patch).unwrap());
        assert_eq!(
            snapshot.wishlists[&EntityId::from("m2")].get("w2").unwrap().title,
            "Red kite"
        );
        assert!(!snapshot.merge_patch(Domain::Wishlists, "w9", &patch).unwrap());
    }

    #[test]
    fn test_snapshot_len_and_empty() {
        let mut snapshot = CacheSnapshot::default();
        assert!(snapshot.is_empty());
        snapshot.members =
            DomainCollection::from_raw(vec![json!({"id": "m1", "name": "Ada", "points": 40})]);
        assert_eq!(snapshot.len(Domain::Members), 1);
        assert_eq!(snapshot.member_points("m1"), Some(40));
        assert!(!snapshot.is_empty());
    }
}
