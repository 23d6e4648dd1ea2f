//! HouseholdClient: the owned entry point that wires the sync layer together.
//!
//! Everything is held by `Arc` and passed in explicitly. UI code reads through
//! [`CacheStore::select`] and writes through the methods here.

use crate::cache::{CacheStore, LoadReport};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::gateway::{HttpTransport, RequestGateway};
use crate::optimistic::{FnCell, OptimisticExecutor, OptimisticState};
use crate::realtime::{
    ListenerId, PushTransport, RealtimeChannel, SubscriptionRegistry, WsPushTransport,
};
use crate::session::{Session, SessionStore, SessionUser};
use hearth_core::{canonicalize, points_event, Domain, EntityId, InvalidationEvent, Task};
use reqwest::Method;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const LOGIN_PATH: &str = "/auth/login";

/// Background tasks started by [`HouseholdClient::start`].
pub struct ClientTasks {
    pub realtime: JoinHandle<()>,
    pub session_watcher: JoinHandle<()>,
}

impl ClientTasks {
    pub fn abort(&self) {
        self.realtime.abort();
        self.session_watcher.abort();
    }
}

pub struct HouseholdClient {
    session: SessionStore,
    gateway: RequestGateway,
    cache: Arc<CacheStore>,
    realtime: Arc<RealtimeChannel>,
    points_listeners: Mutex<HashMap<EntityId, ListenerId>>,
}

impl HouseholdClient {
    pub fn new(config: &SyncConfig) -> SyncResult<Self> {
        let session = SessionStore::new();
        let gateway = RequestGateway::new(config, session.clone())?;
        let push = Arc::new(WsPushTransport::new(config.ws_endpoint.clone()));
        Ok(Self::assemble(config, session, gateway, push))
    }

    /// Build with injected transports.
    pub fn with_parts(
        config: &SyncConfig,
        http: Arc<dyn HttpTransport>,
        push: Arc<dyn PushTransport>,
    ) -> Self {
        let session = SessionStore::new();
        let gateway = RequestGateway::with_transport(config, session.clone(), http);
        Self::assemble(config, session, gateway, push)
    }

    fn assemble(
        config: &SyncConfig,
        session: SessionStore,
        gateway: RequestGateway,
        push: Arc<dyn PushTransport>,
    ) -> Self {
        let realtime = RealtimeChannel::new(
            push,
            Arc::new(SubscriptionRegistry::new()),
            config.reconnect.clone(),
        );
        Self {
            cache: Arc::new(CacheStore::new(gateway.clone())),
            session,
            gateway,
            realtime: Arc::new(realtime),
            points_listeners: Mutex::new(HashMap::new()),
        }
    }

    pub fn session(&self) -> &SessionStore {
        &self.session
    }

    pub fn gateway(&self) -> &RequestGateway {
        &self.gateway
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn realtime(&self) -> &Arc<RealtimeChannel> {
        &self.realtime
    }

    /// Start the realtime driver and the session watcher, and register the
    /// invalidation listeners. Call once per client.
    pub fn start(self: &Arc<Self>) -> ClientTasks {
        for event in InvalidationEvent::ALL {
            let client = Arc::downgrade(self);
            self.realtime.on(event.name(), move |data| {
                if let Some(client) = client.upgrade() {
                    client.on_invalidation(event, data);
                }
            });
        }

        let realtime = self.realtime.spawn(self.session.clone());
        let session_watcher = tokio::spawn(watch_session(Arc::downgrade(self), self.session.subscribe()));
        info!("Household client started");
        ClientTasks {
            realtime,
            session_watcher,
        }
    }

    fn on_invalidation(self: Arc<Self>, event: InvalidationEvent, data: &Value) {
        let entity_id = id_from_value(data);
        debug!(
            event = %event,
            entity_id = entity_id.as_ref().map_or("", EntityId::as_str),
            "Invalidation received"
        );
        tokio::spawn(async move { self.refresh_silently().await });
    }

    /// Wake the backend, sign in, and load the cache for the primary household.
    ///
    /// Returns `None` when the account has no household yet; the session is
    /// still authenticated in that case.
    pub async fn login(&self, email: &str, password: &str) -> SyncResult<Option<LoadReport>> {
        let awake = self.gateway.wake_up().await;
        debug!(awake, "Backend probed before login");

        let envelope = self
            .gateway
            .request_envelope(
                LOGIN_PATH,
                Method::POST,
                Some(json!({ "email": email, "password": password })),
            )
            .await?;

        let token = envelope
            .token
            .filter(|token| !token.is_empty())
            .ok_or_else(|| SyncError::InvalidLogin("response has no token".to_string()))?;
        let data = envelope
            .data
            .ok_or_else(|| SyncError::InvalidLogin("response has no data".to_string()))?;
        let mut parent = data
            .get("parent")
            .cloned()
            .ok_or_else(|| SyncError::InvalidLogin("response has no parent".to_string()))?;
        canonicalize(&mut parent)?;
        let user: SessionUser =
            serde_json::from_value(parent).map_err(|e| SyncError::InvalidLogin(e.to_string()))?;
        let household = data.get("primaryHouseholdId").and_then(id_from_value);

        info!(user_id = %user.id, household_id = ?household, "Login succeeded");
        let has_household = household.is_some();
        self.session.authenticate(Session::new(token, user, household));

        if !has_household {
            warn!("Signed-in user has no primary household; skipping load");
            return Ok(None);
        }
        let report = self.cache.load().await?;
        if report.committed {
            self.sync_points_listeners();
        }
        Ok(Some(report))
    }

    /// Sign out. Returns false when nobody was signed in.
    pub fn logout(&self) -> bool {
        let was_signed_in = self.session.clear("logout");
        self.cache.clear();
        self.drop_points_listeners();
        was_signed_in
    }

    /// Reload everything without user-facing noise. Failures are logged only.
    pub async fn refresh_silently(&self) {
        match self.cache.refresh(true).await {
            Ok(report) if report.committed => self.sync_points_listeners(),
            Ok(_) => {}
            Err(err) => debug!(error = %err, "Silent refresh skipped"),
        }
    }

    /// Spend `member_id`'s points on a store item.
    ///
    /// The balance drops by the item cost immediately. On success it is
    /// replaced by the server's `newPointsTotal`; on failure it is restored.
    /// Returns the member's final balance.
    pub async fn purchase_item(&self, member_id: &str, item_id: &str) -> SyncResult<i64> {
        let (member, available) = self
            .cache
            .select(|s| s.members.get(member_id).map(|m| (m.id.clone(), m.points)))
            .ok_or_else(|| SyncError::NotCached {
                domain: Domain::Members,
                id: member_id.to_string(),
            })?;
        let (item, cost) = self
            .cache
            .select(|s| s.store_items.get(item_id).map(|i| (i.id.clone(), i.cost)))
            .ok_or_else(|| SyncError::NotCached {
                domain: Domain::StoreItems,
                id: item_id.to_string(),
            })?;

        if available < cost {
            info!(member_id = %member, item_id = %item, cost, available, "Purchase refused: insufficient points");
            return Err(SyncError::InsufficientPoints {
                needed: cost,
                available,
            });
        }

        let path = format!("/store/{}/purchase", item);
        let body = json!({ "memberId": member.as_str() });
        let points = OptimisticState::new(FnCell::new(
            || self.cache.member_points(member.as_str()).unwrap_or(available),
            |value: i64| {
                self.cache.set_member_points(member.as_str(), value);
            },
        ));

        points
            .execute_confirmed(
                |current: &i64| current - cost,
                || self.gateway.post(&path, body),
                |data: &Value, current: &i64| {
                    data.get("newPointsTotal")
                        .and_then(Value::as_i64)
                        .unwrap_or(*current)
                },
            )
            .await?;

        let balance = self.cache.member_points(member.as_str()).unwrap_or(available - cost);
        info!(member_id = %member, item_id = %item, balance, "Purchase confirmed");
        Ok(balance)
    }

    /// Mark a task completed, optimistically.
    pub async fn complete_task(&self, task_id: &str) -> SyncResult<Task> {
        let snapshot = self
            .cache
            .select(|s| s.tasks.get(task_id).cloned())
            .ok_or_else(|| SyncError::NotCached {
                domain: Domain::Tasks,
                id: task_id.to_string(),
            })?;
        let id = snapshot.id.clone();
        let path = format!("/tasks/{}/complete", id);
        let cache = &self.cache;

        let data = OptimisticExecutor::execute(
            || {
                cache.update(|s| s.tasks.update(id.as_str(), |t| t.completed = true));
            },
            || {
                cache.update(|s| s.tasks.update(id.as_str(), |t| *t = snapshot));
            },
            || self.gateway.post(&path, json!({})),
        )
        .await?;

        // Completion is confirmed at this point; merge failures are not errors.
        if let Some(fields) = returned_task_fields(&data) {
            if let Err(err) = self.cache.merge_patch(Domain::Tasks, id.as_str(), fields) {
                warn!(task_id = %id, error = %err, "Returned task does not fit the cache; merging field by field");
                self.merge_fitting_fields(&id, fields);
            }
        }
        self.cache
            .select(|s| s.tasks.get(id.as_str()).cloned())
            .ok_or_else(|| SyncError::NotCached {
                domain: Domain::Tasks,
                id: id.to_string(),
            })
    }

    fn merge_fitting_fields(&self, id: &EntityId, fields: &Map<String, Value>) {
        for (field, value) in fields {
            let single = Map::from_iter([(field.clone(), value.clone())]);
            if self.cache.merge_patch(Domain::Tasks, id.as_str(), &single).is_err() {
                debug!(task_id = %id, field = %field, "Skipping returned field");
            }
        }
    }

    /// Keep one `pointsUpdated:<id>` listener per cached member.
    fn sync_points_listeners(&self) {
        let members: Vec<EntityId> = self
            .cache
            .select(|s| s.members.iter().map(|m| m.id.clone()).collect());
        let mut listeners = self
            .points_listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        listeners.retain(|member, listener| {
            let keep = members.contains(member);
            if !keep {
                self.realtime.off(&points_event(member), *listener);
            }
            keep
        });

        for member in members {
            if listeners.contains_key(&member) {
                continue;
            }
            let cache = Arc::clone(&self.cache);
            let target = member.clone();
            let listener = self.realtime.on(points_event(&member), move |data| {
                apply_points_update(&cache, &target, data);
            });
            listeners.insert(member, listener);
        }
    }

    fn drop_points_listeners(&self) {
        let mut listeners = self
            .points_listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for (member, listener) in listeners.drain() {
            self.realtime.off(&points_event(&member), listener);
        }
    }
}

async fn watch_session(
    client: Weak<HouseholdClient>,
    mut session_rx: tokio::sync::watch::Receiver<Option<Session>>,
) {
    while session_rx.changed().await.is_ok() {
        let signed_out = session_rx.borrow_and_update().is_none();
        let Some(client) = client.upgrade() else {
            return;
        };
        if signed_out {
            client.cache.clear();
            client.drop_points_listeners();
        }
    }
}

fn apply_points_update(cache: &CacheStore, member: &EntityId, data: &Value) {
    match data.get("points").and_then(Value::as_i64) {
        Some(points) => {
            if cache.set_member_points(member.as_str(), points) {
                debug!(member_id = %member, points, "Points updated from push");
            } else {
                debug!(member_id = %member, "Points update for uncached member");
            }
        }
        None => warn!(member_id = %member, "Points update without a points value"),
    }
}

/// Task fields in a completion response: either the task itself or `{task}`.
fn returned_task_fields(data: &Value) -> Option<&Map<String, Value>> {
    let fields = data.get("task").unwrap_or(data).as_object()?;
    (!fields.is_empty()).then_some(fields)
}

fn id_from_value(value: &Value) -> Option<EntityId> {
    match value {
        Value::String(s) if !s.is_empty() => Some(EntityId::new(s.as_str())),
        Value::Number(n) => Some(EntityId::new(n.to_string())),
        Value::Object(map) => map
            .get("id")
            .or_else(|| map.get("_id"))
            .and_then(id_from_value),
        _ => None,
    }
}
