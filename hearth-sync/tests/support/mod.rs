//! Scripted fakes shared by the integration suites.

#![allow(dead_code)]

use async_trait::async_trait;
use hearth_core::{EntityId, MemberRole, PushFrame};
use hearth_sync::config::SyncConfig;
use hearth_sync::gateway::{HttpRequest, HttpResponse, HttpTransport, TransportError};
use hearth_sync::realtime::{PushConnection, PushTransport, RealtimeError};
use hearth_sync::session::{Session, SessionUser};
use hearth_sync::HouseholdClient;
use hearth_test_utils::fixtures;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub const API_BASE: &str = "http://hearth.test/api";
pub const WS_ENDPOINT: &str = "ws://hearth.test/socket";

pub fn test_config() -> SyncConfig {
    let mut config = SyncConfig::standard(API_BASE, WS_ENDPOINT);
    config.reconnect.jitter_ms = 0;
    config
}

pub fn parent_session(token: &str) -> Session {
    Session::new(
        token,
        SessionUser {
            id: EntityId::from(fixtures::PARENT_ID),
            name: "Pat".to_string(),
            role: MemberRole::Parent,
        },
        Some(EntityId::from(fixtures::HOUSEHOLD_ID)),
    )
}

pub fn client(http: &Arc<ScriptedTransport>, push: &Arc<FakePushTransport>) -> Arc<HouseholdClient> {
    Arc::new(HouseholdClient::with_parts(
        &test_config(),
        http.clone(),
        push.clone(),
    ))
}

/// Poll `condition` under (possibly paused) tokio time until it holds.
pub async fn eventually<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held: {}", what);
}

// ============================================================================
// HTTP
// ============================================================================

#[derive(Debug, Clone)]
pub enum Reply {
    Json(u16, Value),
    Raw(u16, String),
    Fail(TransportError),
    /// Answer with `Json(200, body)` after a delay.
    Delayed(Duration, Value),
    Hang,
}

/// Serves canned replies by path. One-shot replies queued with `enqueue` are
/// used before the standing reply set with `route`.
#[derive(Default)]
pub struct ScriptedTransport {
    routes: Mutex<HashMap<String, Reply>>,
    queued: Mutex<HashMap<String, VecDeque<Reply>>>,
    seen: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn route(&self, path: &str, reply: Reply) {
        self.routes.lock().unwrap().insert(path.to_string(), reply);
    }

    pub fn enqueue(&self, path: &str, reply: Reply) {
        self.queued
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .push_back(reply);
    }

    /// Standing success replies for the health probe and every household path.
    pub fn serve_household(&self, child_points: i64) {
        self.route("/health", Reply::Json(200, serde_json::json!({"ok": true})));
        for (path, data) in fixtures::household(child_points) {
            self.route(&path, Reply::Json(200, fixtures::envelope(data)));
        }
    }

    pub fn serve_login(&self, token: &str) {
        self.route("/auth/login", Reply::Json(200, fixtures::login_response(token)));
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.seen.lock().unwrap().clone()
    }

    pub fn count(&self, path: &str) -> usize {
        self.requests()
            .iter()
            .filter(|request| path_of(request) == path)
            .count()
    }

    pub fn last_to(&self, path: &str) -> Option<HttpRequest> {
        self.requests()
            .into_iter()
            .filter(|request| path_of(request) == path)
            .last()
    }

    fn next_reply(&self, path: &str) -> Option<Reply> {
        if let Some(queue) = self.queued.lock().unwrap().get_mut(path) {
            if let Some(reply) = queue.pop_front() {
                return Some(reply);
            }
        }
        self.routes.lock().unwrap().get(path).cloned()
    }
}

pub fn path_of(request: &HttpRequest) -> &str {
    request.url.strip_prefix(API_BASE).unwrap_or(&request.url)
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let path = path_of(&request).to_string();
        self.seen.lock().unwrap().push(request);

        match self.next_reply(&path) {
            Some(Reply::Json(status, body)) => Ok(HttpResponse::new(status, body.to_string())),
            Some(Reply::Raw(status, body)) => Ok(HttpResponse::new(status, body)),
            Some(Reply::Fail(err)) => Err(err),
            Some(Reply::Delayed(delay, body)) => {
                tokio::time::sleep(delay).await;
                Ok(HttpResponse::new(200, body.to_string()))
            }
            Some(Reply::Hang) => std::future::pending().await,
            None => Ok(HttpResponse::new(
                404,
                fixtures::error_body(&format!("no route for {}", path)).to_string(),
            )),
        }
    }
}

// ============================================================================
// PUSH
// ============================================================================

type Inbound = mpsc::UnboundedSender<Option<PushFrame>>;

/// In-memory push transport. Each successful connect replaces the live
/// connection that `push` and `drop_connection` talk to.
#[derive(Default)]
pub struct FakePushTransport {
    tokens: Mutex<Vec<String>>,
    refusals: AtomicUsize,
    live: Mutex<Option<Inbound>>,
    sent: Arc<Mutex<Vec<PushFrame>>>,
}

impl FakePushTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `n` connection attempts.
    pub fn refuse_next(&self, n: usize) {
        self.refusals.store(n, Ordering::SeqCst);
    }

    /// Tokens presented at each handshake, refused ones included.
    pub fn tokens(&self) -> Vec<String> {
        self.tokens.lock().unwrap().clone()
    }

    pub fn connects(&self) -> usize {
        self.tokens.lock().unwrap().len()
    }

    /// Deliver a server frame on the live connection.
    pub fn push(&self, event: &str, data: Value) -> bool {
        match self.live.lock().unwrap().as_ref() {
            Some(tx) => tx.send(Some(PushFrame::new(event, data))).is_ok(),
            None => false,
        }
    }

    /// Simulate the server closing the live connection.
    pub fn drop_connection(&self) {
        if let Some(tx) = self.live.lock().unwrap().take() {
            let _ = tx.send(None);
        }
    }

    pub fn sent(&self) -> Vec<PushFrame> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl PushTransport for FakePushTransport {
    async fn connect(&self, token: &str) -> Result<Box<dyn PushConnection>, RealtimeError> {
        self.tokens.lock().unwrap().push(token.to_string());
        let refused = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(RealtimeError::Handshake("refused by fake".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *self.live.lock().unwrap() = Some(tx);
        Ok(Box::new(FakeConnection {
            inbound: rx,
            sent: Arc::clone(&self.sent),
        }))
    }
}

struct FakeConnection {
    inbound: mpsc::UnboundedReceiver<Option<PushFrame>>,
    sent: Arc<Mutex<Vec<PushFrame>>>,
}

#[async_trait]
impl PushConnection for FakeConnection {
    async fn next_frame(&mut self) -> Option<Result<PushFrame, RealtimeError>> {
        match self.inbound.recv().await {
            Some(Some(frame)) => Some(Ok(frame)),
            Some(None) | None => None,
        }
    }

    async fn send_frame(&mut self, frame: PushFrame) -> Result<(), RealtimeError> {
        self.sent.lock().unwrap().push(frame);
        Ok(())
    }

    async fn close(&mut self) {
        self.inbound.close();
    }
}
