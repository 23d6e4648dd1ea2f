//! Realtime push channel with capped reconnect backoff.
//!
//! ## Architecture
//!
//! - `SubscriptionRegistry` maps event names to callbacks and lives for the
//!   whole process, independent of any socket
//! - `RealtimeChannel` owns the connection state machine; the socket under it
//!   is rebuilt on every reconnect and every token change
//! - The driver task follows the `SessionStore`: a token connects, no token
//!   disconnects, a new token tears down and reconnects with the new one

use crate::config::ReconnectConfig;
use crate::session::{Session, SessionStore};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use hearth_core::PushFrame;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

const OUTBOUND_CAPACITY: usize = 64;
const TRANSITION_CAPACITY: usize = 64;

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Clone, thiserror::Error)]
pub enum RealtimeError {
    #[error("Invalid realtime endpoint: {0}")]
    Endpoint(String),
    #[error("Realtime handshake failed: {0}")]
    Handshake(String),
    #[error("Realtime connection lost: {0}")]
    Transport(String),
    #[error("Malformed realtime frame: {0}")]
    Decode(String),
}

// ============================================================================
// STATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelState::Disconnected => f.write_str("disconnected"),
            ChannelState::Connecting => f.write_str("connecting"),
            ChannelState::Connected => f.write_str("connected"),
            ChannelState::Reconnecting { attempt } => write!(f, "reconnecting({attempt})"),
        }
    }
}

// ============================================================================
// SUBSCRIPTIONS
// ============================================================================

pub type ListenerId = u64;

type Callback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Event name -> callbacks. Outlives every connection.
#[derive(Default)]
pub struct SubscriptionRegistry {
    listeners: RwLock<HashMap<String, Vec<(ListenerId, Callback)>>>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, event: impl Into<String>, callback: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        listeners
            .entry(event.into())
            .or_default()
            .push((id, Arc::new(callback)));
        id
    }

    /// Remove one callback. Returns false if it was not registered.
    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let Some(entries) = listeners.get_mut(event) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(listener, _)| *listener != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            listeners.remove(event);
        }
        removed
    }

    /// Invoke every callback registered for `event`; returns how many ran.
    pub fn dispatch(&self, event: &str, data: &Value) -> usize {
        // Callbacks run outside the lock so they may register or unregister.
        let callbacks: Vec<Callback> = {
            let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
            listeners
                .get(event)
                .map(|entries| entries.iter().map(|(_, cb)| Arc::clone(cb)).collect())
                .unwrap_or_default()
        };
        for callback in &callbacks {
            callback(data);
        }
        callbacks.len()
    }

    pub fn listener_count(&self, event: &str) -> usize {
        let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
        listeners.get(event).map(Vec::len).unwrap_or(0)
    }

    pub fn events(&self) -> Vec<String> {
        let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
        listeners.keys().cloned().collect()
    }
}

// ============================================================================
// TRANSPORT
// ============================================================================

/// Opens authenticated push connections.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn connect(&self, token: &str) -> Result<Box<dyn PushConnection>, RealtimeError>;
}

/// One live push connection. `next_frame` must be cancel-safe.
#[async_trait]
pub trait PushConnection: Send {
    /// `None` once the peer has closed the connection.
    async fn next_frame(&mut self) -> Option<Result<PushFrame, RealtimeError>>;
    async fn send_frame(&mut self, frame: PushFrame) -> Result<(), RealtimeError>;
    async fn close(&mut self);
}

pub struct WsPushTransport {
    endpoint: String,
}

impl WsPushTransport {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl PushTransport for WsPushTransport {
    async fn connect(&self, token: &str) -> Result<Box<dyn PushConnection>, RealtimeError> {
        let mut request = self
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| RealtimeError::Endpoint(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| RealtimeError::Handshake(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| RealtimeError::Handshake(e.to_string()))?;
        Ok(Box::new(WsConnection { stream }))
    }
}

struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
}

#[async_trait]
impl PushConnection for WsConnection {
    async fn next_frame(&mut self) -> Option<Result<PushFrame, RealtimeError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => {
                    return Some(
                        serde_json::from_str::<PushFrame>(&text)
                            .map_err(|e| RealtimeError::Decode(e.to_string())),
                    );
                }
                Ok(Message::Close(_)) => return None,
                Ok(_) => {}
                Err(err) => return Some(Err(RealtimeError::Transport(err.to_string()))),
            }
        }
    }

    async fn send_frame(&mut self, frame: PushFrame) -> Result<(), RealtimeError> {
        let text =
            serde_json::to_string(&frame).map_err(|e| RealtimeError::Decode(e.to_string()))?;
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| RealtimeError::Transport(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

// ============================================================================
// CHANNEL
// ============================================================================

enum SessionSignal {
    /// A different token (or none) is now current.
    Changed,
    /// The session store itself is gone.
    Closed,
}

enum CycleEnd {
    Session(SessionSignal),
    Exhausted,
}

pub struct RealtimeChannel {
    transport: Arc<dyn PushTransport>,
    registry: Arc<SubscriptionRegistry>,
    reconnect: ReconnectConfig,
    state_tx: watch::Sender<ChannelState>,
    transitions: broadcast::Sender<ChannelState>,
    outbound: Mutex<Option<mpsc::Sender<PushFrame>>>,
}

impl RealtimeChannel {
    pub fn new(
        transport: Arc<dyn PushTransport>,
        registry: Arc<SubscriptionRegistry>,
        reconnect: ReconnectConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(ChannelState::Disconnected);
        let (transitions, _) = broadcast::channel(TRANSITION_CAPACITY);
        Self {
            transport,
            registry,
            reconnect,
            state_tx,
            transitions,
            outbound: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn state(&self) -> ChannelState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state_tx.subscribe()
    }

    /// Every state change, in order. Lagging receivers lose the oldest.
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<ChannelState> {
        self.transitions.subscribe()
    }

    pub async fn wait_for_state(&self, target: ChannelState) -> ChannelState {
        let mut rx = self.state_tx.subscribe();
        let reached = match rx.wait_for(|state| *state == target).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        reached
    }

    pub fn on<F>(&self, event: impl Into<String>, callback: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.registry.on(event, callback)
    }

    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        self.registry.off(event, id)
    }

    /// Send an event to the server. Only honored while connected; otherwise
    /// the event is dropped without any I/O and `false` is returned.
    pub fn emit(&self, event: &str, data: Value) -> bool {
        let state = self.state();
        if state != ChannelState::Connected {
            warn!(event, state = %state, "Dropping realtime emit while not connected");
            return false;
        }
        let outbound = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        match outbound.as_ref() {
            Some(tx) => match tx.try_send(PushFrame::new(event, data)) {
                Ok(()) => true,
                Err(err) => {
                    warn!(event, error = %err, "Realtime outbound queue rejected emit");
                    false
                }
            },
            None => {
                warn!(event, "Dropping realtime emit: no live connection");
                false
            }
        }
    }

    /// Run the connection driver for the lifetime of the session store.
    pub fn spawn(self: &Arc<Self>, sessions: SessionStore) -> JoinHandle<()> {
        let channel = Arc::clone(self);
        let session_rx = sessions.subscribe();
        tokio::spawn(async move { channel.run(session_rx).await })
    }

    async fn run(&self, mut session_rx: watch::Receiver<Option<Session>>) {
        loop {
            let token = session_rx
                .borrow_and_update()
                .as_ref()
                .map(|session| session.token.clone());

            let signal = match token {
                None => {
                    self.set_state(ChannelState::Disconnected);
                    match session_rx.changed().await {
                        Ok(()) => SessionSignal::Changed,
                        Err(_) => SessionSignal::Closed,
                    }
                }
                Some(token) => match self.connection_cycle(&token, &mut session_rx).await {
                    CycleEnd::Session(signal) => signal,
                    CycleEnd::Exhausted => wait_for_token_change(&mut session_rx, Some(&token)).await,
                },
            };

            if let SessionSignal::Closed = signal {
                self.set_state(ChannelState::Disconnected);
                debug!("Session store dropped; realtime driver exiting");
                return;
            }
        }
    }

    async fn connection_cycle(
        &self,
        token: &str,
        session_rx: &mut watch::Receiver<Option<Session>>,
    ) -> CycleEnd {
        let initial = self.reconnect.initial_ms;
        let mut backoff = initial;
        let mut failures: u32 = 0;
        self.set_state(ChannelState::Connecting);

        loop {
            let connected = tokio::select! {
                result = self.transport.connect(token) => result,
                signal = wait_for_token_change(session_rx, Some(token)) => {
                    self.set_state(ChannelState::Disconnected);
                    return CycleEnd::Session(signal);
                }
            };

            match connected {
                Ok(connection) => {
                    failures = 0;
                    backoff = initial;
                    match self.pump(connection, token, session_rx).await {
                        Ok(signal) => return CycleEnd::Session(signal),
                        Err(err) => warn!(error = %err, "Realtime connection lost"),
                    }
                }
                Err(err) => {
                    warn!(error = %err, "Realtime connect failed");
                    self.set_state(ChannelState::Disconnected);
                }
            }

            if failures >= self.reconnect.max_attempts {
                warn!(attempts = failures, "Realtime reconnect attempts exhausted");
                self.set_state(ChannelState::Disconnected);
                return CycleEnd::Exhausted;
            }
            failures += 1;
            self.set_state(ChannelState::Reconnecting { attempt: failures });

            let delay = jittered_backoff(backoff, self.reconnect.jitter_ms);
            debug!(attempt = failures, delay_ms = delay, "Scheduling realtime reconnect");
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                signal = wait_for_token_change(session_rx, Some(token)) => {
                    self.set_state(ChannelState::Disconnected);
                    return CycleEnd::Session(signal);
                }
            }

            let next = (backoff as f64 * self.reconnect.multiplier) as u64;
            backoff = next.min(self.reconnect.max_ms);
        }
    }

    /// Drive one live connection. `Ok` means the session moved on and the
    /// connection was closed on purpose; `Err` means the transport failed.
    async fn pump(
        &self,
        mut connection: Box<dyn PushConnection>,
        token: &str,
        session_rx: &mut watch::Receiver<Option<Session>>,
    ) -> Result<SessionSignal, RealtimeError> {
        let (tx, mut outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        self.set_outbound(Some(tx));
        self.set_state(ChannelState::Connected);
        info!("Realtime connected");

        let outcome = loop {
            tokio::select! {
                frame = connection.next_frame() => match frame {
                    Some(Ok(frame)) => {
                        let delivered = self.registry.dispatch(&frame.event, &frame.data);
                        debug!(event = %frame.event, listeners = delivered, "Realtime event");
                    }
                    Some(Err(RealtimeError::Decode(reason))) => {
                        warn!(reason = %reason, "Ignoring malformed realtime frame");
                    }
                    Some(Err(err)) => break Err(err),
                    None => break Err(RealtimeError::Transport("closed by peer".to_string())),
                },
                Some(frame) = outbound_rx.recv() => {
                    if let Err(err) = connection.send_frame(frame).await {
                        break Err(err);
                    }
                }
                signal = wait_for_token_change(session_rx, Some(token)) => {
                    connection.close().await;
                    break Ok(signal);
                }
            }
        };

        self.set_outbound(None);
        self.set_state(ChannelState::Disconnected);
        outcome
    }

    fn set_outbound(&self, tx: Option<mpsc::Sender<PushFrame>>) {
        *self.outbound.lock().unwrap_or_else(PoisonError::into_inner) = tx;
    }

    fn set_state(&self, next: ChannelState) {
        let previous = self.state_tx.send_replace(next);
        if previous != next {
            debug!(from = %previous, to = %next, "Realtime state change");
            let _ = self.transitions.send(next);
        }
    }
}

/// Resolve once the current token differs from `current`, or the store is gone.
async fn wait_for_token_change(
    session_rx: &mut watch::Receiver<Option<Session>>,
    current: Option<&str>,
) -> SessionSignal {
    loop {
        if session_rx.changed().await.is_err() {
            return SessionSignal::Closed;
        }
        let token = session_rx
            .borrow_and_update()
            .as_ref()
            .map(|session| session.token.clone());
        if token.as_deref() != current {
            return SessionSignal::Changed;
        }
    }
}

fn jittered_backoff(base_ms: u64, jitter_ms: u64) -> u64 {
    if jitter_ms == 0 {
        return base_ms;
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_nanos(0))
        .subsec_nanos() as u64;
    let jitter = nanos % jitter_ms;
    base_ms.saturating_add(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    struct RefusingTransport {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl PushTransport for RefusingTransport {
        async fn connect(&self, _token: &str) -> Result<Box<dyn PushConnection>, RealtimeError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(RealtimeError::Handshake("refused".to_string()))
        }
    }

    fn reconnect() -> ReconnectConfig {
        ReconnectConfig {
            initial_ms: 1_000,
            max_ms: 5_000,
            multiplier: 2.0,
            jitter_ms: 0,
            max_attempts: 5,
        }
    }

    #[test]
    fn test_registry_on_off_dispatch() {
        let registry = SubscriptionRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let id = registry.on("taskUpdated", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(registry.listener_count("taskUpdated"), 1);
        assert_eq!(registry.dispatch("taskUpdated", &json!({})), 1);
        assert_eq!(registry.dispatch("questUpdated", &json!({})), 0);
        assert!(registry.off("taskUpdated", id));
        assert!(!registry.off("taskUpdated", id));
        assert_eq!(registry.dispatch("taskUpdated", &json!({})), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_may_unregister_itself() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let inner = Arc::clone(&registry);
        let slot = Arc::new(AtomicU64::new(0));
        let own_id = Arc::clone(&slot);
        let id = registry.on("notification", move |_| {
            inner.off("notification", own_id.load(Ordering::SeqCst));
        });
        slot.store(id, Ordering::SeqCst);
        assert_eq!(registry.dispatch("notification", &Value::Null), 1);
        assert_eq!(registry.listener_count("notification"), 0);
    }

    #[test]
    fn test_emit_while_disconnected_is_dropped() {
        let transport = Arc::new(RefusingTransport {
            attempts: AtomicUsize::new(0),
        });
        let channel = RealtimeChannel::new(
            transport.clone(),
            Arc::new(SubscriptionRegistry::new()),
            reconnect(),
        );
        assert_eq!(channel.state(), ChannelState::Disconnected);
        assert!(!channel.emit("ping", json!({"a": 1})));
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_wait_for_current_state_returns_immediately() {
        let channel = RealtimeChannel::new(
            Arc::new(RefusingTransport {
                attempts: AtomicUsize::new(0),
            }),
            Arc::new(SubscriptionRegistry::new()),
            reconnect(),
        );
        let reached = channel.wait_for_state(ChannelState::Disconnected).await;
        assert_eq!(reached, ChannelState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_is_capped() {
        let transport = Arc::new(RefusingTransport {
            attempts: AtomicUsize::new(0),
        });
        let channel = Arc::new(RealtimeChannel::new(
            transport.clone(),
            Arc::new(SubscriptionRegistry::new()),
            reconnect(),
        ));
        let sessions = SessionStore::new();
        let mut transitions = channel.subscribe_transitions();
        let _driver = channel.spawn(sessions.clone());

        sessions.authenticate(Session::new(
            "T1",
            crate::session::SessionUser {
                id: hearth_core::EntityId::from("p1"),
                name: "Pat".to_string(),
                role: hearth_core::MemberRole::Parent,
            },
            None,
        ));

        // initial attempt plus five reconnects, then rest in Disconnected
        let mut seen = Vec::new();
        loop {
            let state = transitions.recv().await.unwrap();
            seen.push(state);
            if state == (ChannelState::Reconnecting { attempt: 5 }) {
                break;
            }
        }
        assert_eq!(seen[0], ChannelState::Connecting);
        assert_eq!(seen[1], ChannelState::Disconnected);
        assert_eq!(seen[2], ChannelState::Reconnecting { attempt: 1 });
        assert_eq!(transitions.recv().await.unwrap(), ChannelState::Disconnected);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 6);
        assert_eq!(channel.state(), ChannelState::Disconnected);
    }

    #[test]
    fn test_jitter_bounded() {
        assert_eq!(jittered_backoff(1_000, 0), 1_000);
        let value = jittered_backoff(1_000, 250);
        assert!((1_000..1_250).contains(&value));
    }
}
