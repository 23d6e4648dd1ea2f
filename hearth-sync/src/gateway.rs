//! Request gateway for the household REST API.
//!
//! Every remote call goes through [`RequestGateway`]: it attaches the session
//! token, bounds each attempt with a timeout, retries transient failures with
//! exponential backoff and classifies everything else into [`GatewayError`].
//! The actual bytes move through an [`HttpTransport`], which is `reqwest` in
//! production.

use crate::config::SyncConfig;
use crate::session::SessionStore;
use async_trait::async_trait;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Header carrying a per-call key so the backend can drop duplicate mutations.
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// Lower-cased fragments that mark an error message as an authentication failure.
const AUTH_MARKERS: &[&str] = &["unauthorized", "invalid token", "token expired", "jwt expired"];

/// Fragments that mark a 500 as the backend's unhandled expired-token crash.
const EXPIRED_TOKEN_500_MARKERS: &[&str] = &["jwt expired", "tokenexpirederror"];

// ============================================================================
// ERRORS
// ============================================================================

/// Coarse failure classes, used for retry and session decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Timeout,
    NetworkUnavailable,
    ServerError,
    ClientError,
    ParseError,
    AuthExpired,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),
    #[error("{message}")]
    ServerError { status: u16, message: String },
    #[error("{message}")]
    ClientError { status: u16, message: String },
    #[error("Malformed response: {0}")]
    ParseError(String),
    #[error("Session expired: {0}")]
    AuthExpired(String),
    #[error("Request failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<GatewayError>,
    },
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::Timeout(_) | GatewayError::RetriesExhausted { .. } => ErrorKind::Timeout,
            GatewayError::NetworkUnavailable(_) => ErrorKind::NetworkUnavailable,
            GatewayError::ServerError { .. } => ErrorKind::ServerError,
            GatewayError::ClientError { .. } | GatewayError::InvalidRequest(_) => {
                ErrorKind::ClientError
            }
            GatewayError::ParseError(_) => ErrorKind::ParseError,
            GatewayError::AuthExpired(_) => ErrorKind::AuthExpired,
        }
    }

    /// Only timeouts and connectivity loss are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::Timeout(_) | GatewayError::NetworkUnavailable(_)
        )
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            GatewayError::ServerError { status, .. } | GatewayError::ClientError { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }
}

// ============================================================================
// TRANSPORT
// ============================================================================

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(&'static str, String)>,
    pub body: Option<Value>,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request interrupted: {0}")]
    Interrupted(String),
    #[error("request could not be built: {0}")]
    Invalid(String),
}

impl TransportError {
    fn into_gateway(self, timeout: Duration) -> GatewayError {
        match self {
            TransportError::Timeout => GatewayError::Timeout(timeout),
            TransportError::Connect(reason) | TransportError::Interrupted(reason) => {
                GatewayError::NetworkUnavailable(reason)
            }
            TransportError::Invalid(reason) => GatewayError::InvalidRequest(reason),
        }
    }
}

/// Moves one request over the wire. Implementations must not retry.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| GatewayError::InvalidRequest(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = self.client.request(request.method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(*name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(map_reqwest_error)?;
        Ok(HttpResponse { status, body })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else if err.is_builder() {
        TransportError::Invalid(err.to_string())
    } else {
        TransportError::Interrupted(err.to_string())
    }
}

// ============================================================================
// ENVELOPE
// ============================================================================

/// Response body shape shared by every endpoint.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub status: Option<Value>,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

/// Turn a raw response into an envelope or a classified failure.
pub fn interpret_response(response: HttpResponse) -> Result<Envelope, GatewayError> {
    if !(200..300).contains(&response.status) {
        let message = extract_error_message(&response.body);
        return Err(classify_failure(response.status, message));
    }
    if response.body.trim().is_empty() {
        return Ok(Envelope::default());
    }
    serde_json::from_str::<Envelope>(&response.body)
        .map_err(|e| GatewayError::ParseError(e.to_string()))
}

/// Pull `message` (or `error`) out of a JSON error body, else use the raw text.
pub fn extract_error_message(body: &str) -> String {
    if let Ok(Value::Object(object)) = serde_json::from_str::<Value>(body) {
        for field in ["message", "error"] {
            match object.get(field) {
                Some(Value::String(message)) => return message.clone(),
                Some(Value::Object(nested)) => {
                    if let Some(Value::String(message)) = nested.get("message") {
                        return message.clone();
                    }
                }
                _ => {}
            }
        }
    }
    body.to_string()
}

pub fn classify_failure(status: u16, message: String) -> GatewayError {
    let lowered = message.to_ascii_lowercase();
    let auth_marked = AUTH_MARKERS.iter().any(|marker| lowered.contains(marker));
    // The backend answers an expired JWT with an unhandled 500 on some routes.
    let expired_500 =
        status == 500 && EXPIRED_TOKEN_500_MARKERS.iter().any(|marker| lowered.contains(marker));

    if status == 401 || expired_500 || (auth_marked && status < 500) {
        GatewayError::AuthExpired(message)
    } else if status >= 500 {
        GatewayError::ServerError { status, message }
    } else {
        GatewayError::ClientError { status, message }
    }
}

// ============================================================================
// RETRY POLICY
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &crate::config::RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            multiplier: config.multiplier,
        }
    }

    /// Delay after the failed attempt with zero-based index `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt as i32);
        Duration::from_millis((self.initial_backoff.as_millis() as f64 * factor) as u64)
    }

    /// The nominal delay schedule, one entry per attempt.
    pub fn schedule(&self) -> Vec<Duration> {
        (0..self.max_attempts).map(|n| self.backoff(n)).collect()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: crate::config::DEFAULT_RETRY_ATTEMPTS,
            initial_backoff: Duration::from_millis(crate::config::DEFAULT_RETRY_BACKOFF_MS),
            multiplier: 2.0,
        }
    }
}

fn is_idempotent(method: &Method) -> bool {
    !matches!(*method, Method::POST | Method::PATCH)
}

// ============================================================================
// GATEWAY
// ============================================================================

#[derive(Clone)]
pub struct RequestGateway {
    transport: Arc<dyn HttpTransport>,
    base_url: String,
    health_path: String,
    request_timeout: Duration,
    health_timeout: Duration,
    retry: RetryPolicy,
    session: SessionStore,
}

impl RequestGateway {
    pub fn new(config: &SyncConfig, session: SessionStore) -> Result<Self, GatewayError> {
        let transport = ReqwestTransport::new()?;
        Ok(Self::with_transport(config, session, Arc::new(transport)))
    }

    pub fn with_transport(
        config: &SyncConfig,
        session: SessionStore,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        Self {
            transport,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            health_path: config.health_path.clone(),
            request_timeout: config.request_timeout(),
            health_timeout: config.health_timeout(),
            retry: RetryPolicy::from_config(&config.retry),
            session,
        }
    }

    pub fn session(&self) -> &SessionStore {
        &self.session
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Issue a call and return the envelope's `data` exactly as received
    /// (`null` when the envelope has none).
    pub async fn request(
        &self,
        path: &str,
        method: Method,
        body: Option<Value>,
    ) -> Result<Value, GatewayError> {
        let envelope = self.request_envelope(path, method, body).await?;
        Ok(envelope.data.unwrap_or(Value::Null))
    }

    pub async fn request_json<T: DeserializeOwned>(
        &self,
        path: &str,
        method: Method,
        body: Option<Value>,
    ) -> Result<T, GatewayError> {
        let data = self.request(path, method, body).await?;
        serde_json::from_value(data).map_err(|e| GatewayError::ParseError(e.to_string()))
    }

    pub async fn get(&self, path: &str) -> Result<Value, GatewayError> {
        self.request(path, Method::GET, None).await
    }

    pub async fn post(&self, path: &str, body: Value) -> Result<Value, GatewayError> {
        self.request(path, Method::POST, Some(body)).await
    }

    /// Issue a call and return the whole envelope (login needs `token`).
    ///
    /// Timeouts and connectivity failures are retried for every method. POST
    /// and PATCH carry one idempotency key across all of their attempts so a
    /// retried mutation can be recognized server-side.
    pub async fn request_envelope(
        &self,
        path: &str,
        method: Method,
        body: Option<Value>,
    ) -> Result<Envelope, GatewayError> {
        let idempotency_key = (!is_idempotent(&method)).then(|| Uuid::new_v4().to_string());
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let request =
                self.build_request(path, &method, body.clone(), idempotency_key.as_deref(), true);
            let sent_token = request
                .header("authorization")
                .and_then(|value| value.strip_prefix("Bearer "))
                .map(str::to_string);
            debug!(method = %method, path, attempt, "Sending request");

            match self.attempt(request, self.request_timeout).await {
                Ok(envelope) => return Ok(envelope),
                Err(err) if err.is_transient() => {
                    if attempt >= self.retry.max_attempts {
                        error!(method = %method, path, attempts = attempt, error = %err, "Retries exhausted");
                        return Err(GatewayError::RetriesExhausted {
                            attempts: attempt,
                            last: Box::new(err),
                        });
                    }
                    let delay = self.retry.backoff(attempt - 1);
                    warn!(
                        method = %method,
                        path,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(GatewayError::AuthExpired(message)) => {
                    warn!(method = %method, path, "Authentication expired");
                    if let Some(token) = sent_token {
                        self.session.clear_token(&token, "authentication expired");
                    }
                    return Err(GatewayError::AuthExpired(message));
                }
                Err(err) => {
                    debug!(method = %method, path, error = %err, "Request failed");
                    return Err(err);
                }
            }
        }
    }

    /// Best-effort ping to get a sleeping backend started. Never fails.
    pub async fn wake_up(&self) -> bool {
        let request = self.build_request(&self.health_path, &Method::GET, None, None, false);
        let awake = match tokio::time::timeout(self.health_timeout, self.transport.send(request)).await
        {
            Ok(Ok(response)) => (200..300).contains(&response.status),
            Ok(Err(err)) => {
                debug!(error = %err, "Health probe failed");
                false
            }
            Err(_) => {
                debug!(timeout_ms = self.health_timeout.as_millis() as u64, "Health probe timed out");
                false
            }
        };
        debug!(awake, "Health probe finished");
        awake
    }

    async fn attempt(
        &self,
        request: HttpRequest,
        timeout: Duration,
    ) -> Result<Envelope, GatewayError> {
        // Dropping the send future on timeout aborts the in-flight call.
        let response = match tokio::time::timeout(timeout, self.transport.send(request)).await {
            Err(_) => return Err(GatewayError::Timeout(timeout)),
            Ok(Err(err)) => return Err(err.into_gateway(timeout)),
            Ok(Ok(response)) => response,
        };
        interpret_response(response)
    }

    fn build_request(
        &self,
        path: &str,
        method: &Method,
        body: Option<Value>,
        idempotency_key: Option<&str>,
        authenticated: bool,
    ) -> HttpRequest {
        let url = if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        };

        let mut headers = vec![
            ("accept", "application/json".to_string()),
            ("cache-control", "no-cache".to_string()),
            ("pragma", "no-cache".to_string()),
        ];
        if body.is_some() {
            headers.push(("content-type", "application/json".to_string()));
        }
        if authenticated {
            if let Some(token) = self.session.token() {
                headers.push(("authorization", format!("Bearer {}", token)));
            }
        }
        if let Some(key) = idempotency_key {
            headers.push((IDEMPOTENCY_KEY_HEADER, key.to_string()));
        }

        HttpRequest {
            method: method.clone(),
            url,
            headers,
            body,
        }
    }
}
