#![deny(unsafe_code)]
#![warn(missing_docs)]
//! HTTP sync service for broker followers.
//!
//! Follows the codebase's existing Axum application shape: a shared state
//! threaded through `State` extractors, a typed [`ApiError`] implementing
//! `IntoResponse`, bearer-auth as a middleware layer, and request-id /
//! request-logging middleware on every route. The push channel reuses
//! `axum::extract::ws`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use axum::extract::{Path, State, WebSocketUpgrade};
use axum::extract::ws::{Message, WebSocket};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use axum::extract::Request;
use broker_config::ProviderConfigStore;
use broker_core::Broker;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

const DEFAULT_NEXT_SYNC_SECONDS: u64 = 60;
const PUSH_CHANNEL_CAPACITY: usize = 64;

/// Request body for `POST /sync`.
#[derive(Debug, Deserialize)]
pub struct SyncRequest {
    /// The follower's self-reported identifier.
    pub follower_id: String,
    /// The signing key version the follower currently holds.
    pub signing_key_version: u32,
    /// The provider-config version the follower currently holds.
    pub provider_configs_version: u64,
    /// The revocation-list version the follower currently holds.
    pub revocation_list_version: u64,
    /// Root token identifiers the follower already knows about, if any.
    #[serde(default)]
    pub known_root_tokens: Option<Vec<String>>,
}

/// Response body for `POST /sync`.
#[derive(Debug, Serialize)]
pub struct SyncResponse {
    /// The current signing key, base64, present only if the follower is
    /// behind the leader's current version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signing_key: Option<String>,
    /// The leader's current signing key version.
    pub signing_key_version: u32,
    /// The current provider configs, present only if the follower is behind.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_configs: Option<ProviderConfigStore>,
    /// The leader's current provider-config version.
    pub provider_configs_version: u64,
    /// Token ids revoked since the follower's reported version.
    pub revocation_list_delta: Vec<String>,
    /// The leader's current revocation-list version.
    pub revocation_list_version: u64,
    /// Recommended seconds until the follower's next sync.
    pub next_sync_seconds: u64,
    /// The leader's clock at response time.
    pub leader_timestamp: DateTime<Utc>,
}

/// Response body for `GET /status`.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    /// Always `"leader"`.
    pub mode: &'static str,
    /// The current signing key version.
    pub signing_key_version: u32,
    /// The current provider-config version.
    pub provider_configs_version: u64,
    /// The current revocation-list version.
    pub revocation_list_version: u64,
    /// The number of tracked revocation entries.
    pub revocation_count: usize,
    /// Identifiers of followers seen since this leader started.
    pub known_follower_ids: Vec<String>,
}

/// Response body for `POST /rotate-key`.
#[derive(Debug, Serialize)]
pub struct RotateKeyResponse {
    /// The newly current signing key version.
    pub signing_key_version: u32,
}

/// Request body for `POST /revoke/{token_id}`.
#[derive(Debug, Default, Deserialize)]
pub struct RevokeBody {
    /// Optional human-readable reason.
    pub reason: Option<String>,
}

/// Response body for `POST /revoke/{token_id}`.
#[derive(Debug, Serialize)]
pub struct RevokeResponse {
    /// The token identifier that was revoked.
    pub token_id: String,
    /// The new revocation-list version.
    pub revocation_list_version: u64,
}

/// A typed push message broadcast to connected followers over the websocket
/// channel. Delivery is best-effort: a send failure is swallowed and the
/// affected follower reconciles state at its next periodic sync.
#[derive(Debug, Clone, Serialize)]
pub struct PushMessage {
    #[serde(rename = "type")]
    kind: PushKind,
    timestamp: DateTime<Utc>,
    data: Value,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
enum PushKind {
    Revocation,
    KeyRotation,
    ConfigUpdate,
}

impl PushMessage {
    fn revocation(token_id: &str) -> Self {
        Self {
            kind: PushKind::Revocation,
            timestamp: Utc::now(),
            data: json!({ "token_id": token_id }),
        }
    }

    fn key_rotation(version: u32) -> Self {
        Self {
            kind: PushKind::KeyRotation,
            timestamp: Utc::now(),
            data: json!({ "signing_key_version": version }),
        }
    }

    fn config_update(version: u64) -> Self {
        Self {
            kind: PushKind::ConfigUpdate,
            timestamp: Utc::now(),
            data: json!({ "provider_configs_version": version }),
        }
    }
}

/// Per-follower bookkeeping, visible through `GET /status`.
struct FollowerRecord {
    last_sync_at: DateTime<Utc>,
}

/// Shared state for the leader HTTP service.
pub struct LeaderState {
    broker: Broker,
    bearer_token: String,
    followers: Mutex<HashMap<String, FollowerRecord>>,
    push: broadcast::Sender<PushMessage>,
    started_at: Instant,
}

impl LeaderState {
    /// Build leader state wrapping `broker`, authenticating followers with
    /// `bearer_token`.
    pub fn new(broker: Broker, bearer_token: impl Into<String>) -> Self {
        let (push, _) = broadcast::channel(PUSH_CHANNEL_CAPACITY);
        Self {
            broker,
            bearer_token: bearer_token.into(),
            followers: Mutex::new(HashMap::new()),
            push,
            started_at: Instant::now(),
        }
    }

    /// The composed broker facade this leader serves.
    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    /// Seconds since this leader process started.
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Persist a new provider-config snapshot and broadcast a
    /// `config_update` push message to connected followers. Not exposed
    /// over HTTP directly; intended for the operator-facing entry point
    /// (e.g. a CLI) that edits provider configuration.
    pub fn save_config_and_broadcast(
        &self,
        config: &ProviderConfigStore,
    ) -> Result<u64, broker_error::BrokerError> {
        self.broker.save_config(config)?;
        let version = self.broker.config_version()?;
        let _ = self.push.send(PushMessage::config_update(version));
        Ok(version)
    }
}

/// A structured API failure, rendered as `{"error": message}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<broker_error::BrokerError> for ApiError {
    fn from(err: broker_error::BrokerError) -> Self {
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.message().to_string())
    }
}

/// Build the Axum router exposing the leader's sync surface, protected by
/// bearer authentication on every route.
pub fn build_app(state: Arc<LeaderState>) -> Router {
    Router::new()
        .route("/sync", post(sync_handler))
        .route("/status", get(status_handler))
        .route("/rotate-key", post(rotate_key_handler))
        .route("/revoke/{token_id}", post(revoke_handler))
        .route("/ws", get(ws_handler))
        .fallback(fallback_handler)
        .layer(middleware::from_fn(request_id_middleware))
        .layer(middleware::from_fn(request_logging_middleware))
        .layer(middleware::from_fn_with_state(state.clone(), bearer_auth_middleware))
        .with_state(state)
}

async fn fallback_handler() -> ApiError {
    ApiError::new(StatusCode::NOT_FOUND, "no such route")
}

async fn bearer_auth_middleware(
    State(state): State<Arc<LeaderState>>,
    req: Request,
    next: Next,
) -> Response {
    let provided = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(token) if token == state.bearer_token => next.run(req).await,
        _ => ApiError::new(StatusCode::UNAUTHORIZED, "missing or invalid bearer token").into_response(),
    }
}

async fn request_id_middleware(req: Request, next: Next) -> Response {
    let id = Uuid::new_v4();
    let mut resp = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&id.to_string()) {
        resp.headers_mut().insert("x-request-id", value);
    }
    resp
}

async fn request_logging_middleware(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let start = Instant::now();

    let resp = next.run(req).await;

    let duration = start.elapsed();
    let status = resp.status().as_u16();
    info!(
        http.method = %method,
        http.path = %path,
        http.status = status,
        http.duration_ms = duration.as_millis() as u64,
        "request completed"
    );

    resp
}

async fn sync_handler(
    State(state): State<Arc<LeaderState>>,
    Json(req): Json<SyncRequest>,
) -> Result<Json<SyncResponse>, ApiError> {
    let broker = state.broker();
    let current_key_version = broker.current_key_version()?;
    let signing_key = if req.signing_key_version < current_key_version {
        broker.export_key(current_key_version)
    } else {
        None
    };

    let (provider_configs, provider_configs_version) = broker.load_config_versioned()?;
    let provider_configs = if req.provider_configs_version < provider_configs_version {
        Some(provider_configs)
    } else {
        None
    };

    let revocation_list_version = broker.revocation_version();
    let revocation_list_delta = broker.revocations_since(req.revocation_list_version);

    state.followers.lock().expect("followers lock poisoned").insert(
        req.follower_id.clone(),
        FollowerRecord {
            last_sync_at: Utc::now(),
        },
    );

    info!(follower_id = %req.follower_id, "follower sync");

    Ok(Json(SyncResponse {
        signing_key,
        signing_key_version: current_key_version,
        provider_configs,
        provider_configs_version,
        revocation_list_delta,
        revocation_list_version,
        next_sync_seconds: DEFAULT_NEXT_SYNC_SECONDS,
        leader_timestamp: Utc::now(),
    }))
}

async fn status_handler(State(state): State<Arc<LeaderState>>) -> Result<Json<StatusResponse>, ApiError> {
    let broker = state.broker();
    let (_, provider_configs_version) = broker.load_config_versioned()?;
    let mut followers: Vec<(String, DateTime<Utc>)> = state
        .followers
        .lock()
        .expect("followers lock poisoned")
        .iter()
        .map(|(id, record)| (id.clone(), record.last_sync_at))
        .collect();
    followers.sort_by_key(|(_, last_sync_at)| std::cmp::Reverse(*last_sync_at));
    let known_follower_ids = followers.into_iter().map(|(id, _)| id).collect();

    Ok(Json(StatusResponse {
        mode: "leader",
        signing_key_version: broker.current_key_version()?,
        provider_configs_version,
        revocation_list_version: broker.revocation_version(),
        revocation_count: broker.revocation_count(),
        known_follower_ids,
    }))
}

async fn rotate_key_handler(
    State(state): State<Arc<LeaderState>>,
) -> Result<Json<RotateKeyResponse>, ApiError> {
    let version = state.broker().rotate_key()?;
    let _ = state.push.send(PushMessage::key_rotation(version));
    Ok(Json(RotateKeyResponse {
        signing_key_version: version,
    }))
}

async fn revoke_handler(
    State(state): State<Arc<LeaderState>>,
    Path(token_id): Path<String>,
    Json(body): Json<RevokeBody>,
) -> Result<Json<RevokeResponse>, ApiError> {
    state.broker().revoke(broker_revocation::RevokeParams {
        token_id: token_id.clone(),
        reason: body.reason,
        ..Default::default()
    })?;
    let _ = state.push.send(PushMessage::revocation(&token_id));
    Ok(Json(RevokeResponse {
        token_id,
        revocation_list_version: state.broker().revocation_version(),
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<LeaderState>>,
) -> Response {
    ws.on_upgrade(move |socket| push_loop(socket, state))
}

async fn push_loop(mut socket: WebSocket, state: Arc<LeaderState>) {
    let mut rx = state.push.subscribe();
    while let Ok(message) = rx.recv().await {
        let Ok(body) = serde_json::to_string(&message) else {
            continue;
        };
        if socket.send(Message::Text(body.into())).await.is_err() {
            break;
        }
    }
}
