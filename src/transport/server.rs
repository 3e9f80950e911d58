//! # Transport Server
//!
//! The inbound half of the transport: one axum application exposing the
//! well-known control paths (`/auth`, `/rpc`, `/gossip/*`, `/lp/*`,
//! `/health`, `/metrics`). Every RPC is authenticated and rate limited;
//! request ids deduplicate client retries; errors travel as structured
//! bodies inside an HTTP 200 envelope.

use axum::extract::{ConnectInfo, Path, Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::{debug, info};

use crate::auth::{AuthManager, TokenClaims};
use crate::config::NodeConfig;
use crate::gossip::registry::GossipRegistry;
use crate::mailbox::Mailbox;
use crate::services::runtime::ServiceRuntime;
use crate::transport::rate_limit::RateLimiter;
use crate::transport::{
    AuthRequest, AuthResponse, GossipPullResponse, GossipPushRequest, LongPollResponse,
    RpcRequest, RpcResponse,
};
use crate::types::{FabricError, FabricResult, RpcErrorBody};

const DEDUP_TTL: Duration = Duration::from_secs(60);
const DEDUP_HIGH_WATER: usize = 1_024;

/// Shared state behind every handler.
pub struct ServerState {
    pub config: Arc<NodeConfig>,
    pub auth: Arc<AuthManager>,
    pub runtime: Arc<ServiceRuntime>,
    pub registry: Arc<GossipRegistry>,
    pub mailbox: Arc<Mailbox>,
    pub rate_limiter: Arc<RateLimiter>,
    pub cancel: CancellationToken,
    started_at: Instant,
    recent_requests: DashMap<String, (Instant, RpcResponse)>,
}

impl ServerState {
    pub fn new(
        config: Arc<NodeConfig>,
        auth: Arc<AuthManager>,
        runtime: Arc<ServiceRuntime>,
        registry: Arc<GossipRegistry>,
        mailbox: Arc<Mailbox>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        Arc::new(Self {
            config,
            auth,
            runtime,
            registry,
            mailbox,
            rate_limiter,
            cancel,
            started_at: Instant::now(),
            recent_requests: DashMap::new(),
        })
    }

    fn bearer_claims(&self, headers: &HeaderMap) -> FabricResult<TokenClaims> {
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or_else(|| FabricError::AuthInvalid("missing bearer token".into()))?;
        self.auth.verify_token(token)
    }

    fn remember(&self, response: &RpcResponse) {
        if self.recent_requests.len() > DEDUP_HIGH_WATER {
            self.recent_requests
                .retain(|_, (stored_at, _)| stored_at.elapsed() < DEDUP_TTL);
        }
        self.recent_requests
            .insert(response.id.clone(), (Instant::now(), response.clone()));
    }

    fn replay(&self, request_id: &str) -> Option<RpcResponse> {
        self.recent_requests.get(request_id).and_then(|entry| {
            let (stored_at, response) = entry.value();
            (stored_at.elapsed() < DEDUP_TTL).then(|| response.clone())
        })
    }
}

pub type SharedState = Arc<ServerState>;

/// Build the axum application.
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/auth", post(auth_handler))
        .route("/rpc", post(rpc_handler))
        .route("/gossip/pull", get(gossip_pull_handler))
        .route("/gossip/push", post(gossip_push_handler))
        .route("/lp/:client_id", get(lp_poll_handler))
        .route("/lp/:client_id/push", post(lp_push_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit_layer))
        .layer(ServiceBuilder::new().layer(CorsLayer::permissive()))
        .with_state(state)
}

/// Bind and serve until cancellation.
pub async fn serve(state: SharedState) -> anyhow::Result<()> {
    let addr = format!("{}:{}", state.config.bind_address, state.config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Transport server listening on {}", addr);

    let cancel = state.cancel.clone();
    let app = router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { cancel.cancelled().await })
    .await?;
    Ok(())
}

async fn rate_limit_layer(
    State(state): State<SharedState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    // Long-poll paths share one bucket per client IP.
    let path = request.uri().path();
    let bucket_path = if path.starts_with("/lp/") { "/lp" } else { path }.to_string();

    match state.rate_limiter.check(&addr.ip().to_string(), &bucket_path) {
        Ok(()) => next.run(request).await,
        Err(retry_after) => (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, retry_after.to_string())],
            Json(json!({
                "error": {
                    "code": "rate_limited",
                    "message": format!("rate limit exceeded, retry after {retry_after}s"),
                }
            })),
        )
            .into_response(),
    }
}

async fn auth_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(request): Json<AuthRequest>,
) -> Json<AuthResponse> {
    let response = match request {
        AuthRequest::Challenge { node_id } => AuthResponse {
            challenge: Some(state.auth.begin_handshake(&node_id)),
            token: None,
            success: true,
            error: None,
        },
        AuthRequest::Response { node_id, role, signature } => {
            match state.auth.complete_handshake(&node_id, role, &signature) {
                Ok(token) => AuthResponse {
                    challenge: None,
                    token: Some(token),
                    success: true,
                    error: None,
                },
                Err(err) => AuthResponse {
                    challenge: None,
                    token: None,
                    success: false,
                    error: Some((&err).into()),
                },
            }
        }
        AuthRequest::Logout => match state.bearer_claims(&headers) {
            Ok(claims) => {
                state.auth.revoke(&claims);
                AuthResponse { challenge: None, token: None, success: true, error: None }
            }
            Err(err) => AuthResponse {
                challenge: None,
                token: None,
                success: false,
                error: Some((&err).into()),
            },
        },
    };
    Json(response)
}

async fn rpc_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(request): Json<RpcRequest>,
) -> Json<RpcResponse> {
    // Retried requests replay the original response.
    if let Some(replayed) = state.replay(&request.id) {
        debug!("Replaying deduplicated request {}", request.id);
        return Json(replayed);
    }

    let response = match execute_rpc(&state, &headers, &request).await {
        Ok(result) => RpcResponse::ok(request.id.clone(), result),
        Err(err) => RpcResponse::err(request.id.clone(), RpcErrorBody::from(&err)),
    };
    state.remember(&response);
    Json(response)
}

async fn execute_rpc(
    state: &ServerState,
    headers: &HeaderMap,
    request: &RpcRequest,
) -> FabricResult<Value> {
    let (service, method) = request
        .method
        .split_once('/')
        .ok_or_else(|| FabricError::bad_request("method must be service/method"))?;

    let spec = state.runtime.method_spec(service, method);
    let requires_auth = spec.as_ref().map(|s| s.requires_auth).unwrap_or(true);
    let coordinator_only = spec.as_ref().map(|s| s.coordinator_only).unwrap_or(false);

    if requires_auth {
        let claims = state.bearer_claims(headers)?;
        state.auth.authorize(&claims, coordinator_only)?;
    }

    state
        .runtime
        .call_local(service, method, request.params.clone())
        .await
}

#[derive(Debug, Deserialize)]
struct PullQuery {
    #[serde(default)]
    since: Option<String>,
}

async fn gossip_pull_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<PullQuery>,
) -> Response {
    if let Err(err) = state.bearer_claims(&headers) {
        return error_response(StatusCode::UNAUTHORIZED, &err);
    }

    let since: HashMap<crate::types::NodeId, u64> = query
        .since
        .as_deref()
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default();

    let response = GossipPullResponse {
        records: state.registry.deltas_since(&since),
        summary: state.registry.summary(),
    };
    Json(response).into_response()
}

async fn gossip_push_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(request): Json<GossipPushRequest>,
) -> Response {
    if let Err(err) = state.bearer_claims(&headers) {
        return error_response(StatusCode::UNAUTHORIZED, &err);
    }

    let mut merged = 0usize;
    for record in request.records {
        if state.registry.merge(record) {
            merged += 1;
        }
    }
    Json(json!({ "merged": merged })).into_response()
}

#[derive(Debug, Deserialize)]
struct LongPollQuery {
    #[serde(default)]
    last_id: u64,
}

async fn lp_poll_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(client_id): Path<String>,
    Query(query): Query<LongPollQuery>,
) -> Response {
    if let Err(err) = state.bearer_claims(&headers) {
        return error_response(StatusCode::UNAUTHORIZED, &err);
    }

    let messages = state
        .mailbox
        .poll(&client_id, query.last_id, &state.cancel)
        .await;
    Json(LongPollResponse { client_id, messages }).into_response()
}

async fn lp_push_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(client_id): Path<String>,
    Json(payload): Json<Value>,
) -> Response {
    let claims = match state.bearer_claims(&headers) {
        Ok(claims) => claims,
        Err(err) => return error_response(StatusCode::UNAUTHORIZED, &err),
    };

    let id = state.mailbox.push(&claims.sub, &client_id, payload);
    Json(json!({ "client_id": client_id, "id": id })).into_response()
}

async fn health_handler(State(state): State<SharedState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "node_id": state.config.node_id,
        "role": state.config.role,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "known_nodes": state.registry.len(),
        "services": state.runtime.service_listing(),
    }))
}

async fn metrics_handler(State(state): State<SharedState>) -> Json<Value> {
    let mut snapshot = state.runtime.metrics_snapshot();
    if let Value::Object(ref mut map) = snapshot {
        map.insert("auth".to_string(), state.auth.metrics().snapshot());
        map.insert("mailbox".to_string(), state.mailbox.clients());
    }
    Json(snapshot)
}

fn error_response(status: StatusCode, err: &FabricError) -> Response {
    (status, Json(json!({ "error": RpcErrorBody::from(err) }))).into_response()
}
