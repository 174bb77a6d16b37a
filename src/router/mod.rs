//! Frontend routing server.
//!
//! One HTTP listener demultiplexes the MCP plane:
//!
//! - `/mcps/<agent>/mcp`: per-agent reverse MCP proxy (POST/DELETE)
//! - `/mcps/<agent>/task`: task-status passthrough (GET)
//! - `/mcp`: aggregate proxy over the caller's allowed agents (POST/DELETE)
//! - `/auth/agent-token`: client-credential token mint (POST)
//!
//! Every `/mcp`-family request passes the bearer auth gate first; protocol
//! errors travel as JSON-RPC error objects with HTTP 200, while transport
//! and auth failures use plain HTTP statuses.

mod proxy;
mod session;

pub use proxy::{AGGREGATE_SEPARATOR, AgentProxy, Aggregator};
pub use session::{McpSession, SessionStore, SessionTarget};

use crate::auth::{AgentCredential, DEFAULT_TOKEN_TTL_SECS, TokenPrincipal, TokenService};
use crate::config::{AgentRoute, RouterConfig};
use crate::protocol::{
    JsonRpcRequest, JsonRpcResponse, MCP_PROTOCOL_VERSION, McpError, PROTOCOL_HEADER,
    SESSION_HEADER,
};
use crate::types::{AgentName, ClientId};
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

/// Hard cap on request bodies accepted by the router.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

const SERVER_VERSION: &str = "1.0.0";

/// Shared state behind every handler.
pub struct RouterState {
    routes: RwLock<HashMap<AgentName, AgentRoute>>,
    sessions: SessionStore,
    tokens: TokenService,
    http: reqwest::Client,
}

pub type SharedRouter = Arc<RouterState>;

impl RouterState {
    pub fn new(config: RouterConfig) -> Self {
        let secret = config.signing_secret.clone().unwrap_or_else(|| {
            warn!("no signing secret configured; minted tokens will not survive a restart");
            Uuid::new_v4().to_string()
        });
        let ttl = config.token_ttl_secs.unwrap_or(DEFAULT_TOKEN_TTL_SECS);
        let credentials = config
            .credentials
            .iter()
            .map(|c| AgentCredential {
                client_id: ClientId::new(&c.client_id),
                client_secret: c.client_secret.clone(),
                allowed_targets: c.allowed_targets.iter().map(AgentName::new).collect(),
            })
            .collect();

        let routes = config
            .routes
            .iter()
            .map(|r| (r.agent_name.clone(), r.clone()))
            .collect();

        Self {
            routes: RwLock::new(routes),
            sessions: SessionStore::new(),
            tokens: TokenService::new(&secret, ttl, credentials),
            http: reqwest::Client::new(),
        }
    }

    /// Register a route for a newly enabled agent.
    pub async fn enable_agent(&self, route: AgentRoute) {
        info!(agent = %route.agent_name, port = route.host_port, "agent enabled");
        self.routes
            .write()
            .await
            .insert(route.agent_name.clone(), route);
    }

    /// Drop an agent's route and every session pinned to it.
    pub async fn disable_agent(&self, agent: &str) {
        if self.routes.write().await.remove(agent).is_some() {
            info!(agent, "agent disabled");
        }
        self.sessions.remove_for_agent(agent).await;
    }

    pub async fn enabled_agents(&self) -> Vec<AgentName> {
        self.routes.read().await.keys().cloned().collect()
    }

    pub async fn route_for(&self, agent: &str) -> Option<AgentRoute> {
        self.routes.read().await.get(agent).cloned()
    }

    /// Intersection of the caller's allow-list and the enabled agents, in a
    /// stable order.
    async fn routes_for_principal(&self, principal: &TokenPrincipal) -> Vec<AgentRoute> {
        let routes = self.routes.read().await;
        let mut allowed: Vec<AgentRoute> = routes
            .values()
            .filter(|r| principal.allows(r.agent_name.as_str()))
            .cloned()
            .collect();
        allowed.sort_by(|a, b| a.agent_name.as_str().cmp(b.agent_name.as_str()));
        allowed
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }
}

/// Build the axum application for one router state.
pub fn build_router(state: SharedRouter) -> Router {
    Router::new()
        .route(
            "/mcps/{agent}/mcp",
            post(agent_mcp_post)
                .delete(agent_mcp_delete)
                .get(mcp_get_not_allowed),
        )
        .route("/mcps/{agent}/task", get(agent_task_status))
        .route(
            "/mcp",
            post(aggregate_mcp_post)
                .delete(aggregate_mcp_delete)
                .get(mcp_get_not_allowed),
        )
        .route("/auth/agent-token", post(mint_agent_token))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

/// Serve the router on an already-bound listener.
pub async fn serve(state: SharedRouter, listener: tokio::net::TcpListener) -> anyhow::Result<()> {
    info!("routing server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, build_router(state)).await?;
    Ok(())
}

/// Where a classified request is forwarded.
enum RpcBackend {
    Agent(AgentRoute),
    Aggregate(Vec<AgentRoute>),
}

impl RpcBackend {
    async fn dispatch(&self, method: &str, params: Value) -> Result<Value, McpError> {
        match self {
            Self::Agent(route) => {
                if !proxy::FORWARDED_METHODS.contains(&method) {
                    return Err(McpError::method_not_found(method));
                }
                match method {
                    "tools/call" => {
                        if params.get("name").and_then(|n| n.as_str()).is_none() {
                            return Err(McpError::invalid_params("missing tool name"));
                        }
                    }
                    "resources/read" => {
                        if params.get("uri").and_then(|u| u.as_str()).is_none() {
                            return Err(McpError::invalid_params("missing resource uri"));
                        }
                    }
                    _ => {}
                }
                AgentProxy::new(route.clone()).forward(method, params).await
            }
            Self::Aggregate(routes) => Aggregator::new(routes.clone()).dispatch(method, params).await,
        }
    }
}

async fn agent_mcp_post(
    State(state): State<SharedRouter>,
    Path(agent): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let _principal = match gate(&state, &headers, Some(&agent)).await {
        Ok(principal) => principal,
        Err(response) => return response,
    };
    let Some(route) = state.route_for(&agent).await else {
        return error_json(StatusCode::NOT_FOUND, "unknown_agent");
    };

    let target = SessionTarget::Agent(route.agent_name.clone());
    handle_rpc(&state, &headers, body, target, RpcBackend::Agent(route)).await
}

async fn aggregate_mcp_post(
    State(state): State<SharedRouter>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let principal = match gate(&state, &headers, None).await {
        Ok(principal) => principal,
        Err(response) => return response,
    };
    let routes = state.routes_for_principal(&principal).await;
    handle_rpc(
        &state,
        &headers,
        body,
        SessionTarget::Aggregate,
        RpcBackend::Aggregate(routes),
    )
    .await
}

/// Shared JSON-RPC handling for both proxy endpoints.
async fn handle_rpc(
    state: &SharedRouter,
    headers: &HeaderMap,
    body: Bytes,
    target: SessionTarget,
    backend: RpcBackend,
) -> Response {
    let value: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(_) => return error_json(StatusCode::BAD_REQUEST, "invalid_json"),
    };
    if value.is_array() {
        return rpc_response(
            None,
            None,
            JsonRpcResponse::failure(Value::Null, McpError::batch_not_supported()),
        );
    }
    let request: JsonRpcRequest = match serde_json::from_value(value) {
        Ok(request) => request,
        Err(_) => {
            return rpc_response(
                None,
                None,
                JsonRpcResponse::failure(
                    Value::Null,
                    McpError::invalid_request("not a JSON-RPC request"),
                ),
            );
        }
    };

    let session_header = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    match request.method.as_str() {
        "initialize" => {
            let requested = request
                .params
                .as_ref()
                .and_then(|p| p.get("protocolVersion"))
                .and_then(|v| v.as_str())
                .unwrap_or(MCP_PROTOCOL_VERSION)
                .to_string();
            let session = state.sessions.create(target.clone(), requested.clone()).await;
            let server_name = match &target {
                SessionTarget::Agent(agent) => format!("ploinky-router-proxy:{agent}"),
                SessionTarget::Aggregate => "ploinky-router-aggregator".to_string(),
            };
            let result = json!({
                "protocolVersion": requested,
                "capabilities": {
                    "tools": {"listChanged": false},
                    "resources": {"listChanged": false},
                },
                "serverInfo": {"name": server_name, "version": SERVER_VERSION},
            });
            rpc_response(
                Some(session.id.as_str()),
                Some(&requested),
                JsonRpcResponse::success(request.reply_id(), result),
            )
        }
        "notifications/initialized" => {
            let mut response = StatusCode::NO_CONTENT.into_response();
            let out = response.headers_mut();
            if let Some(session_id) = &session_header
                && let Ok(value) = HeaderValue::from_str(session_id)
            {
                out.insert(SESSION_HEADER, value);
            }
            if let Some(value) = headers.get(PROTOCOL_HEADER) {
                out.insert(PROTOCOL_HEADER, value.clone());
            }
            response
        }
        method => {
            let session = match state
                .sessions
                .validate(session_header.as_deref(), &target)
                .await
            {
                Ok(session) => session,
                Err(err) => {
                    return rpc_response(
                        session_header.as_deref(),
                        None,
                        JsonRpcResponse::failure(request.reply_id(), err),
                    );
                }
            };

            let params = request.params.clone().unwrap_or_else(|| json!({}));
            let body = match backend.dispatch(method, params).await {
                Ok(result) => JsonRpcResponse::success(request.reply_id(), result),
                Err(err) => JsonRpcResponse::failure(request.reply_id(), err),
            };
            rpc_response(
                Some(session.id.as_str()),
                Some(&session.protocol_version),
                body,
            )
        }
    }
}

async fn agent_mcp_delete(
    State(state): State<SharedRouter>,
    Path(agent): Path<String>,
    headers: HeaderMap,
) -> Response {
    match gate(&state, &headers, Some(&agent)).await {
        Ok(_) => delete_session(&state, &headers).await,
        Err(response) => response,
    }
}

async fn aggregate_mcp_delete(
    State(state): State<SharedRouter>,
    headers: HeaderMap,
) -> Response {
    match gate(&state, &headers, None).await {
        Ok(_) => delete_session(&state, &headers).await,
        Err(response) => response,
    }
}

/// DELETE is 204 whether or not a session header was presented.
async fn delete_session(state: &SharedRouter, headers: &HeaderMap) -> Response {
    if let Some(session_id) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
        state.sessions.remove(session_id).await;
    }
    StatusCode::NO_CONTENT.into_response()
}

/// SSE server-push is not offered by the router; only POST and DELETE exist.
async fn mcp_get_not_allowed() -> Response {
    let mut response = StatusCode::METHOD_NOT_ALLOWED.into_response();
    response
        .headers_mut()
        .insert(http::header::ALLOW, HeaderValue::from_static("POST, DELETE"));
    response
}

async fn agent_task_status(
    State(state): State<SharedRouter>,
    Path(agent): Path<String>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if let Err(response) = gate(&state, &headers, Some(&agent)).await {
        return response;
    }
    let Some(route) = state.route_for(&agent).await else {
        return error_json(StatusCode::NOT_FOUND, "unknown_agent");
    };
    let Some(task_id) = params.get("taskId") else {
        return error_json(StatusCode::BAD_REQUEST, "missing taskId");
    };

    let upstream = state
        .http
        .get(route.task_url())
        .query(&[("taskId", task_id)])
        .send()
        .await;

    match upstream {
        Ok(response) => {
            let status =
                StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
            match response.bytes().await {
                Ok(body) => (
                    status,
                    [(http::header::CONTENT_TYPE, "application/json")],
                    body,
                )
                    .into_response(),
                Err(err) => error_json(
                    StatusCode::BAD_GATEWAY,
                    &format!("upstream error: {err}"),
                ),
            }
        }
        Err(err) => error_json(StatusCode::BAD_GATEWAY, &format!("upstream error: {err}")),
    }
}

#[derive(Debug, Deserialize)]
struct MintBody {
    client_id: String,
    client_secret: String,
}

async fn mint_agent_token(State(state): State<SharedRouter>, body: Bytes) -> Response {
    let Ok(body) = serde_json::from_slice::<MintBody>(&body) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"ok": false, "error": "invalid_request"})),
        )
            .into_response();
    };

    let enabled = state.enabled_agents().await;
    match state.tokens.mint(&body.client_id, &body.client_secret, &enabled) {
        Ok(minted) => Json(json!({
            "ok": true,
            "access_token": minted.access_token,
            "expires_in": minted.expires_in,
            "token_type": "Bearer",
        }))
        .into_response(),
        Err(err) => {
            warn!(client_id = %body.client_id, %err, "token mint rejected");
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({"ok": false, "error": "invalid_client"})),
            )
                .into_response()
        }
    }
}

/// Bearer auth gate. `agent` additionally enforces the allow-list for the
/// per-agent paths; the aggregate path intersects later instead.
async fn gate(
    state: &SharedRouter,
    headers: &HeaderMap,
    agent: Option<&str>,
) -> Result<TokenPrincipal, Response> {
    let authorization = headers
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let principal = state
        .tokens
        .verify_header(authorization)
        .map_err(|_| error_json(StatusCode::UNAUTHORIZED, "invalid_token"))?;

    if let Some(agent) = agent
        && !principal.allows(agent)
    {
        return Err(error_json(StatusCode::FORBIDDEN, "forbidden_target"));
    }

    Ok(principal)
}

fn error_json(status: StatusCode, error: &str) -> Response {
    (status, Json(json!({"error": error}))).into_response()
}

/// JSON-RPC reply: HTTP 200 with the session headers attached.
fn rpc_response(
    session_id: Option<&str>,
    protocol_version: Option<&str>,
    body: JsonRpcResponse,
) -> Response {
    let mut response = (StatusCode::OK, Json(body)).into_response();
    let headers = response.headers_mut();
    if let Some(session_id) = session_id
        && let Ok(value) = HeaderValue::from_str(session_id)
    {
        headers.insert(SESSION_HEADER, value);
    }
    if let Some(protocol_version) = protocol_version
        && let Ok(value) = HeaderValue::from_str(protocol_version)
    {
        headers.insert(PROTOCOL_HEADER, value);
    }
    response
}
