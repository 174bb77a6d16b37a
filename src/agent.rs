//! Minimal agent runtime: the MCP endpoint each container exposes.
//!
//! Serves the tools and resources declared in an [`AgentManifest`] over
//! `POST /mcp`, and task status over `GET /task`. Synchronous tools run
//! their command inline and answer on the same exchange; task tools enqueue
//! on the durable queue and answer with a `taskId` for the caller to poll.
//!
//! The runtime is single-tenant by design: it sits behind the router, which
//! owns authentication and session pinning. Session ids are still minted on
//! `initialize` so well-behaved clients can echo them.

use crate::config::{AgentManifest, ToolEntry, ToolMode, tasks_path};
use crate::executor::{CommandExecutor, TaskExecutor};
use crate::protocol::{
    JsonRpcRequest, JsonRpcResponse, MCP_PROTOCOL_VERSION, McpError, ResourceDescriptor,
    SESSION_HEADER, ToolDescriptor,
};
use crate::queue::{NewTask, TaskQueue};
use anyhow::Result;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

const RUNTIME_VERSION: &str = "1.0.0";
const DEFAULT_MAX_CONCURRENT: usize = 2;

pub struct AgentRuntime {
    manifest: AgentManifest,
    queue: TaskQueue,
    executor: Arc<dyn TaskExecutor>,
}

impl AgentRuntime {
    /// Build a runtime persisting its queue under
    /// `<workspace>/.ploinky/tasks/<agent>.json`.
    pub fn new(manifest: AgentManifest, workspace: &Path) -> Self {
        let executor: Arc<dyn TaskExecutor> = Arc::new(CommandExecutor::new());
        let queue = TaskQueue::new(
            tasks_path(workspace, &manifest.agent),
            executor.clone(),
            manifest.max_concurrent.unwrap_or(DEFAULT_MAX_CONCURRENT),
        );
        Self {
            manifest,
            queue,
            executor,
        }
    }

    /// Restore the queue snapshot and start its scheduler.
    pub async fn initialize(&self) -> Result<()> {
        self.queue.initialize().await
    }

    pub fn agent_name(&self) -> &str {
        &self.manifest.agent
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    fn find_tool(&self, name: &str) -> Option<&ToolEntry> {
        self.manifest.tools.iter().find(|t| t.name == name)
    }

    fn tool_descriptors(&self) -> Vec<ToolDescriptor> {
        self.manifest
            .tools
            .iter()
            .map(|t| ToolDescriptor {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.input_schema.clone(),
                metadata: match t.mode {
                    ToolMode::Task => Some(json!({"taskCapable": true})),
                    ToolMode::Sync => None,
                },
            })
            .collect()
    }

    fn resource_descriptors(&self) -> Vec<ResourceDescriptor> {
        self.manifest
            .resources
            .iter()
            .map(|r| ResourceDescriptor {
                uri: r.uri.clone(),
                name: r.name.clone(),
                description: None,
                metadata: None,
            })
            .collect()
    }

    async fn call_tool(&self, params: &Value) -> Result<Value, McpError> {
        let name = params
            .get("name")
            .and_then(|n| n.as_str())
            .ok_or_else(|| McpError::invalid_params("missing tool name"))?;
        let tool = self
            .find_tool(name)
            .ok_or_else(|| McpError::invalid_params(format!("unknown tool `{name}`")))?;
        let arguments = params
            .get("arguments")
            .cloned()
            .unwrap_or_else(|| json!({}));

        match tool.mode {
            ToolMode::Sync => self.run_sync(tool, &arguments).await,
            ToolMode::Task => {
                let receipt = self
                    .queue
                    .enqueue_task(NewTask::new(
                        tool.name.as_str(),
                        tool.command.clone(),
                        arguments,
                    ))
                    .await
                    .map_err(|e| McpError::server_error(e.to_string()))?;
                Ok(json!({
                    "content": [],
                    "metadata": {"taskId": receipt.id},
                }))
            }
        }
    }

    async fn run_sync(&self, tool: &ToolEntry, arguments: &Value) -> Result<Value, McpError> {
        let no_spawn = |_pid: u32| {};
        let output = self
            .executor
            .execute(&tool.command, arguments, &no_spawn)
            .await
            .map_err(|e| McpError::server_error(e.to_string()))?;

        if output.code != 0 {
            let message = if output.stderr.is_empty() {
                format!("exit {}", output.code)
            } else {
                output.stderr.clone()
            };
            return Err(McpError::server_error(message));
        }

        let mut content = vec![json!({
            "type": "text",
            "text": if output.stdout.is_empty() { "(no output)".to_string() } else { output.stdout },
        })];
        if !output.stderr.is_empty() {
            content.push(json!({
                "type": "text",
                "text": format!("stderr:\n{}", output.stderr),
            }));
        }
        Ok(json!({"content": content}))
    }

    fn read_resource(&self, params: &Value) -> Result<Value, McpError> {
        let uri = params
            .get("uri")
            .and_then(|u| u.as_str())
            .ok_or_else(|| McpError::invalid_params("missing resource uri"))?;
        let resource = self
            .manifest
            .resources
            .iter()
            .find(|r| r.uri == uri)
            .ok_or_else(|| McpError::new(-32002, format!("Resource not found: {uri}")))?;
        Ok(json!({
            "contents": [{"uri": resource.uri, "text": resource.text}],
        }))
    }
}

/// Build the axum application for one agent runtime.
pub fn build_agent_router(runtime: Arc<AgentRuntime>) -> Router {
    Router::new()
        .route(
            "/mcp",
            post(mcp_post).delete(mcp_delete).get(mcp_get_not_allowed),
        )
        .route("/task", get(task_status))
        .with_state(runtime)
}

/// Serve the runtime on an already-bound listener.
pub async fn serve(
    runtime: Arc<AgentRuntime>,
    listener: tokio::net::TcpListener,
) -> Result<()> {
    info!(
        agent = runtime.agent_name(),
        "agent runtime listening on http://{}",
        listener.local_addr()?
    );
    axum::serve(listener, build_agent_router(runtime)).await?;
    Ok(())
}

async fn mcp_post(State(runtime): State<Arc<AgentRuntime>>, body: Bytes) -> Response {
    let value: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "invalid_json"})),
            )
                .into_response();
        }
    };
    if value.is_array() {
        return reply(JsonRpcResponse::failure(
            Value::Null,
            McpError::batch_not_supported(),
        ));
    }
    let request: JsonRpcRequest = match serde_json::from_value(value) {
        Ok(request) => request,
        Err(_) => {
            return reply(JsonRpcResponse::failure(
                Value::Null,
                McpError::invalid_request("not a JSON-RPC request"),
            ));
        }
    };

    let params = request.params.clone().unwrap_or_else(|| json!({}));
    match request.method.as_str() {
        "initialize" => {
            let requested = params
                .get("protocolVersion")
                .and_then(|v| v.as_str())
                .unwrap_or(MCP_PROTOCOL_VERSION);
            let result = json!({
                "protocolVersion": requested,
                "capabilities": {
                    "tools": {"listChanged": false},
                    "resources": {"listChanged": false},
                },
                "serverInfo": {
                    "name": format!("ploinky-agent:{}", runtime.agent_name()),
                    "version": RUNTIME_VERSION,
                },
            });
            let mut response = reply(JsonRpcResponse::success(request.reply_id(), result));
            if let Ok(value) = HeaderValue::from_str(&Uuid::new_v4().to_string()) {
                response.headers_mut().insert(SESSION_HEADER, value);
            }
            response
        }
        "notifications/initialized" => StatusCode::NO_CONTENT.into_response(),
        "tools/list" => reply(JsonRpcResponse::success(
            request.reply_id(),
            json!({"tools": runtime.tool_descriptors()}),
        )),
        "tools/call" => match runtime.call_tool(&params).await {
            Ok(result) => reply(JsonRpcResponse::success(request.reply_id(), result)),
            Err(err) => reply(JsonRpcResponse::failure(request.reply_id(), err)),
        },
        "resources/list" => reply(JsonRpcResponse::success(
            request.reply_id(),
            json!({"resources": runtime.resource_descriptors()}),
        )),
        "resources/read" => match runtime.read_resource(&params) {
            Ok(result) => reply(JsonRpcResponse::success(request.reply_id(), result)),
            Err(err) => reply(JsonRpcResponse::failure(request.reply_id(), err)),
        },
        "ping" => reply(JsonRpcResponse::success(request.reply_id(), json!({}))),
        other => reply(JsonRpcResponse::failure(
            request.reply_id(),
            McpError::method_not_found(other),
        )),
    }
}

async fn mcp_delete() -> Response {
    StatusCode::NO_CONTENT.into_response()
}

/// The runtime offers no SSE back-channel; clients fall back to inline POST
/// replies when they see this.
async fn mcp_get_not_allowed() -> Response {
    let mut response = StatusCode::METHOD_NOT_ALLOWED.into_response();
    response
        .headers_mut()
        .insert(http::header::ALLOW, HeaderValue::from_static("POST, DELETE"));
    response
}

async fn task_status(
    State(runtime): State<Arc<AgentRuntime>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(task_id) = params.get("taskId") else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "missing taskId"})),
        )
            .into_response();
    };

    match runtime.queue.get_task(task_id).await {
        Some(task) => Json(json!({"task": task.status_view()})).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "task not found"})),
        )
            .into_response(),
    }
}

fn reply(body: JsonRpcResponse) -> Response {
    (StatusCode::OK, Json(body)).into_response()
}
