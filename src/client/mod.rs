//! JSON-RPC 2.0 client over MCP Streamable-HTTP.
//!
//! One client talks to one agent endpoint. Requests go out as POSTs; replies
//! come back inline (JSON or `text/event-stream`) or asynchronously over an
//! optional SSE back-channel opened with a long-poll GET. Replies are
//! correlated purely by request id through a pending map, so arrival order
//! never matters. `tools/call` replies carrying `metadata.taskId`
//! transparently switch to polling the task side-channel until the task
//! settles.

mod sse;
mod task;

pub use sse::SseDecoder;
pub use task::{DEFAULT_POLL_INTERVAL_MS, StatusHook, TaskSnapshot, poll_interval_from_env};

use crate::protocol::{
    JsonRpcRequest, MCP_PROTOCOL_VERSION, McpError, PROTOCOL_HEADER, ResourceDescriptor,
    SESSION_HEADER, ToolDescriptor,
};
use anyhow::{Context, Result};
use futures_util::StreamExt;
use http::header::{ACCEPT, CONTENT_TYPE};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

/// Client identity reported during the `initialize` handshake.
const CLIENT_NAME: &str = "ploinky-router";
const CLIENT_VERSION: &str = "1.0.0";

type PendingSender = oneshot::Sender<Result<Value, McpError>>;

/// State shared with the background SSE reader.
struct ClientShared {
    pending: Mutex<HashMap<String, PendingSender>>,
    cancel: CancellationToken,
}

/// Values negotiated by the `initialize` handshake.
#[derive(Debug, Clone)]
pub struct Negotiated {
    pub protocol_version: String,
    pub capabilities: Value,
    pub server_info: Value,
    pub instructions: Option<String>,
}

pub struct McpClient {
    http: reqwest::Client,
    endpoint: Url,
    task_endpoint: Url,
    bearer: Option<String>,
    shared: Arc<ClientShared>,
    next_id: AtomicU64,
    session: RwLock<Option<String>>,
    negotiated: RwLock<Option<Negotiated>>,
    streams_supported: AtomicBool,
    initialized: AtomicBool,
    poll_interval: Duration,
    status_hook: std::sync::RwLock<Option<StatusHook>>,
}

impl McpClient {
    /// Create a client for one MCP endpoint, e.g.
    /// `http://127.0.0.1:7001/mcp` or `http://127.0.0.1:8080/mcps/demo/mcp`.
    /// The task side-channel is derived by replacing the trailing `/mcp`
    /// path segment with `/task`.
    pub fn new(endpoint: &str) -> Result<Self> {
        let endpoint =
            Url::parse(endpoint).with_context(|| format!("invalid MCP endpoint `{endpoint}`"))?;
        let task_endpoint = derive_task_url(&endpoint)?;

        Ok(Self {
            http: reqwest::Client::new(),
            endpoint,
            task_endpoint,
            bearer: None,
            shared: Arc::new(ClientShared {
                pending: Mutex::new(HashMap::new()),
                cancel: CancellationToken::new(),
            }),
            next_id: AtomicU64::new(1),
            session: RwLock::new(None),
            negotiated: RwLock::new(None),
            streams_supported: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            poll_interval: poll_interval_from_env(),
            status_hook: std::sync::RwLock::new(None),
        })
    }

    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Install a callback invoked once per distinct status of every
    /// long-running tool call.
    pub fn set_status_hook(&self, hook: StatusHook) {
        if let Ok(mut guard) = self.status_hook.write() {
            *guard = Some(hook);
        }
    }

    /// Open the back-channel and run the `initialize` handshake. Idempotent:
    /// repeated calls after the first success are no-ops.
    pub async fn connect(&self) -> Result<(), McpError> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.shared.cancel.is_cancelled() {
            return Err(McpError::closed());
        }

        self.open_backchannel().await;

        let params = json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {"name": CLIENT_NAME, "version": CLIENT_VERSION},
        });
        let result = self.request("initialize", params).await?;

        // Record whatever revision the server settled on and echo it on
        // every later exchange.
        let negotiated = Negotiated {
            protocol_version: result
                .get("protocolVersion")
                .and_then(|v| v.as_str())
                .unwrap_or(MCP_PROTOCOL_VERSION)
                .to_string(),
            capabilities: result.get("capabilities").cloned().unwrap_or_else(|| json!({})),
            server_info: result.get("serverInfo").cloned().unwrap_or_else(|| json!({})),
            instructions: result
                .get("instructions")
                .and_then(|v| v.as_str())
                .map(String::from),
        };
        *self.negotiated.write().await = Some(negotiated);
        self.initialized.store(true, Ordering::SeqCst);

        if let Err(err) = self.notify("notifications/initialized", json!({})).await {
            warn!(%err, "failed to deliver initialized notification");
        }

        Ok(())
    }

    /// List the tools the agent advertises.
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, McpError> {
        let result = self.request("tools/list", json!({})).await?;
        serde_json::from_value(result.get("tools").cloned().unwrap_or_else(|| json!([])))
            .map_err(|e| McpError::upstream(format!("malformed tools/list reply: {e}")))
    }

    /// Invoke a tool. If the reply carries `metadata.taskId`, the returned
    /// future stays open and resolves with the task's final output.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, McpError> {
        let result = self
            .request("tools/call", json!({"name": name, "arguments": arguments}))
            .await?;

        let task_id = result
            .get("metadata")
            .and_then(|m| m.get("taskId"))
            .and_then(|v| v.as_str())
            .map(String::from);

        match task_id {
            Some(task_id) => {
                let hook = self.status_hook.read().ok().and_then(|g| g.clone());
                task::poll_task(
                    &self.http,
                    &self.task_endpoint,
                    self.bearer.as_deref(),
                    &task_id,
                    self.poll_interval,
                    &self.shared.cancel,
                    hook,
                )
                .await
            }
            None => Ok(result),
        }
    }

    pub async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>, McpError> {
        let result = self.request("resources/list", json!({})).await?;
        serde_json::from_value(result.get("resources").cloned().unwrap_or_else(|| json!([])))
            .map_err(|e| McpError::upstream(format!("malformed resources/list reply: {e}")))
    }

    /// Read one resource; extra `meta` fields are merged into the params.
    pub async fn read_resource(&self, uri: &str, meta: Option<Value>) -> Result<Value, McpError> {
        let mut params = serde_json::Map::new();
        params.insert("uri".to_string(), json!(uri));
        if let Some(Value::Object(extra)) = meta {
            for (k, v) in extra {
                params.entry(k).or_insert(v);
            }
        }
        self.request("resources/read", Value::Object(params)).await
    }

    pub async fn ping(&self, meta: Option<Value>) -> Result<Value, McpError> {
        self.request("ping", meta.unwrap_or_else(|| json!({}))).await
    }

    /// Forward an arbitrary method verbatim. Upstream error objects come
    /// back with their original code and message.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, McpError> {
        if self.shared.cancel.is_cancelled() {
            return Err(McpError::closed());
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        let request = JsonRpcRequest::new(json!(id.clone()), method, params);

        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().await.insert(id.clone(), tx);

        // The POST itself races the cancel token so close() aborts in-flight
        // sends, not just waiters.
        let sent = tokio::select! {
            _ = self.shared.cancel.cancelled() => Err(McpError::closed()),
            outcome = self.post_and_dispatch(&request) => outcome,
        };
        if let Err(err) = sent {
            self.shared.pending.lock().await.remove(&id);
            return Err(err);
        }

        tokio::select! {
            _ = self.shared.cancel.cancelled() => Err(McpError::closed()),
            reply = rx => match reply {
                Ok(outcome) => outcome,
                Err(_) => Err(McpError::closed()),
            }
        }
    }

    /// Send a notification; no reply is expected.
    pub async fn notify(&self, method: &str, params: Value) -> Result<(), McpError> {
        let note = JsonRpcRequest::notification(method, params);
        let response = self.post(&note).await?;
        self.absorb_session(response.headers()).await;
        Ok(())
    }

    /// Abort the back-channel and pollers, reject all pending requests, and
    /// best-effort delete the server-side session.
    pub async fn close(&self) {
        if self.shared.cancel.is_cancelled() {
            return;
        }
        self.shared.cancel.cancel();

        let mut pending = self.shared.pending.lock().await;
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(McpError::closed()));
        }
        drop(pending);

        let session = self.session.read().await.clone();
        if let Some(session_id) = session {
            let mut request = self
                .http
                .delete(self.endpoint.clone())
                .header(SESSION_HEADER, session_id);
            if let Some(token) = &self.bearer {
                request = request.bearer_auth(token);
            }
            if let Err(err) = request.send().await {
                debug!(%err, "session delete failed");
            }
        }
    }

    pub async fn capabilities(&self) -> Option<Value> {
        self.negotiated.read().await.as_ref().map(|n| n.capabilities.clone())
    }

    pub async fn server_info(&self) -> Option<Value> {
        self.negotiated.read().await.as_ref().map(|n| n.server_info.clone())
    }

    pub async fn instructions(&self) -> Option<String> {
        self.negotiated
            .read()
            .await
            .as_ref()
            .and_then(|n| n.instructions.clone())
    }

    /// The protocol revision the server settled on during `initialize`.
    pub async fn protocol_version(&self) -> Option<String> {
        self.negotiated
            .read()
            .await
            .as_ref()
            .map(|n| n.protocol_version.clone())
    }

    pub async fn session_id(&self) -> Option<String> {
        self.session.read().await.clone()
    }

    pub fn streams_supported(&self) -> bool {
        self.streams_supported.load(Ordering::SeqCst)
    }

    /// Open the long-poll GET back-channel. A 405 marks streams unsupported
    /// and the client relies on inline POST replies only.
    async fn open_backchannel(&self) {
        let mut request = self
            .http
            .get(self.endpoint.clone())
            .header(ACCEPT, "text/event-stream");
        if let Some(token) = &self.bearer {
            request = request.bearer_auth(token);
        }

        match request.send().await {
            Ok(response) if response.status() == reqwest::StatusCode::METHOD_NOT_ALLOWED => {
                debug!("server does not support SSE back-channel, using POST replies only");
                self.streams_supported.store(false, Ordering::SeqCst);
            }
            Ok(response) if response.status().is_success() => {
                self.streams_supported.store(true, Ordering::SeqCst);
                let shared = self.shared.clone();
                tokio::spawn(async move {
                    read_backchannel(response, shared).await;
                });
            }
            Ok(response) => {
                warn!(status = %response.status(), "unexpected back-channel response");
                self.streams_supported.store(false, Ordering::SeqCst);
            }
            Err(err) => {
                debug!(%err, "failed to open back-channel");
                self.streams_supported.store(false, Ordering::SeqCst);
            }
        }
    }

    /// POST one message with the MCP headers attached.
    async fn post(&self, message: &impl Serialize) -> Result<reqwest::Response, McpError> {
        let mut request = self
            .http
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json, text/event-stream")
            .json(message);

        if let Some(token) = &self.bearer {
            request = request.bearer_auth(token);
        }
        if let Some(session_id) = self.session.read().await.clone() {
            request = request.header(SESSION_HEADER, session_id);
        }
        let protocol_version = self
            .negotiated
            .read()
            .await
            .as_ref()
            .map(|n| n.protocol_version.clone());
        if let Some(protocol_version) = protocol_version {
            request = request.header(PROTOCOL_HEADER, protocol_version);
        }

        request.send().await.map_err(McpError::upstream)
    }

    /// POST and feed whatever comes back (inline JSON, inline SSE, or
    /// nothing) into the pending map.
    async fn post_and_dispatch(&self, request: &JsonRpcRequest) -> Result<(), McpError> {
        let response = self.post(request).await?;
        self.absorb_session(response.headers()).await;

        let status = response.status();
        if status == reqwest::StatusCode::NO_CONTENT || status == reqwest::StatusCode::ACCEPTED {
            return Ok(());
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(McpError::upstream(format!("HTTP {status}: {text}")));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.starts_with("text/event-stream") {
            let mut decoder = SseDecoder::new();
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let bytes = chunk.map_err(McpError::upstream)?;
                for payload in decoder.push(&bytes) {
                    match serde_json::from_str::<Value>(&payload) {
                        Ok(message) => dispatch_incoming(message, &self.shared).await,
                        Err(err) => warn!(%err, "skipping malformed SSE frame"),
                    }
                }
            }
        } else {
            let body = response.bytes().await.map_err(McpError::upstream)?;
            if body.is_empty() {
                return Ok(());
            }
            match serde_json::from_slice::<Value>(&body) {
                Ok(message) => dispatch_incoming(message, &self.shared).await,
                Err(err) => {
                    return Err(McpError::upstream(format!("invalid JSON reply: {err}")));
                }
            }
        }

        Ok(())
    }

    async fn absorb_session(&self, headers: &http::HeaderMap) {
        if let Some(session_id) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
            let mut guard = self.session.write().await;
            if guard.as_deref() != Some(session_id) {
                *guard = Some(session_id.to_string());
            }
        }
    }
}

/// Read the SSE back-channel until it ends or the client closes.
async fn read_backchannel(response: reqwest::Response, shared: Arc<ClientShared>) {
    let mut decoder = SseDecoder::new();
    let mut stream = response.bytes_stream();

    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            chunk = stream.next() => match chunk {
                Some(Ok(bytes)) => {
                    for payload in decoder.push(&bytes) {
                        match serde_json::from_str::<Value>(&payload) {
                            Ok(message) => dispatch_incoming(message, &shared).await,
                            Err(err) => warn!(%err, "skipping malformed SSE frame"),
                        }
                    }
                }
                Some(Err(err)) => {
                    debug!(%err, "SSE back-channel error");
                    break;
                }
                None => break,
            }
        }
    }
}

/// Route one decoded message (or a micro-batch of them) to the pending map.
async fn dispatch_incoming(message: Value, shared: &ClientShared) {
    match message {
        Value::Array(items) => {
            for item in items {
                dispatch_one(item, shared).await;
            }
        }
        other => dispatch_one(other, shared).await,
    }
}

async fn dispatch_one(message: Value, shared: &ClientShared) {
    let Some(id) = message.get("id").filter(|v| !v.is_null()) else {
        if let Some(method) = message.get("method").and_then(|m| m.as_str()) {
            debug!(method, "server notification");
        }
        return;
    };

    let key = stringify_id(id);
    let sender = shared.pending.lock().await.remove(&key);
    let Some(sender) = sender else {
        debug!(id = %key, "no pending request for reply");
        return;
    };

    let outcome = if let Some(error) = message.get("error") {
        let error: McpError = serde_json::from_value(error.clone())
            .unwrap_or_else(|_| McpError::server_error("malformed error object"));
        Err(error)
    } else {
        Ok(message.get("result").cloned().unwrap_or(Value::Null))
    };
    let _ = sender.send(outcome);
}

/// Correlation keys are stringified ids: `"7"` and `7` both map to `"7"`.
fn stringify_id(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn derive_task_url(endpoint: &Url) -> Result<Url> {
    let path = endpoint.path();
    let task_path = match path.strip_suffix("/mcp") {
        Some(prefix) => format!("{prefix}/task"),
        None => format!("{}/task", path.trim_end_matches('/')),
    };
    let mut url = endpoint.clone();
    url.set_path(&task_path);
    Ok(url)
}
