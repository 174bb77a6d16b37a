//! JSON-RPC 2.0 message model shared by the router, the proxy and the client.
//!
//! MCP rides on JSON-RPC 2.0 over Streamable-HTTP: a POST carries one
//! request object (batches are rejected), the reply arrives either inline as
//! JSON or as `data:` frames on a `text/event-stream` body. This module owns
//! the wire structs, the reserved error codes, and the `McpError` type that
//! doubles as the crate-wide protocol error.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// JSON-RPC version string stamped on every message.
pub const JSONRPC_VERSION: &str = "2.0";

/// Default MCP protocol revision offered during `initialize`.
pub const MCP_PROTOCOL_VERSION: &str = "2025-06-18";

/// Header carrying the opaque session id minted on `initialize`.
pub const SESSION_HEADER: &str = "mcp-session-id";

/// Header carrying the negotiated protocol revision.
pub const PROTOCOL_HEADER: &str = "mcp-protocol-version";

/// Reserved JSON-RPC error codes.
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    /// Server-reserved code used for upstream and session failures.
    pub const SERVER_ERROR: i64 = -32000;
}

/// A JSON-RPC request or notification (no `id`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: impl Into<Value>, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id.into()),
            method: method.into(),
            params: if params.is_null() { None } else { Some(params) },
        }
    }

    /// Build a notification (a request without an `id`, expecting no reply).
    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: method.into(),
            params: if params.is_null() { None } else { Some(params) },
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// The request id for reply correlation; notifications answer with null.
    pub fn reply_id(&self) -> Value {
        self.id.clone().unwrap_or(Value::Null)
    }
}

/// A JSON-RPC response carrying either `result` or `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<McpError>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: McpError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// JSON-RPC error object, used verbatim on the wire and as the uniform
/// protocol-layer error type throughout the crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl McpError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_REQUEST, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(codes::METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_PARAMS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL_ERROR, message)
    }

    /// Server-reserved error for session and upstream failures.
    pub fn server_error(message: impl Into<String>) -> Self {
        Self::new(codes::SERVER_ERROR, message)
    }

    /// Transport-level failure talking to an upstream agent.
    pub fn upstream(message: impl fmt::Display) -> Self {
        Self::new(codes::SERVER_ERROR, format!("upstream error: {message}"))
    }

    /// Rejection used for all pending work when a client is closed.
    pub fn closed() -> Self {
        Self::new(codes::SERVER_ERROR, "MCP client closed")
    }

    /// Rejection for requests lacking a usable `mcp-session-id`.
    pub fn invalid_session() -> Self {
        Self::new(codes::SERVER_ERROR, "Missing or invalid MCP session")
    }

    /// Rejection for JSON arrays where a single request object is expected.
    pub fn batch_not_supported() -> Self {
        Self::new(codes::INVALID_REQUEST, "Batch requests are not supported")
    }
}

impl fmt::Display for McpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

impl std::error::Error for McpError {}

/// Tool descriptor as exchanged in `tools/list` results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(
        default,
        rename = "inputSchema",
        skip_serializing_if = "Option::is_none"
    )]
    pub input_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Resource descriptor as exchanged in `resources/list` results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Attach (or merge) an `agent` marker into a descriptor's `metadata`.
pub fn annotate_agent(metadata: Option<Value>, agent: &str) -> Value {
    let mut meta = match metadata {
        Some(Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    };
    meta.insert("agent".to_string(), Value::String(agent.to_string()));
    Value::Object(meta)
}
