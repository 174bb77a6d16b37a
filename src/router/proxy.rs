//! Per-agent proxy and cross-agent aggregator.
//!
//! The proxy opens a short-lived MCP client per forwarded call: connect,
//! forward, close. Upstream JSON-RPC errors are copied verbatim; transport
//! failures become `-32000 upstream error: <msg>`.

use crate::client::McpClient;
use crate::config::AgentRoute;
use crate::protocol::{McpError, annotate_agent};
use serde_json::{Value, json};
use tracing::{debug, warn};

/// Methods the proxy forwards to upstream agents.
pub const FORWARDED_METHODS: &[&str] = &[
    "tools/list",
    "tools/call",
    "resources/list",
    "resources/read",
    "ping",
];

/// Separator between agent and tool in aggregate tool names.
pub const AGGREGATE_SEPARATOR: &str = "::";

/// Forwards calls to one upstream agent.
pub struct AgentProxy {
    route: AgentRoute,
}

impl AgentProxy {
    pub fn new(route: AgentRoute) -> Self {
        Self { route }
    }

    /// Forward one method with a fresh short-lived client.
    pub async fn forward(&self, method: &str, params: Value) -> Result<Value, McpError> {
        let client = self.connect().await?;
        let outcome = client.request(method, params).await;
        client.close().await;
        outcome
    }

    async fn connect(&self) -> Result<McpClient, McpError> {
        let client = McpClient::new(&self.route.mcp_url()).map_err(McpError::upstream)?;
        client.connect().await?;
        Ok(client)
    }
}

/// Fans calls out across the caller's allowed targets.
pub struct Aggregator {
    routes: Vec<AgentRoute>,
}

impl Aggregator {
    /// `routes` must already be the intersection of the caller's allow-list
    /// and the router's enabled agents.
    pub fn new(routes: Vec<AgentRoute>) -> Self {
        Self { routes }
    }

    pub async fn dispatch(&self, method: &str, params: Value) -> Result<Value, McpError> {
        match method {
            "tools/list" => self.list_tools().await,
            "tools/call" => self.call_tool(params).await,
            "resources/list" => self.list_resources().await,
            "resources/read" => self.read_resource(params).await,
            "ping" => self.ping().await,
            other => Err(McpError::method_not_found(other)),
        }
    }

    /// Union of every reachable agent's tools, each renamed to
    /// `<agent>::<tool>` and annotated with its origin. Unreachable agents
    /// are skipped so one dead container does not hide the rest.
    async fn list_tools(&self) -> Result<Value, McpError> {
        let mut tools = Vec::new();
        for route in &self.routes {
            let agent = route.agent_name.as_str();
            let proxy = AgentProxy::new(route.clone());
            match proxy.forward("tools/list", json!({})).await {
                Ok(result) => {
                    for tool in result
                        .get("tools")
                        .and_then(|t| t.as_array())
                        .cloned()
                        .unwrap_or_default()
                    {
                        let mut tool = tool;
                        if let Some(obj) = tool.as_object_mut() {
                            let bare = obj
                                .get("name")
                                .and_then(|n| n.as_str())
                                .unwrap_or_default()
                                .to_string();
                            obj.insert(
                                "name".to_string(),
                                json!(format!("{agent}{AGGREGATE_SEPARATOR}{bare}")),
                            );
                            let metadata = annotate_agent(obj.get("metadata").cloned(), agent);
                            obj.insert("metadata".to_string(), metadata);
                        }
                        tools.push(tool);
                    }
                }
                Err(err) => {
                    warn!(agent, %err, "skipping unreachable agent in aggregate tools/list");
                }
            }
        }
        Ok(json!({"tools": tools}))
    }

    /// Dispatch a prefixed tool call to its owning agent.
    async fn call_tool(&self, params: Value) -> Result<Value, McpError> {
        let name = params
            .get("name")
            .and_then(|n| n.as_str())
            .ok_or_else(|| McpError::invalid_params("missing tool name"))?;

        let Some((agent, bare)) = name.split_once(AGGREGATE_SEPARATOR) else {
            return Err(McpError::invalid_params(format!(
                "ambiguous tool name `{name}` (expected <agent>{AGGREGATE_SEPARATOR}<tool>)"
            )));
        };

        let route = self
            .routes
            .iter()
            .find(|r| r.agent_name.as_str() == agent)
            .ok_or_else(|| McpError::invalid_params(format!("unknown agent `{agent}`")))?;

        let mut params = params.clone();
        if let Some(obj) = params.as_object_mut() {
            obj.insert("name".to_string(), json!(bare));
        }

        debug!(agent, tool = bare, "aggregate tool call");
        AgentProxy::new(route.clone())
            .forward("tools/call", params)
            .await
    }

    /// Union of every reachable agent's resources, annotated with origin.
    async fn list_resources(&self) -> Result<Value, McpError> {
        let mut resources = Vec::new();
        for route in &self.routes {
            let agent = route.agent_name.as_str();
            let proxy = AgentProxy::new(route.clone());
            match proxy.forward("resources/list", json!({})).await {
                Ok(result) => {
                    for resource in result
                        .get("resources")
                        .and_then(|r| r.as_array())
                        .cloned()
                        .unwrap_or_default()
                    {
                        let mut resource = resource;
                        if let Some(obj) = resource.as_object_mut() {
                            let metadata = annotate_agent(obj.get("metadata").cloned(), agent);
                            obj.insert("metadata".to_string(), metadata);
                        }
                        resources.push(resource);
                    }
                }
                Err(err) => {
                    warn!(agent, %err, "skipping unreachable agent in aggregate resources/list");
                }
            }
        }
        Ok(json!({"resources": resources}))
    }

    /// Try each allowed agent in turn and return the first successful read.
    async fn read_resource(&self, params: Value) -> Result<Value, McpError> {
        if params.get("uri").and_then(|u| u.as_str()).is_none() {
            return Err(McpError::invalid_params("missing resource uri"));
        }

        let mut last_err = McpError::upstream("no agents available");
        for route in &self.routes {
            let proxy = AgentProxy::new(route.clone());
            match proxy.forward("resources/read", params.clone()).await {
                Ok(result) => return Ok(result),
                Err(err) => last_err = err,
            }
        }
        Err(last_err)
    }

    /// Every allowed agent must answer for the aggregate ping to succeed.
    async fn ping(&self) -> Result<Value, McpError> {
        for route in &self.routes {
            AgentProxy::new(route.clone())
                .forward("ping", json!({}))
                .await?;
        }
        Ok(json!({}))
    }
}
