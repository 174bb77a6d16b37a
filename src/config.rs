//! Workspace and routing configuration.
//!
//! The router reads a JSON routing file (by default
//! `<workspace>/.ploinky/routing.json`) describing the enabled agents, the
//! host ports their MCP endpoints are published on, and the client
//! credentials allowed to mint agent-to-agent tokens. String values support
//! `${VAR}` environment expansion; unknown variables are left verbatim.

use crate::executor::CommandSpec;
use crate::types::AgentName;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::BTreeMap,
    env, fs,
    path::{Path, PathBuf},
};

/// Router base URL used by outbound agent callers.
pub const ENV_ROUTER_URL: &str = "PLOINKY_ROUTER_URL";
/// Listen port override for the routing server.
pub const ENV_ROUTER_PORT: &str = "PLOINKY_ROUTER_PORT";
/// Client id for the env-provided agent credential.
pub const ENV_CLIENT_ID: &str = "PLOINKY_AGENT_CLIENT_ID";
/// Client secret for the env-provided agent credential.
pub const ENV_CLIENT_SECRET: &str = "PLOINKY_AGENT_CLIENT_SECRET";
/// Poll interval override for the task side-channel, in milliseconds.
pub const ENV_TASK_POLL_INTERVAL: &str = "PLOINKY_MCP_TASK_POLL_INTERVAL_MS";

/// Default listen port when neither the env nor the routing file set one.
pub const DEFAULT_ROUTER_PORT: u16 = 8080;

/// On-disk shape of the routing file.
#[derive(Debug, Default, Deserialize)]
pub struct RoutingFile {
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub agents: BTreeMap<String, AgentEntry>,
    #[serde(default)]
    pub auth: AuthEntry,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentEntry {
    #[serde(rename = "hostPort")]
    pub host_port: u16,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub mounts: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AuthEntry {
    #[serde(default, rename = "signingSecret")]
    pub signing_secret: Option<String>,
    #[serde(default, rename = "tokenTtlSecs")]
    pub token_ttl_secs: Option<u64>,
    #[serde(default)]
    pub credentials: Vec<CredentialEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CredentialEntry {
    #[serde(rename = "clientId")]
    pub client_id: String,
    #[serde(rename = "clientSecret")]
    pub client_secret: String,
    /// Empty means "every enabled agent".
    #[serde(default, rename = "allowedTargets")]
    pub allowed_targets: Vec<String>,
}

/// Immutable route record for one enabled agent.
#[derive(Debug, Clone, Serialize)]
pub struct AgentRoute {
    pub agent_name: AgentName,
    pub host_port: u16,
    pub image: Option<String>,
    pub mounts: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl AgentRoute {
    pub fn new(agent_name: impl Into<AgentName>, host_port: u16) -> Self {
        Self {
            agent_name: agent_name.into(),
            host_port,
            image: None,
            mounts: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    /// MCP endpoint of the agent's published container port.
    pub fn mcp_url(&self) -> String {
        format!("http://127.0.0.1:{}/mcp", self.host_port)
    }

    /// Task side-channel of the agent runtime.
    pub fn task_url(&self) -> String {
        format!("http://127.0.0.1:{}/task", self.host_port)
    }
}

/// Resolved router configuration.
#[derive(Debug)]
pub struct RouterConfig {
    pub port: u16,
    pub routes: Vec<AgentRoute>,
    pub signing_secret: Option<String>,
    pub token_ttl_secs: Option<u64>,
    pub credentials: Vec<CredentialEntry>,
    pub workspace: PathBuf,
}

impl RouterConfig {
    /// Load the routing file under `workspace` (or an explicit path) and
    /// apply env overrides.
    pub fn load(workspace: &Path, path: Option<&Path>) -> anyhow::Result<Self> {
        let default_path = workspace.join(".ploinky").join("routing.json");
        let path = path.unwrap_or(&default_path);

        let file: RoutingFile = if path.exists() {
            serde_json::from_str(&fs::read_to_string(path)?)?
        } else {
            tracing::warn!("routing file {:?} not found, starting with no agents", path);
            RoutingFile::default()
        };

        Self::from_file(file, workspace)
    }

    pub fn from_file(file: RoutingFile, workspace: &Path) -> anyhow::Result<Self> {
        let port = match env::var(ENV_ROUTER_PORT) {
            Ok(raw) => raw
                .parse::<u16>()
                .map_err(|_| anyhow::anyhow!("invalid {ENV_ROUTER_PORT} value `{raw}`"))?,
            Err(_) => file.port.unwrap_or(DEFAULT_ROUTER_PORT),
        };

        let mut routes = Vec::new();
        for (name, entry) in file.agents {
            let entry = expand_agent(entry);
            routes.push(AgentRoute {
                agent_name: AgentName::new(name),
                host_port: entry.host_port,
                image: entry.image,
                mounts: entry.mounts,
                env: entry.env,
            });
        }

        let mut credentials = file.auth.credentials;
        for cred in &mut credentials {
            cred.client_secret = expand_env_vars(&cred.client_secret);
        }

        // An env-provided credential pair registers one caller allowed to
        // reach every enabled agent.
        if let (Ok(id), Ok(secret)) = (env::var(ENV_CLIENT_ID), env::var(ENV_CLIENT_SECRET)) {
            if !credentials.iter().any(|c| c.client_id == id) {
                credentials.push(CredentialEntry {
                    client_id: id,
                    client_secret: secret,
                    allowed_targets: Vec::new(),
                });
            }
        }

        Ok(Self {
            port,
            routes,
            signing_secret: file.auth.signing_secret.map(|s| expand_env_vars(&s)),
            token_ttl_secs: file.auth.token_ttl_secs,
            credentials,
            workspace: workspace.to_path_buf(),
        })
    }
}

/// Snapshot path for one agent's durable task records.
pub fn tasks_path(workspace: &Path, agent: &str) -> PathBuf {
    workspace
        .join(".ploinky")
        .join("tasks")
        .join(format!("{agent}.json"))
}

fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next(); // consume '{'
            let mut name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
            if let Ok(val) = env::var(&name) {
                out.push_str(&val);
            } else {
                out.push_str("${");
                out.push_str(&name);
                out.push('}');
            }
        } else {
            out.push(ch);
        }
    }

    out
}

fn expand_agent(mut entry: AgentEntry) -> AgentEntry {
    for val in entry.env.values_mut() {
        *val = expand_env_vars(val);
    }
    entry.mounts = entry
        .mounts
        .into_iter()
        .map(|m| expand_env_vars(&m))
        .collect();
    if let Some(image) = entry.image.as_mut() {
        *image = expand_env_vars(image);
    }
    entry
}

/// Execution mode of a manifest tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolMode {
    /// Run the command inline and answer on the same exchange.
    #[default]
    Sync,
    /// Enqueue on the task queue and answer with a `taskId`.
    Task,
}

/// One tool exposed by an agent runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolEntry {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "inputSchema")]
    pub input_schema: Option<Value>,
    pub command: CommandSpec,
    #[serde(default)]
    pub mode: ToolMode,
}

/// One static resource exposed by an agent runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceEntry {
    pub uri: String,
    #[serde(default)]
    pub name: Option<String>,
    pub text: String,
}

/// Manifest describing what a single agent runtime serves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentManifest {
    pub agent: String,
    #[serde(default)]
    pub tools: Vec<ToolEntry>,
    #[serde(default)]
    pub resources: Vec<ResourceEntry>,
    #[serde(default, rename = "maxConcurrent")]
    pub max_concurrent: Option<usize>,
}

impl AgentManifest {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }

    /// Built-in manifest with an echo tool, a deferred simulation tool, and
    /// one static resource. Used by the `agent` subcommand when no manifest
    /// is given, and by the end-to-end tests.
    pub fn demo(agent: &str) -> Self {
        Self {
            agent: agent.to_string(),
            tools: vec![
                ToolEntry {
                    name: "echo_script".to_string(),
                    description: Some("Echo the `text` argument back".to_string()),
                    input_schema: Some(serde_json::json!({
                        "type": "object",
                        "properties": {"text": {"type": "string"}},
                        "required": ["text"]
                    })),
                    command: CommandSpec::shell("printf '%s' \"$PLOINKY_ARG_TEXT\""),
                    mode: ToolMode::Sync,
                },
                ToolEntry {
                    name: "run_simulation".to_string(),
                    description: Some("Run a simulation step as a deferred task".to_string()),
                    input_schema: Some(serde_json::json!({
                        "type": "object",
                        "properties": {"scenario": {"type": "string"}}
                    })),
                    command: CommandSpec::shell("printf done"),
                    mode: ToolMode::Task,
                },
            ],
            resources: vec![ResourceEntry {
                uri: format!("ploinky://{agent}/manifest"),
                name: Some("manifest".to_string()),
                text: format!("agent {agent}"),
            }],
            max_concurrent: Some(2),
        }
    }
}
