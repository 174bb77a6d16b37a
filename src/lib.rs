// Core modules
pub mod agent;
pub mod auth;
pub mod client;
pub mod config;
pub mod executor;
pub mod protocol;
pub mod queue;
pub mod router;
pub mod types;

// Re-export key types and functions
pub use agent::AgentRuntime;
pub use auth::{AgentTokenClient, TokenService};
pub use client::McpClient;
pub use config::{AgentManifest, AgentRoute, RouterConfig};
pub use protocol::{JsonRpcRequest, JsonRpcResponse, McpError};
pub use queue::{NewTask, Task, TaskQueue, TaskStatus};
pub use router::{RouterState, SharedRouter, build_router};

use std::sync::Arc;

/// Convenience function to create a fully configured routing server.
///
/// Builds the shared state from a resolved configuration and returns it
/// alongside the axum application, ready to serve.
pub fn create_router(config: RouterConfig) -> (SharedRouter, axum::Router) {
    let state = Arc::new(RouterState::new(config));
    let app = build_router(state.clone());
    (state, app)
}
