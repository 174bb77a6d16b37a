//! MCP session bookkeeping for the routing front-end.
//!
//! A session pins a client conversation to exactly one endpoint: either one
//! upstream agent or the aggregate endpoint. Presenting a session against
//! any other endpoint is a protocol error, not a transport error.

use crate::protocol::McpError;
use crate::types::{AgentName, SessionId};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::RwLock;
use uuid::Uuid;

/// The endpoint a session was minted on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SessionTarget {
    Agent(AgentName),
    Aggregate,
}

impl fmt::Display for SessionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Agent(name) => write!(f, "agent {name}"),
            Self::Aggregate => write!(f, "aggregate"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct McpSession {
    pub id: SessionId,
    pub target: SessionTarget,
    pub protocol_version: String,
    pub created_at: DateTime<Utc>,
}

/// In-memory session table. Sessions do not survive a router restart.
#[derive(Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<SessionId, McpSession>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self, target: SessionTarget, protocol_version: String) -> McpSession {
        let session = McpSession {
            id: SessionId::new(Uuid::new_v4().to_string()),
            target,
            protocol_version,
            created_at: Utc::now(),
        };
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        session
    }

    pub async fn get(&self, id: &str) -> Option<McpSession> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn remove(&self, id: &str) -> Option<McpSession> {
        self.sessions.write().await.remove(id)
    }

    /// Drop every session pinned to one agent (used when the agent is
    /// disabled).
    pub async fn remove_for_agent(&self, agent: &str) {
        self.sessions
            .write()
            .await
            .retain(|_, s| !matches!(&s.target, SessionTarget::Agent(name) if name.as_str() == agent));
    }

    /// Resolve a request's session header against the endpoint it arrived
    /// on. Missing, unknown and cross-endpoint sessions all yield the same
    /// protocol error.
    pub async fn validate(
        &self,
        header: Option<&str>,
        target: &SessionTarget,
    ) -> Result<McpSession, McpError> {
        let id = header.ok_or_else(McpError::invalid_session)?;
        let session = self.get(id).await.ok_or_else(McpError::invalid_session)?;
        if &session.target != target {
            return Err(McpError::invalid_session());
        }
        Ok(session)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codes;

    #[tokio::test]
    async fn test_create_and_validate_session() {
        let store = SessionStore::new();
        let target = SessionTarget::Agent(AgentName::new("demo"));
        let session = store.create(target.clone(), "2025-06-18".to_string()).await;

        let found = store
            .validate(Some(session.id.as_str()), &target)
            .await
            .unwrap();
        assert_eq!(found.id, session.id);
        assert_eq!(found.protocol_version, "2025-06-18");
    }

    #[tokio::test]
    async fn test_cross_agent_session_is_rejected() {
        let store = SessionStore::new();
        let session = store
            .create(
                SessionTarget::Agent(AgentName::new("demo")),
                "2025-06-18".to_string(),
            )
            .await;

        let err = store
            .validate(
                Some(session.id.as_str()),
                &SessionTarget::Agent(AgentName::new("simulator")),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, codes::SERVER_ERROR);
        assert_eq!(err.message, "Missing or invalid MCP session");
    }

    #[tokio::test]
    async fn test_aggregate_session_not_valid_for_agents() {
        let store = SessionStore::new();
        let session = store
            .create(SessionTarget::Aggregate, "2025-06-18".to_string())
            .await;

        assert!(
            store
                .validate(Some(session.id.as_str()), &SessionTarget::Aggregate)
                .await
                .is_ok()
        );
        assert!(
            store
                .validate(
                    Some(session.id.as_str()),
                    &SessionTarget::Agent(AgentName::new("demo"))
                )
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_missing_and_unknown_sessions_rejected() {
        let store = SessionStore::new();
        let target = SessionTarget::Aggregate;

        assert!(store.validate(None, &target).await.is_err());
        assert!(store.validate(Some("nope"), &target).await.is_err());
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let store = SessionStore::new();
        let session = store
            .create(SessionTarget::Aggregate, "2025-06-18".to_string())
            .await;

        assert!(store.remove(session.id.as_str()).await.is_some());
        assert!(store.remove(session.id.as_str()).await.is_none());
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn test_remove_for_agent_drops_only_that_agent() {
        let store = SessionStore::new();
        let demo = store
            .create(
                SessionTarget::Agent(AgentName::new("demo")),
                "2025-06-18".to_string(),
            )
            .await;
        let sim = store
            .create(
                SessionTarget::Agent(AgentName::new("simulator")),
                "2025-06-18".to_string(),
            )
            .await;

        store.remove_for_agent("demo").await;
        assert!(store.get(demo.id.as_str()).await.is_none());
        assert!(store.get(sim.id.as_str()).await.is_some());
    }
}
