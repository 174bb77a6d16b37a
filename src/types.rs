//! NewType wrappers for strong typing across the routing plane.
//!
//! These types prevent accidental mixing of semantically different strings
//! (e.g., passing a task id where an agent name is expected).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Macro to generate a NewType wrapper with standard trait implementations.
macro_rules! newtype_string {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Get the inner value as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume and return the inner String.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

newtype_string!(
    /// Name of an enabled agent, as used in route paths (`/mcps/<agent>/mcp`).
    ///
    /// Agent names come from the routing configuration and key the route
    /// table; a bearer token's allow-list is a set of these.
    AgentName
);

newtype_string!(
    /// Opaque MCP session identifier minted on `initialize`.
    ///
    /// Carried by clients in the `mcp-session-id` header on every exchange
    /// after the handshake. Sessions are memory-only and die with the router.
    SessionId
);

newtype_string!(
    /// Identifier of a queued task (8 random bytes, hex encoded).
    ///
    /// Unique within one queue's lifetime, including across restarts, and
    /// used as the `taskId` query parameter on the task side-channel.
    TaskId
);

newtype_string!(
    /// Client identifier for agent-to-agent credential grants.
    ///
    /// Appears as the `sub` claim in minted bearer tokens and in audit
    /// logging. Distinct from `AgentName`: one client may be allowed to
    /// reach several agents.
    ClientId
);

newtype_string!(
    /// Tool name as advertised by an agent's MCP endpoint.
    ///
    /// On the aggregate endpoint tool names are prefixed with the owning
    /// agent (`<agent>::<tool>`); this type holds the bare name.
    ToolName
);
