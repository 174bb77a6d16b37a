//! Agent-to-agent authentication.
//!
//! When one agent calls another through the router it first obtains a
//! bearer token with its client credentials. This module holds both sides
//! of that exchange:
//!
//! - **Service**: mints HS256-signed bearer tokens from a configured
//!   credential list and verifies incoming `Authorization` headers into a
//!   [`TokenPrincipal`] carrying the caller's agent allow-list.
//! - **Client**: acquires tokens from a running router and caches them
//!   per-process, re-minting once inside the pre-expiry refresh window.
//!
//! Tokens are memory-only: the signing secret may be generated at startup,
//! in which case outstanding tokens die with the router process.

mod agent_client;
mod service;

pub use agent_client::{AgentTokenClient, REFRESH_WINDOW_SECS};
pub use service::{
    AgentCredential, AuthError, DEFAULT_TOKEN_TTL_SECS, MintedToken, TokenPrincipal, TokenService,
};
