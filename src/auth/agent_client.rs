//! Client-credential token acquisition with pre-expiry caching.

use crate::config::{ENV_CLIENT_ID, ENV_CLIENT_SECRET, ENV_ROUTER_URL};
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::debug;
use url::Url;

/// A cached token is re-minted once `now + REFRESH_WINDOW_SECS` crosses its
/// expiry.
pub const REFRESH_WINDOW_SECS: u64 = 60;

#[derive(Debug, Serialize)]
struct MintRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
}

#[derive(Debug, Deserialize)]
struct MintResponse {
    ok: bool,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: u64,
}

/// Acquires bearer tokens from a router's mint endpoint and caches the
/// result per-process.
pub struct AgentTokenClient {
    http: reqwest::Client,
    mint_url: Url,
    client_id: String,
    client_secret: String,
    cache: Mutex<Option<CachedToken>>,
}

impl AgentTokenClient {
    pub fn new(router_url: &str, client_id: &str, client_secret: &str) -> Result<Self> {
        let base = Url::parse(router_url)
            .with_context(|| format!("invalid router url `{router_url}`"))?;
        let mint_url = base
            .join("/auth/agent-token")
            .context("failed to derive mint endpoint")?;

        Ok(Self {
            http: reqwest::Client::new(),
            mint_url,
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            cache: Mutex::new(None),
        })
    }

    /// Build from `PLOINKY_ROUTER_URL` / `PLOINKY_AGENT_CLIENT_ID` /
    /// `PLOINKY_AGENT_CLIENT_SECRET`.
    pub fn from_env() -> Result<Self> {
        let router_url =
            env::var(ENV_ROUTER_URL).with_context(|| format!("{ENV_ROUTER_URL} not set"))?;
        let client_id =
            env::var(ENV_CLIENT_ID).with_context(|| format!("{ENV_CLIENT_ID} not set"))?;
        let client_secret =
            env::var(ENV_CLIENT_SECRET).with_context(|| format!("{ENV_CLIENT_SECRET} not set"))?;
        Self::new(&router_url, &client_id, &client_secret)
    }

    /// Return a valid bearer token, minting at most once per cache miss.
    pub async fn get(&self) -> Result<String> {
        let mut cache = self.cache.lock().await;

        if let Some(cached) = cache.as_ref()
            && unix_now() + REFRESH_WINDOW_SECS < cached.expires_at
        {
            return Ok(cached.token.clone());
        }

        let response = self
            .http
            .post(self.mint_url.clone())
            .json(&MintRequest {
                client_id: &self.client_id,
                client_secret: &self.client_secret,
            })
            .send()
            .await
            .context("token mint request failed")?;

        let status = response.status();
        let body: MintResponse = response
            .json()
            .await
            .with_context(|| format!("unreadable mint response (HTTP {status})"))?;

        if !body.ok {
            bail!(
                "token mint rejected (HTTP {status}): {}",
                body.error.unwrap_or_else(|| "unknown error".to_string())
            );
        }

        let token = body
            .access_token
            .ok_or_else(|| anyhow::anyhow!("mint response missing access_token"))?;
        let expires_in = body.expires_in.unwrap_or(0);
        let expires_at = unix_now() + expires_in;

        debug!(client_id = %self.client_id, expires_in, "cached fresh agent token");
        *cache = Some(CachedToken {
            token: token.clone(),
            expires_at,
        });

        Ok(token)
    }

    /// Drop the cached token so the next `get` re-mints.
    pub async fn invalidate(&self) {
        *self.cache.lock().await = None;
    }

    /// Test hook: reset the process-wide cache to a deterministic state.
    pub async fn reset_for_tests(&self) {
        self.invalidate().await;
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
