//! Token mint and verification for agent-to-agent calls.

use crate::types::{AgentName, ClientId};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Default token lifetime advertised as `expires_in`.
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 3600;

const ISSUER: &str = "ploinky-router";

/// One configured client-credential pair.
#[derive(Debug, Clone)]
pub struct AgentCredential {
    pub client_id: ClientId,
    pub client_secret: String,
    /// Empty means "every enabled agent" at mint time.
    pub allowed_targets: Vec<AgentName>,
}

/// Authentication errors.
#[derive(Debug, Clone)]
pub enum AuthError {
    /// No `Authorization: Bearer` header present
    MissingBearer,
    /// Unknown client id or wrong secret
    InvalidCredentials,
    /// Signature, shape or expiry check failed
    InvalidToken(String),
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingBearer => write!(f, "Missing bearer token"),
            Self::InvalidCredentials => write!(f, "Invalid client credentials"),
            Self::InvalidToken(msg) => write!(f, "Invalid token: {msg}"),
        }
    }
}

impl std::error::Error for AuthError {}

/// Verified identity attached to a request after the auth gate.
#[derive(Debug, Clone)]
pub struct TokenPrincipal {
    pub client_id: ClientId,
    pub allowed_targets: HashSet<AgentName>,
    /// Unix seconds.
    pub expires_at: u64,
}

impl TokenPrincipal {
    pub fn allows(&self, agent: &str) -> bool {
        self.allowed_targets.contains(agent)
    }
}

/// A freshly minted token plus its advertised lifetime.
#[derive(Debug, Clone)]
pub struct MintedToken {
    pub access_token: String,
    pub expires_in: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct AgentClaims {
    sub: String,
    targets: Vec<String>,
    iat: u64,
    exp: u64,
    iss: String,
}

/// Mints and verifies agent bearer tokens.
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    credentials: Vec<AgentCredential>,
    ttl_secs: u64,
}

impl TokenService {
    pub fn new(secret: &str, ttl_secs: u64, credentials: Vec<AgentCredential>) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            credentials,
            ttl_secs,
        }
    }

    /// Exchange client credentials for a bearer token.
    ///
    /// A credential configured without explicit targets is granted every
    /// agent in `enabled_agents`.
    pub fn mint(
        &self,
        client_id: &str,
        client_secret: &str,
        enabled_agents: &[AgentName],
    ) -> Result<MintedToken, AuthError> {
        let credential = self
            .credentials
            .iter()
            .find(|c| c.client_id.as_str() == client_id)
            .ok_or(AuthError::InvalidCredentials)?;

        if !constant_time_eq(&credential.client_secret, client_secret) {
            return Err(AuthError::InvalidCredentials);
        }

        let targets: Vec<String> = if credential.allowed_targets.is_empty() {
            enabled_agents.iter().map(|a| a.to_string()).collect()
        } else {
            credential
                .allowed_targets
                .iter()
                .map(|a| a.to_string())
                .collect()
        };

        let now = unix_now();
        let claims = AgentClaims {
            sub: client_id.to_string(),
            targets,
            iat: now,
            exp: now + self.ttl_secs,
            iss: ISSUER.to_string(),
        };

        let access_token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;

        debug!(client_id, "minted agent token");
        Ok(MintedToken {
            access_token,
            expires_in: self.ttl_secs,
        })
    }

    /// Verify a bearer token string into a principal.
    pub fn verify(&self, token: &str) -> Result<TokenPrincipal, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[ISSUER]);

        let data = decode::<AgentClaims>(token, &self.decoding, &validation)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;

        // The decoder allows clock leeway; expiry here is exact.
        let claims = data.claims;
        if claims.exp <= unix_now() {
            return Err(AuthError::InvalidToken("token expired".to_string()));
        }

        Ok(TokenPrincipal {
            client_id: ClientId::new(claims.sub),
            allowed_targets: claims.targets.into_iter().map(AgentName::new).collect(),
            expires_at: claims.exp,
        })
    }

    /// Verify a full `Authorization` header value.
    pub fn verify_header(&self, header: Option<&str>) -> Result<TokenPrincipal, AuthError> {
        let token = header
            .and_then(|h| h.strip_prefix("Bearer "))
            .ok_or(AuthError::MissingBearer)?;
        self.verify(token)
    }
}

/// Compare secrets without an early exit on the first differing byte.
fn constant_time_eq(expected: &str, provided: &str) -> bool {
    let a = Sha256::digest(expected.as_bytes());
    let b = Sha256::digest(provided.as_bytes());
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> TokenService {
        TokenService::new(
            "test-signing-secret",
            DEFAULT_TOKEN_TTL_SECS,
            vec![
                AgentCredential {
                    client_id: ClientId::new("caller"),
                    client_secret: "pw".to_string(),
                    allowed_targets: vec![AgentName::new("demo")],
                },
                AgentCredential {
                    client_id: ClientId::new("wildcard"),
                    client_secret: "open".to_string(),
                    allowed_targets: vec![],
                },
            ],
        )
    }

    fn all_agents() -> Vec<AgentName> {
        vec![AgentName::new("demo"), AgentName::new("simulator")]
    }

    #[test]
    fn test_mint_and_verify_roundtrip() {
        let svc = service();
        let minted = svc.mint("caller", "pw", &all_agents()).unwrap();
        assert_eq!(minted.expires_in, DEFAULT_TOKEN_TTL_SECS);

        let principal = svc.verify(&minted.access_token).unwrap();
        assert_eq!(principal.client_id.as_str(), "caller");
        assert!(principal.allows("demo"));
        assert!(!principal.allows("simulator"));
        assert!(principal.expires_at > unix_now());
    }

    #[test]
    fn test_mint_rejects_bad_credentials() {
        let svc = service();
        assert!(matches!(
            svc.mint("caller", "wrong", &all_agents()),
            Err(AuthError::InvalidCredentials)
        ));
        assert!(matches!(
            svc.mint("nobody", "pw", &all_agents()),
            Err(AuthError::InvalidCredentials)
        ));
    }

    #[test]
    fn test_wildcard_credential_gets_all_enabled_agents() {
        let svc = service();
        let minted = svc.mint("wildcard", "open", &all_agents()).unwrap();
        let principal = svc.verify(&minted.access_token).unwrap();
        assert!(principal.allows("demo"));
        assert!(principal.allows("simulator"));
        assert!(!principal.allows("webtty"));
    }

    #[test]
    fn test_verify_rejects_tampered_token() {
        let svc = service();
        let minted = svc.mint("caller", "pw", &all_agents()).unwrap();

        let mut tampered = minted.access_token.clone();
        tampered.pop();
        tampered.push('A');
        assert!(matches!(
            svc.verify(&tampered),
            Err(AuthError::InvalidToken(_))
        ));
    }

    #[test]
    fn test_verify_rejects_foreign_signature() {
        let svc = service();
        let other = TokenService::new(
            "different-secret",
            DEFAULT_TOKEN_TTL_SECS,
            vec![AgentCredential {
                client_id: ClientId::new("caller"),
                client_secret: "pw".to_string(),
                allowed_targets: vec![],
            }],
        );
        let minted = other.mint("caller", "pw", &all_agents()).unwrap();
        assert!(matches!(
            svc.verify(&minted.access_token),
            Err(AuthError::InvalidToken(_))
        ));
    }

    #[test]
    fn test_verify_rejects_expired_token() {
        let svc = service();
        let now = unix_now();
        let claims = AgentClaims {
            sub: "caller".to_string(),
            targets: vec!["demo".to_string()],
            iat: now.saturating_sub(120),
            exp: now.saturating_sub(60),
            iss: ISSUER.to_string(),
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret("test-signing-secret".as_bytes()),
        )
        .unwrap();

        assert!(matches!(svc.verify(&token), Err(AuthError::InvalidToken(_))));
    }

    #[test]
    fn test_verify_header_shapes() {
        let svc = service();
        let minted = svc.mint("caller", "pw", &all_agents()).unwrap();

        assert!(matches!(
            svc.verify_header(None),
            Err(AuthError::MissingBearer)
        ));
        assert!(matches!(
            svc.verify_header(Some("Basic abc")),
            Err(AuthError::MissingBearer)
        ));

        let header = format!("Bearer {}", minted.access_token);
        assert!(svc.verify_header(Some(&header)).is_ok());
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("secret", "secret"));
        assert!(!constant_time_eq("secret", "secres"));
        assert!(!constant_time_eq("secret", "longer-than-secret"));
    }
}
