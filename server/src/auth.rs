//! Handshake identity resolution.
//!
//! Verifying who a bearer token belongs to is an external concern. The
//! gateway only asks an [`Authenticator`] to turn the token presented at
//! handshake time into an [`Identity`], which then stays fixed for the life
//! of the connection.

use crate::config::{GatewayConfig, RateLimitConfig};
use crate::error::EngineError;
use sha2::{Digest, Sha256};
use shared::RejectReason;
use std::collections::HashMap;
use std::fmt;

const MAX_TOKEN_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Anonymous,
    Player(String),
    Admin(String),
}

impl Identity {
    /// Token bucket parameters for this identity class.
    pub fn rate_limit(&self, config: &GatewayConfig) -> RateLimitConfig {
        match self {
            Identity::Anonymous => config.anonymous_rate,
            Identity::Player(_) => config.player_rate,
            Identity::Admin(_) => config.admin_rate,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Anonymous => write!(f, "anonymous"),
            Identity::Player(id) => write!(f, "player:{}", id),
            Identity::Admin(name) => write!(f, "admin:{}", name),
        }
    }
}

pub trait Authenticator: Send + Sync {
    /// Resolves the handshake token. An `Err` refuses the handshake.
    fn authenticate(&self, token: Option<&str>) -> Result<Identity, EngineError>;
}

/// Admins come from a fixed token table; any other well-formed token names a
/// player. The player id is derived from the token so that the credential
/// itself never reaches bets, archives or logs.
#[derive(Debug, Clone, Default)]
pub struct StaticAuthenticator {
    admin_tokens: HashMap<String, String>,
}

impl StaticAuthenticator {
    pub fn new(admin_tokens: HashMap<String, String>) -> Self {
        Self { admin_tokens }
    }
}

impl Authenticator for StaticAuthenticator {
    fn authenticate(&self, token: Option<&str>) -> Result<Identity, EngineError> {
        let Some(token) = token else {
            return Ok(Identity::Anonymous);
        };

        if let Some(admin) = self.admin_tokens.get(token) {
            return Ok(Identity::Admin(admin.clone()));
        }

        if is_well_formed(token) {
            Ok(Identity::Player(player_id(token)))
        } else {
            Err(EngineError::Validation(RejectReason::InvalidIdentity))
        }
    }
}

/// Stable, non-reversible player id for a bearer token.
fn player_id(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    format!("p-{}", hex::encode(&digest[..8]))
}

fn is_well_formed(token: &str) -> bool {
    !token.is_empty()
        && token.len() <= MAX_TOKEN_LEN
        && token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Extracts the bearer token from the request query (`?token=`) or an
/// `Authorization: Bearer` header. The header wins when both are present.
pub fn token_from_request(query: Option<&str>, authorization: Option<&str>) -> Option<String> {
    if let Some(value) = authorization {
        if let Some(token) = value.trim().strip_prefix("Bearer ") {
            return Some(token.trim().to_string());
        }
    }

    query?
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
        .map(|token| token.to_string())
}
