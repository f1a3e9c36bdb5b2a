#![forbid(unsafe_code)]

// Socket-level authentication: the token verifier collaborator and the
// identity it attaches to a connection.

pub mod jwt;
pub mod rate_limit;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// User ids carrying this prefix belong to guests. Guest participant
/// transitions never reach the call store.
pub const GUEST_ID_PREFIX: &str = "guest:";

/// Authenticated user identity attached to a socket at handshake time.
/// Immutable for the lifetime of the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSnapshot {
    pub id: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl UserSnapshot {
    #[must_use]
    pub fn is_guest(&self) -> bool {
        self.id.starts_with(GUEST_ID_PREFIX)
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing token")]
    MissingToken,

    #[error("invalid token")]
    InvalidToken,

    #[error("token expired")]
    TokenExpired,

    #[error("verifier not configured")]
    NotConfigured,
}

/// Validates bearer tokens presented at the WebSocket handshake and returns
/// the authenticated identity. The token issuer lives in the external API
/// service; the session layer only verifies.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<UserSnapshot, AuthError>;
}
