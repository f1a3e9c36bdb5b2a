#![forbid(unsafe_code)]

// HS256 JWT verifier. Two claim shapes share the secret: access tokens minted
// by the API service for registered users, and short-lived guest tokens whose
// subject carries the `guest:` prefix and whose name claim supplies the
// display name shown in the room.

use async_trait::async_trait;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use super::{AuthError, TokenVerifier, UserSnapshot, GUEST_ID_PREFIX};

const ACCESS_LIFETIME_SECS: u64 = 60 * 60;
const GUEST_LIFETIME_SECS: u64 = 4 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id, or `guest:<session>` for guest tokens.
    pub sub: String,
    /// Display name.
    pub name: String,
    /// Token type: "access" or "guest".
    pub typ: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    pub exp: usize,
}

/// JWT-backed [`TokenVerifier`].
pub struct JwtVerifier {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtVerifier {
    #[must_use]
    pub fn new(secret: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Mint an access token. The production issuer is the API service; this
    /// exists for local development and the test suite.
    pub fn issue_access(
        &self,
        user_id: &str,
        display_name: &str,
        email: Option<&str>,
    ) -> Result<String, AuthError> {
        let claims = Claims {
            sub: user_id.to_string(),
            name: display_name.to_string(),
            typ: "access".to_string(),
            email: email.map(str::to_string),
            avatar: None,
            exp: expiry(ACCESS_LIFETIME_SECS),
        };
        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|_| AuthError::NotConfigured)
    }

    /// Mint a guest token carrying only a display name. The subject is a
    /// fresh `guest:` id, so two guests never collide on `(roomId, userId)`.
    pub fn issue_guest(&self, display_name: &str) -> Result<String, AuthError> {
        let claims = Claims {
            sub: format!("{GUEST_ID_PREFIX}{}", Uuid::new_v4().simple()),
            name: display_name.to_string(),
            typ: "guest".to_string(),
            email: None,
            avatar: None,
            exp: expiry(GUEST_LIFETIME_SECS),
        };
        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|_| AuthError::NotConfigured)
    }
}

#[async_trait]
impl TokenVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> Result<UserSnapshot, AuthError> {
        let data = decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken,
            })?;

        let claims = data.claims;

        // A guest-typed token must carry a guest subject and vice versa.
        if (claims.typ == "guest") != claims.sub.starts_with(GUEST_ID_PREFIX) {
            return Err(AuthError::InvalidToken);
        }

        Ok(UserSnapshot {
            id: claims.sub,
            display_name: claims.name,
            email: claims.email,
            avatar_url: claims.avatar,
        })
    }
}

fn expiry(lifetime_secs: u64) -> usize {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    (now + lifetime_secs) as usize
}
