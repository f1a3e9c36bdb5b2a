#![forbid(unsafe_code)]

// ICE server list assembly. STUN is always present; TURN is optional and
// comes in two flavors: static credentials, or coturn time-limited
// credentials derived from a shared secret (TURN REST API, HMAC-SHA1).

use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use std::time::{SystemTime, UNIX_EPOCH};

type HmacSha1 = Hmac<Sha1>;

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
const DEFAULT_CREDENTIAL_TTL_SECS: u64 = 86_400;

/// ICE server entry sent to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[derive(Debug, Clone)]
pub enum TurnAuth {
    /// Fixed username/credential pair from configuration.
    Static { username: String, credential: String },
    /// coturn `--use-auth-secret`: username = "expiry:peer", credential =
    /// base64(HMAC-SHA1(secret, username)).
    Secret { secret: String, ttl_secs: u64 },
}

#[derive(Debug, Clone)]
pub struct IceConfig {
    pub stun_url: String,
    pub turn_url: Option<String>,
    pub turn_auth: Option<TurnAuth>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self::stun_only(DEFAULT_STUN_SERVER)
    }
}

impl IceConfig {
    #[must_use]
    pub fn stun_only(stun_url: &str) -> Self {
        Self {
            stun_url: stun_url.to_string(),
            turn_url: None,
            turn_auth: None,
        }
    }

    /// Load from the environment. `STUN_SERVER` overrides the default;
    /// TURN activates when `TURN_SERVER_URL` is set, with either static
    /// credentials or a shared secret.
    #[must_use]
    pub fn from_env() -> Self {
        let stun_url =
            std::env::var("STUN_SERVER").unwrap_or_else(|_| DEFAULT_STUN_SERVER.to_string());
        let turn_url = std::env::var("TURN_SERVER_URL").ok();

        let turn_auth = if turn_url.is_some() {
            if let Ok(secret) = std::env::var("TURN_SERVER_SECRET") {
                let ttl_secs = std::env::var("TURN_CREDENTIAL_TTL")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_CREDENTIAL_TTL_SECS);
                Some(TurnAuth::Secret { secret, ttl_secs })
            } else {
                match (
                    std::env::var("TURN_SERVER_USERNAME"),
                    std::env::var("TURN_SERVER_CREDENTIAL"),
                ) {
                    (Ok(username), Ok(credential)) => Some(TurnAuth::Static {
                        username,
                        credential,
                    }),
                    _ => None,
                }
            }
        } else {
            None
        };

        Self {
            stun_url,
            turn_url,
            turn_auth,
        }
    }

    /// Build the ICE server list for one peer. Time-limited TURN credentials
    /// embed the peer id so leaked credentials are attributable.
    #[must_use]
    pub fn ice_servers(&self, peer_hint: &str) -> Vec<IceServer> {
        let mut servers = vec![IceServer {
            urls: vec![self.stun_url.clone()],
            username: None,
            credential: None,
        }];

        if let (Some(url), Some(auth)) = (&self.turn_url, &self.turn_auth) {
            let (username, credential) = match auth {
                TurnAuth::Static {
                    username,
                    credential,
                } => (username.clone(), credential.clone()),
                TurnAuth::Secret { secret, ttl_secs } => {
                    time_limited_credentials(secret, *ttl_secs, peer_hint)
                }
            };
            servers.push(IceServer {
                urls: vec![url.clone()],
                username: Some(username),
                credential: Some(credential),
            });
        }

        servers
    }
}

fn time_limited_credentials(secret: &str, ttl_secs: u64, peer_hint: &str) -> (String, String) {
    let expiry = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        + ttl_secs;
    let username = format!("{expiry}:{peer_hint}");

    let mut mac = HmacSha1::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(username.as_bytes());
    let credential =
        base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());

    (username, credential)
}
