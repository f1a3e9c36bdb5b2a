#![forbid(unsafe_code)]

// Environment configuration, read once at startup.

use std::net::IpAddr;

use crate::media::config::MediaConfig;
use crate::turn::IceConfig;

const DEFAULT_SIGNALING_PORT: u16 = 3000;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub signaling_port: u16,
    /// Handshake origin allow-list. Empty means allow all.
    pub allowed_origins: Vec<String>,
    pub ice: IceConfig,
    pub media: MediaConfig,
    pub jwt_secret: Option<String>,
    pub database_url: Option<String>,
}

impl ServerConfig {
    #[must_use]
    pub fn from_env() -> Self {
        let signaling_port = std::env::var("SIGNALING_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_SIGNALING_PORT);

        let allowed_origins = std::env::var("ALLOWED_ORIGINS")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let mut media = MediaConfig::default();
        if let Some(ip) = parse_env_ip("MEDIASOUP_LISTEN_IP") {
            media.listen_ip = ip;
        }
        media.announced_ip = parse_env_ip("MEDIASOUP_ANNOUNCED_IP");
        if let Some(port) = parse_env_port("MEDIASOUP_MIN_PORT") {
            media.rtc_min_port = port;
        }
        if let Some(port) = parse_env_port("MEDIASOUP_MAX_PORT") {
            media.rtc_max_port = port;
        }
        if media.rtc_min_port > media.rtc_max_port {
            media.rtc_max_port = media.rtc_min_port;
        }

        Self {
            signaling_port,
            allowed_origins,
            ice: IceConfig::from_env(),
            media,
            jwt_secret: std::env::var("JWT_SECRET").ok(),
            database_url: std::env::var("DATABASE_URL").ok(),
        }
    }
}

fn parse_env_ip(name: &str) -> Option<IpAddr> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn parse_env_port(name: &str) -> Option<u16> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}
