#![forbid(unsafe_code)]

// Media configuration: the router codec set and the transport network binding.

use std::net::{IpAddr, Ipv4Addr};

use super::types::{MediaKind, RtcpFeedback, RtpCodecCapability};

/// Configuration handed to the media worker.
#[derive(Debug, Clone)]
pub struct MediaConfig {
    /// IP the worker binds RTC sockets to.
    pub listen_ip: IpAddr,
    /// Publicly reachable address advertised in ICE candidates. Falls back to
    /// `listen_ip` when unset.
    pub announced_ip: Option<IpAddr>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    /// Starting estimate for outgoing bandwidth, in bits per second.
    pub initial_available_outgoing_bitrate: u32,
    pub codecs: Vec<RtpCodecCapability>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            announced_ip: None,
            rtc_min_port: 10000,
            rtc_max_port: 59999,
            initial_available_outgoing_bitrate: 1_000_000,
            codecs: default_codecs(),
        }
    }
}

impl MediaConfig {
    /// Address to advertise in ICE candidates.
    #[must_use]
    pub fn candidate_ip(&self) -> IpAddr {
        self.announced_ip.unwrap_or(self.listen_ip)
    }
}

fn feedback(kinds: &[&str]) -> Vec<RtcpFeedback> {
    kinds
        .iter()
        .map(|k| RtcpFeedback {
            kind: (*k).to_string(),
            parameter: None,
        })
        .collect()
}

/// Default codec set: Opus for audio, VP8/VP9/H.264 for video.
#[must_use]
pub fn default_codecs() -> Vec<RtpCodecCapability> {
    vec![
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: Some(2),
            parameters: serde_json::json!({ "minptime": 10, "useinbandfec": 1 }),
            rtcp_feedback: feedback(&["transport-cc"]),
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            channels: None,
            parameters: serde_json::Value::Null,
            rtcp_feedback: feedback(&["nack", "nack pli", "ccm fir", "goog-remb", "transport-cc"]),
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP9".to_string(),
            clock_rate: 90000,
            channels: None,
            parameters: serde_json::Value::Null,
            rtcp_feedback: feedback(&["nack", "nack pli", "ccm fir", "goog-remb", "transport-cc"]),
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/H264".to_string(),
            clock_rate: 90000,
            channels: None,
            parameters: serde_json::json!({
                "level-asymmetry-allowed": 1,
                "packetization-mode": 1,
                "profile-level-id": "42e01f",
            }),
            rtcp_feedback: feedback(&["nack", "nack pli", "ccm fir", "goog-remb", "transport-cc"]),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_codecs_cover_both_kinds() {
        let codecs = default_codecs();
        assert!(codecs.iter().any(|c| c.kind == MediaKind::Audio));
        assert_eq!(codecs.iter().filter(|c| c.kind == MediaKind::Video).count(), 3);
    }

    #[test]
    fn candidate_ip_prefers_announced() {
        let mut config = MediaConfig::default();
        assert_eq!(config.candidate_ip(), config.listen_ip);

        let public: IpAddr = "198.51.100.7".parse().unwrap();
        config.announced_ip = Some(public);
        assert_eq!(config.candidate_ip(), public);
    }
}
