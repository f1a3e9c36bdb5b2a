#![forbid(unsafe_code)]

// Participant state: a user's presence in one room, identified by a
// server-assigned peer id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::auth::UserSnapshot;

/// Server-side peer id. Clients never choose these.
#[must_use]
pub fn new_peer_id() -> String {
    format!("peer_{}", Uuid::new_v4().simple())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Host,
    Moderator,
    Participant,
    Guest,
}

impl ParticipantRole {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Moderator => "moderator",
            Self::Participant => "participant",
            Self::Guest => "guest",
        }
    }
}

/// Tri-state media flags, updated atomically per participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaState {
    pub audio: bool,
    pub video: bool,
    pub screen: bool,
}

impl Default for MediaState {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
            screen: false,
        }
    }
}

/// Partial media-state update; missing fields keep their prior value.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaStateUpdate {
    pub audio_enabled: Option<bool>,
    pub video_enabled: Option<bool>,
    pub screen_share_enabled: Option<bool>,
}

impl MediaState {
    pub fn apply(&mut self, update: MediaStateUpdate) {
        if let Some(audio) = update.audio_enabled {
            self.audio = audio;
        }
        if let Some(video) = update.video_enabled {
            self.video = video;
        }
        if let Some(screen) = update.screen_share_enabled {
            self.screen = screen;
        }
    }
}

pub struct Participant {
    pub peer_id: String,
    pub user: UserSnapshot,
    pub socket_id: String,
    pub role: ParticipantRole,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
    /// Monotonic disconnect stamp for reap-grace arithmetic.
    pub disconnected_at: Option<tokio::time::Instant>,
    pub is_connected: bool,
    pub media_state: MediaState,
    /// Writer channel of the participant's current socket.
    pub sender: mpsc::Sender<Arc<String>>,
}

impl Participant {
    #[must_use]
    pub fn new(
        user: UserSnapshot,
        socket_id: String,
        role: ParticipantRole,
        sender: mpsc::Sender<Arc<String>>,
    ) -> Self {
        Self {
            peer_id: new_peer_id(),
            user,
            socket_id,
            role,
            joined_at: Utc::now(),
            left_at: None,
            disconnected_at: None,
            is_connected: true,
            media_state: MediaState::default(),
            sender,
        }
    }

    /// Reconnect: swap in the new socket, keep the peer id (invariant P2).
    pub fn rebind(&mut self, socket_id: String, sender: mpsc::Sender<Arc<String>>) {
        self.socket_id = socket_id;
        self.sender = sender;
        self.is_connected = true;
        self.left_at = None;
        self.disconnected_at = None;
    }

    pub fn mark_disconnected(&mut self) {
        self.is_connected = false;
        self.left_at = Some(Utc::now());
        self.disconnected_at = Some(tokio::time::Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> UserSnapshot {
        UserSnapshot {
            id: "u_1".into(),
            display_name: "Ann".into(),
            email: None,
            avatar_url: None,
        }
    }

    #[test]
    fn peer_ids_are_prefixed_and_unique() {
        let a = new_peer_id();
        let b = new_peer_id();
        assert!(a.starts_with("peer_"));
        assert_ne!(a, b);
    }

    #[test]
    fn media_state_partial_update_keeps_missing_fields() {
        let mut state = MediaState::default();
        state.apply(MediaStateUpdate {
            audio_enabled: Some(false),
            video_enabled: None,
            screen_share_enabled: Some(true),
        });
        assert!(!state.audio);
        assert!(state.video);
        assert!(state.screen);
    }

    #[tokio::test]
    async fn rebind_clears_departure_state() {
        let (tx, _rx) = mpsc::channel(1);
        let mut p = Participant::new(user(), "sock-1".into(), ParticipantRole::Participant, tx);
        let original_peer_id = p.peer_id.clone();

        p.mark_disconnected();
        assert!(!p.is_connected);
        assert!(p.left_at.is_some());

        let (tx2, _rx2) = mpsc::channel(1);
        p.rebind("sock-2".into(), tx2);
        assert!(p.is_connected);
        assert!(p.left_at.is_none());
        assert_eq!(p.socket_id, "sock-2");
        assert_eq!(p.peer_id, original_peer_id);
    }
}
