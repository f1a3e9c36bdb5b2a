#![forbid(unsafe_code)]

// Call record store collaborator. The session layer writes status transitions
// through this trait; persistence schemas belong to the API service. All
// operations are idempotent and their failures are logged, never fatal — the
// in-memory room state stays authoritative.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("call not found: {0}")]
    NotFound(String),

    #[error("call already exists: {0}")]
    AlreadyExists(String),

    #[error("store backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Who may join a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    #[default]
    Open,
    InvitedOnly,
}

/// Durable call lifecycle, mirrored by the in-memory room status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    #[default]
    Waiting,
    Live,
    Ended,
}

impl CallStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Ended)
    }
}

/// Snapshot of a call record, read during join validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub call_id: String,
    pub room_id: String,
    pub name: String,
    pub host_user_id: String,
    /// Plaintext join passcode; compared constant-time, never sent to clients.
    pub passcode: Option<String>,
    pub kind: CallKind,
    pub invited: Vec<String>,
    pub max_participants: u32,
    pub status: CallStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl CallRecord {
    #[must_use]
    pub fn is_invited(&self, user_id: &str) -> bool {
        self.host_user_id == user_id || self.invited.iter().any(|u| u == user_id)
    }
}

/// Durable side-effect surface of the session layer.
#[async_trait]
pub trait CallStore: Send + Sync {
    /// Insert a call record. Re-creating an existing `room_id` is an error so
    /// live room ids stay unique (re-use is allowed after end + reap).
    async fn create(&self, record: CallRecord) -> StoreResult<()>;

    async fn get_by_room_id(&self, room_id: &str) -> StoreResult<CallRecord>;

    /// Record that a user became a participant of the call.
    async fn add_participant(&self, call_id: &str, user_id: &str, role: &str) -> StoreResult<()>;

    /// Record a connect/disconnect transition for a participant.
    async fn update_participant_status(
        &self,
        call_id: &str,
        user_id: &str,
        is_connected: bool,
        socket_id: Option<&str>,
    ) -> StoreResult<()>;

    /// `waiting → live`, stamping the start time. Idempotent.
    async fn start(&self, call_id: &str) -> StoreResult<()>;

    /// Terminal transition, stamping the end time. Idempotent.
    async fn end(&self, call_id: &str) -> StoreResult<()>;
}
