#![forbid(unsafe_code)]

// In-memory call store. Backs the test suite and store-less deployments
// (DATABASE_URL unset), mirroring the optional-database posture of the rest
// of the stack.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::RwLock;

use super::{CallRecord, CallStatus, CallStore, StoreError, StoreResult};

#[derive(Debug, Clone)]
struct ParticipantRow {
    role: String,
    is_connected: bool,
    socket_id: Option<String>,
}

#[derive(Default)]
pub struct InMemoryCallStore {
    // room_id -> record; participants keyed by (call_id, user_id)
    calls: RwLock<HashMap<String, CallRecord>>,
    participants: RwLock<HashMap<(String, String), ParticipantRow>>,
}

impl InMemoryCallStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: number of participant rows recorded for a call.
    #[must_use]
    pub fn participant_rows(&self, call_id: &str) -> usize {
        self.participants
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .filter(|(c, _)| c == call_id)
            .count()
    }

    fn find_by_call_id(
        calls: &HashMap<String, CallRecord>,
        call_id: &str,
    ) -> Option<String> {
        calls
            .values()
            .find(|c| c.call_id == call_id)
            .map(|c| c.room_id.clone())
    }
}

#[async_trait]
impl CallStore for InMemoryCallStore {
    async fn create(&self, record: CallRecord) -> StoreResult<()> {
        let mut calls = self.calls.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = calls.get(&record.room_id) {
            // Room ids may be re-used once the previous call ended.
            if !existing.status.is_terminal() {
                return Err(StoreError::AlreadyExists(record.room_id));
            }
        }
        calls.insert(record.room_id.clone(), record);
        Ok(())
    }

    async fn get_by_room_id(&self, room_id: &str) -> StoreResult<CallRecord> {
        self.calls
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(room_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(room_id.to_string()))
    }

    async fn add_participant(&self, call_id: &str, user_id: &str, role: &str) -> StoreResult<()> {
        let mut participants = self.participants.write().unwrap_or_else(|e| e.into_inner());
        participants
            .entry((call_id.to_string(), user_id.to_string()))
            .or_insert(ParticipantRow {
                role: role.to_string(),
                is_connected: false,
                socket_id: None,
            })
            .role = role.to_string();
        Ok(())
    }

    async fn update_participant_status(
        &self,
        call_id: &str,
        user_id: &str,
        is_connected: bool,
        socket_id: Option<&str>,
    ) -> StoreResult<()> {
        let mut participants = self.participants.write().unwrap_or_else(|e| e.into_inner());
        let row = participants
            .entry((call_id.to_string(), user_id.to_string()))
            .or_insert(ParticipantRow {
                role: "participant".to_string(),
                is_connected: false,
                socket_id: None,
            });
        row.is_connected = is_connected;
        row.socket_id = socket_id.map(str::to_string);
        Ok(())
    }

    async fn start(&self, call_id: &str) -> StoreResult<()> {
        let mut calls = self.calls.write().unwrap_or_else(|e| e.into_inner());
        let room_id = Self::find_by_call_id(&calls, call_id)
            .ok_or_else(|| StoreError::NotFound(call_id.to_string()))?;
        let record = calls.get_mut(&room_id).expect("looked up above");
        if record.status == CallStatus::Waiting {
            record.status = CallStatus::Live;
            record.started_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn end(&self, call_id: &str) -> StoreResult<()> {
        let mut calls = self.calls.write().unwrap_or_else(|e| e.into_inner());
        let room_id = Self::find_by_call_id(&calls, call_id)
            .ok_or_else(|| StoreError::NotFound(call_id.to_string()))?;
        let record = calls.get_mut(&room_id).expect("looked up above");
        if record.status != CallStatus::Ended {
            record.status = CallStatus::Ended;
            record.ended_at = Some(Utc::now());
        }
        Ok(())
    }
}
