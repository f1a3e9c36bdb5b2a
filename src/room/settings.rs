#![forbid(unsafe_code)]

// Room settings snapshot handed to joining clients. Derived from the durable
// call record; the passcode itself never leaves the server.

use serde::{Deserialize, Serialize};

use crate::store::{CallKind, CallRecord};

pub const DEFAULT_MAX_PARTICIPANTS: u32 = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSettings {
    pub name: String,
    pub is_private: bool,
    pub max_participants: u32,
    pub passcode_required: bool,
}

impl RoomSettings {
    #[must_use]
    pub fn from_record(record: &CallRecord) -> Self {
        Self {
            name: record.name.clone(),
            is_private: record.kind == CallKind::InvitedOnly,
            max_participants: record.max_participants,
            passcode_required: record.passcode.is_some(),
        }
    }
}
