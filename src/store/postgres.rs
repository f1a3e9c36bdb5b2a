#![forbid(unsafe_code)]

// Postgres adapter for the call store. Queries are runtime-bound so the crate
// builds without a database; the schema is owned and migrated by the API
// service.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

use super::{CallKind, CallRecord, CallStatus, CallStore, StoreError, StoreResult};

pub struct PgCallStore {
    pool: PgPool,
}

impl PgCallStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .acquire_timeout(Duration::from_secs(3))
            .connect(url)
            .await?;
        info!("Connected to PostgreSQL call store");
        Ok(Self::new(pool))
    }
}

fn status_to_db(status: CallStatus) -> i16 {
    match status {
        CallStatus::Waiting => 1,
        CallStatus::Live => 2,
        CallStatus::Ended => 3,
    }
}

fn status_from_db(value: i16) -> CallStatus {
    match value {
        2 => CallStatus::Live,
        3 => CallStatus::Ended,
        _ => CallStatus::Waiting,
    }
}

fn kind_to_db(kind: CallKind) -> &'static str {
    match kind {
        CallKind::Open => "open",
        CallKind::InvitedOnly => "invited_only",
    }
}

fn kind_from_db(value: &str) -> CallKind {
    match value {
        "invited_only" => CallKind::InvitedOnly,
        _ => CallKind::Open,
    }
}

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

type CallRow = (
    String,                // id
    String,                // room_id
    String,                // name
    String,                // host_user_id
    Option<String>,        // passcode
    String,                // kind
    Vec<String>,           // invited
    i32,                   // max_participants
    i16,                   // status
    DateTime<Utc>,         // created_at
    Option<DateTime<Utc>>, // started_at
    Option<DateTime<Utc>>, // ended_at
);

#[async_trait]
impl CallStore for PgCallStore {
    async fn create(&self, record: CallRecord) -> StoreResult<()> {
        let live_exists = sqlx::query_as::<_, (i64,)>(
            "SELECT count(*) FROM calls WHERE room_id = $1 AND status <> 3",
        )
        .bind(&record.room_id)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;

        if live_exists.0 > 0 {
            return Err(StoreError::AlreadyExists(record.room_id));
        }

        sqlx::query(
            "INSERT INTO calls (id, room_id, name, host_user_id, passcode, kind, invited,
                                max_participants, status, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(&record.call_id)
        .bind(&record.room_id)
        .bind(&record.name)
        .bind(&record.host_user_id)
        .bind(&record.passcode)
        .bind(kind_to_db(record.kind))
        .bind(&record.invited)
        .bind(record.max_participants as i32)
        .bind(status_to_db(record.status))
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(())
    }

    async fn get_by_room_id(&self, room_id: &str) -> StoreResult<CallRecord> {
        let row = sqlx::query_as::<_, CallRow>(
            "SELECT id, room_id, name, host_user_id, passcode, kind, invited,
                    max_participants, status, created_at, started_at, ended_at
             FROM calls WHERE room_id = $1
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(room_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?
        .ok_or_else(|| StoreError::NotFound(room_id.to_string()))?;

        Ok(CallRecord {
            call_id: row.0,
            room_id: row.1,
            name: row.2,
            host_user_id: row.3,
            passcode: row.4,
            kind: kind_from_db(&row.5),
            invited: row.6,
            max_participants: row.7.max(0) as u32,
            status: status_from_db(row.8),
            created_at: row.9,
            started_at: row.10,
            ended_at: row.11,
        })
    }

    async fn add_participant(&self, call_id: &str, user_id: &str, role: &str) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO call_participants (call_id, user_id, role, joined_at)
             VALUES ($1, $2, $3, now())
             ON CONFLICT (call_id, user_id) DO UPDATE SET role = $3",
        )
        .bind(call_id)
        .bind(user_id)
        .bind(role)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn update_participant_status(
        &self,
        call_id: &str,
        user_id: &str,
        is_connected: bool,
        socket_id: Option<&str>,
    ) -> StoreResult<()> {
        sqlx::query(
            "UPDATE call_participants
             SET is_connected = $3,
                 socket_id = $4,
                 left_at = CASE WHEN $3 THEN NULL ELSE now() END
             WHERE call_id = $1 AND user_id = $2",
        )
        .bind(call_id)
        .bind(user_id)
        .bind(is_connected)
        .bind(socket_id)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn start(&self, call_id: &str) -> StoreResult<()> {
        sqlx::query("UPDATE calls SET status = 2, started_at = now() WHERE id = $1 AND status = 1")
            .bind(call_id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn end(&self, call_id: &str) -> StoreResult<()> {
        sqlx::query("UPDATE calls SET status = 3, ended_at = now() WHERE id = $1 AND status <> 3")
            .bind(call_id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }
}
