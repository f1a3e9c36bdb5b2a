#![forbid(unsafe_code)]

// Room registry — the single source of truth for live session state. All
// room mutations funnel through here.
//
// Locking: the outer rooms map sits under a std RwLock held only for
// lookups and inserts, never across an await. Each room has its own tokio
// Mutex, so one room's traffic never blocks another's. Store calls happen
// outside room locks; their failures are logged and swallowed because the
// in-memory state stays authoritative.

pub mod participant;
pub mod settings;

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::sync::mpsc;
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::UserSnapshot;
use crate::error::{SessionError, SessionResult};
use crate::media::MediaSession;
use crate::metrics::ServerMetrics;
use crate::signaling::protocol::{ParticipantInfo, RoomStatsInfo, ServerEvent};
use crate::store::{CallKind, CallRecord, CallStatus, CallStore, StoreError};

use participant::{MediaStateUpdate, Participant, ParticipantRole};
use settings::{RoomSettings, DEFAULT_MAX_PARTICIPANTS};

/// How long a disconnected participant survives before removal.
pub const DEFAULT_REAP_GRACE: Duration = Duration::from_secs(30);
/// Cadence of the defense-in-depth room sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(120);
/// Rooms with nobody connected for this long are swept.
pub const SWEEP_EMPTY_AFTER: Duration = Duration::from_secs(300);

const MAX_ROOM_ID_LEN: usize = 128;
const MAX_ROOM_NAME_LEN: usize = 128;
const MAX_CHAT_LEN: usize = 4096;

fn passcode_matches(expected: &str, provided: &str) -> bool {
    expected.as_bytes().ct_eq(provided.as_bytes()).into()
}

/// Mesh signaling message to relay to one peer.
#[derive(Debug, Clone)]
pub enum Signal {
    Offer { to: String, payload: serde_json::Value },
    Answer { to: String, payload: serde_json::Value },
    IceCandidate { to: String, payload: serde_json::Value },
}

/// What a joining client gets back.
#[derive(Debug)]
pub struct JoinOutcome {
    pub room_id: String,
    pub peer_id: String,
    pub user: UserSnapshot,
    /// The other participants, never including the joiner.
    pub participants: Vec<ParticipantInfo>,
    pub settings: RoomSettings,
    pub is_host: bool,
}

#[derive(Clone)]
struct SocketBinding {
    room_id: String,
    peer_id: String,
}

struct Room {
    room_id: String,
    call_id: String,
    host_user_id: String,
    settings: RoomSettings,
    status: CallStatus,
    participants: HashMap<String, Participant>,
    created_at: DateTime<Utc>,
}

impl Room {
    fn from_record(record: &CallRecord) -> Self {
        Self {
            room_id: record.room_id.clone(),
            call_id: record.call_id.clone(),
            host_user_id: record.host_user_id.clone(),
            settings: RoomSettings::from_record(record),
            status: record.status,
            participants: HashMap::new(),
            created_at: record.created_at,
        }
    }

    fn connected_count(&self) -> usize {
        self.participants.values().filter(|p| p.is_connected).count()
    }

    fn peer_id_of_user(&self, user_id: &str) -> Option<String> {
        self.participants
            .values()
            .find(|p| p.user.id == user_id)
            .map(|p| p.peer_id.clone())
    }

    fn info_of(p: &Participant) -> ParticipantInfo {
        ParticipantInfo {
            peer_id: p.peer_id.clone(),
            user_id: p.user.id.clone(),
            user: p.user.clone(),
            role: p.role,
            joined_at: p.joined_at,
            left_at: p.left_at,
            is_connected: p.is_connected,
            media_state: p.media_state,
        }
    }

    /// Push to every connected participant except `except`.
    fn broadcast_except(&self, except: &str, event: &ServerEvent) {
        let json = match serde_json::to_string(event) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!(room_id = %self.room_id, "failed to serialize broadcast: {e}");
                return;
            }
        };
        for (peer_id, p) in &self.participants {
            if peer_id != except && p.is_connected {
                let _ = p.sender.try_send(Arc::clone(&json));
            }
        }
    }

    fn broadcast_all(&self, event: &ServerEvent) {
        let json = match serde_json::to_string(event) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!(room_id = %self.room_id, "failed to serialize broadcast: {e}");
                return;
            }
        };
        for p in self.participants.values() {
            if p.is_connected {
                let _ = p.sender.try_send(Arc::clone(&json));
            }
        }
    }

    fn stats(&self) -> RoomStatsInfo {
        RoomStatsInfo {
            room_id: self.room_id.clone(),
            name: self.settings.name.clone(),
            status: self.status,
            created_at: self.created_at,
            participant_count: self.participants.len(),
            connected_count: self.connected_count(),
            sfu: None,
        }
    }
}

pub struct RoomRegistry {
    rooms: StdRwLock<HashMap<String, Arc<TokioMutex<Room>>>>,
    sockets: StdRwLock<HashMap<String, SocketBinding>>,
    store: Arc<dyn CallStore>,
    media: Arc<MediaSession>,
    metrics: ServerMetrics,
    grace: Duration,
}

impl RoomRegistry {
    #[must_use]
    pub fn new(
        store: Arc<dyn CallStore>,
        media: Arc<MediaSession>,
        metrics: ServerMetrics,
    ) -> Arc<Self> {
        Self::with_grace(store, media, metrics, DEFAULT_REAP_GRACE)
    }

    #[must_use]
    pub fn with_grace(
        store: Arc<dyn CallStore>,
        media: Arc<MediaSession>,
        metrics: ServerMetrics,
        grace: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            rooms: StdRwLock::new(HashMap::new()),
            sockets: StdRwLock::new(HashMap::new()),
            store,
            media,
            metrics,
            grace,
        })
    }

    /// O(1) socket-to-room lookup. A missing entry means "not in a room".
    #[must_use]
    pub fn binding_of(&self, socket_id: &str) -> Option<(String, String)> {
        self.sockets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(socket_id)
            .map(|b| (b.room_id.clone(), b.peer_id.clone()))
    }

    fn bind_socket(&self, socket_id: &str, room_id: &str, peer_id: &str) {
        self.sockets.write().unwrap_or_else(|e| e.into_inner()).insert(
            socket_id.to_string(),
            SocketBinding {
                room_id: room_id.to_string(),
                peer_id: peer_id.to_string(),
            },
        );
    }

    fn unbind_socket(&self, socket_id: &str) -> Option<SocketBinding> {
        self.sockets
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(socket_id)
    }

    fn get_room(&self, room_id: &str) -> Option<Arc<TokioMutex<Room>>> {
        self.rooms
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(room_id)
            .cloned()
    }

    /// Create a call record through the store and hand back the settings the
    /// creator will see. The in-memory room appears lazily on first join.
    pub async fn create_room(
        &self,
        user: &UserSnapshot,
        name: &str,
        is_private: bool,
        max_participants: Option<u32>,
        custom_id: Option<String>,
    ) -> SessionResult<(String, RoomSettings)> {
        if user.is_guest() {
            return Err(SessionError::HostRequired);
        }
        if name.is_empty() || name.len() > MAX_ROOM_NAME_LEN {
            return Err(SessionError::InvalidRequest(format!(
                "room name must be 1-{MAX_ROOM_NAME_LEN} characters"
            )));
        }

        let room_id = match custom_id {
            Some(id) => {
                if id.is_empty()
                    || id.len() > MAX_ROOM_ID_LEN
                    || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
                {
                    return Err(SessionError::InvalidRequest(
                        "room id must be 1-128 alphanumeric characters".to_string(),
                    ));
                }
                id
            }
            None => Uuid::new_v4().simple().to_string().chars().take(12).collect(),
        };

        let record = CallRecord {
            call_id: Uuid::new_v4().to_string(),
            room_id: room_id.clone(),
            name: name.to_string(),
            host_user_id: user.id.clone(),
            passcode: None,
            kind: if is_private {
                CallKind::InvitedOnly
            } else {
                CallKind::Open
            },
            invited: vec![],
            max_participants: max_participants.unwrap_or(DEFAULT_MAX_PARTICIPANTS).max(1),
            status: CallStatus::Waiting,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        };
        let settings = RoomSettings::from_record(&record);

        match self.store.create(record).await {
            Ok(()) => {}
            Err(StoreError::AlreadyExists(id)) => {
                return Err(SessionError::InvalidRequest(format!(
                    "room id already in use: {id}"
                )));
            }
            Err(e) => return Err(SessionError::internal(e)),
        }

        self.metrics.inc_rooms_created();
        info!(%room_id, host = %user.id, "room created");
        Ok((room_id, settings))
    }

    /// Join a room, lazily materializing it from the call record. Reconnecting
    /// users are rebound to their existing participant (same peer id).
    pub async fn join(
        self: &Arc<Self>,
        socket_id: &str,
        user: &UserSnapshot,
        sender: mpsc::Sender<Arc<String>>,
        room_id: &str,
        passcode: Option<&str>,
    ) -> SessionResult<JoinOutcome> {
        // Store read happens before any lock. The record drives validation.
        let record = match self.store.get_by_room_id(room_id).await {
            Ok(record) => record,
            Err(StoreError::NotFound(_)) => {
                return Err(SessionError::RoomNotFound(room_id.to_string()))
            }
            Err(e) => return Err(SessionError::internal(e)),
        };

        if record.status.is_terminal() {
            return Err(SessionError::Ended);
        }
        if let Some(expected) = record.passcode.as_deref() {
            if !passcode.is_some_and(|p| passcode_matches(expected, p)) {
                return Err(SessionError::InvalidPasscode);
            }
        }
        if record.kind == CallKind::InvitedOnly && !record.is_invited(&user.id) {
            return Err(SessionError::NotInvited);
        }

        // Materialize the room, then commit membership under its lock.
        let room_lock = {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            Arc::clone(
                rooms
                    .entry(room_id.to_string())
                    .or_insert_with(|| Arc::new(TokioMutex::new(Room::from_record(&record)))),
            )
        };

        let (outcome, was_waiting, role) = {
            let mut room = room_lock.lock().await;

            if room.status.is_terminal() {
                return Err(SessionError::Ended);
            }

            let peer_id = match room.peer_id_of_user(&user.id) {
                Some(peer_id) => {
                    // Rebind: new socket, same participant, same peer id.
                    let p = room
                        .participants
                        .get_mut(&peer_id)
                        .expect("peer id resolved above");
                    self.unbind_socket(&p.socket_id);
                    p.rebind(socket_id.to_string(), sender);
                    debug!(room_id, %peer_id, user_id = %user.id, "participant rebound");
                    peer_id
                }
                None => {
                    // Two joins racing for the last slot are serialized by
                    // this mutex; the loser sees the room full.
                    if room.connected_count() >= room.settings.max_participants as usize {
                        return Err(SessionError::RoomFull);
                    }
                    let role = if user.id == room.host_user_id {
                        ParticipantRole::Host
                    } else if user.is_guest() {
                        ParticipantRole::Guest
                    } else {
                        ParticipantRole::Participant
                    };
                    let p = Participant::new(user.clone(), socket_id.to_string(), role, sender);
                    let peer_id = p.peer_id.clone();
                    room.participants.insert(peer_id.clone(), p);
                    peer_id
                }
            };
            self.bind_socket(socket_id, room_id, &peer_id);

            let was_waiting = room.status == CallStatus::Waiting;
            if was_waiting {
                room.status = CallStatus::Live;
            }

            let me = &room.participants[&peer_id];
            let my_info = Room::info_of(me);
            let role = me.role;
            let others: Vec<ParticipantInfo> = room
                .participants
                .values()
                .filter(|p| p.peer_id != peer_id)
                .map(Room::info_of)
                .collect();

            room.broadcast_except(
                &peer_id,
                &ServerEvent::RoomUserJoined {
                    user: user.clone(),
                    participant: my_info,
                },
            );

            (
                JoinOutcome {
                    room_id: room_id.to_string(),
                    peer_id,
                    user: user.clone(),
                    participants: others,
                    settings: room.settings.clone(),
                    is_host: user.id == room.host_user_id,
                },
                was_waiting,
                role,
            )
        };

        // Durable bookkeeping outside the lock. Guests never touch the store;
        // failures are logged and the session carries on.
        if was_waiting {
            if let Err(e) = self.store.start(&record.call_id).await {
                warn!(room_id, "failed to record call start: {e}");
            }
        }
        if !user.is_guest() {
            if let Err(e) = self
                .store
                .add_participant(&record.call_id, &user.id, role.as_str())
                .await
            {
                warn!(room_id, user_id = %user.id, "failed to record participant: {e}");
            }
            if let Err(e) = self
                .store
                .update_participant_status(&record.call_id, &user.id, true, Some(socket_id))
                .await
            {
                warn!(room_id, user_id = %user.id, "failed to record connect: {e}");
            }
        }

        self.metrics.inc_joins();
        info!(room_id, peer_id = %outcome.peer_id, user_id = %user.id, "participant joined");
        Ok(outcome)
    }

    /// Mark the socket's participant disconnected and schedule their reap.
    /// Idempotent: unknown sockets and repeated leaves are no-ops.
    pub async fn leave(self: &Arc<Self>, socket_id: &str) {
        let Some(binding) = self.unbind_socket(socket_id) else {
            return;
        };
        let Some(room_lock) = self.get_room(&binding.room_id) else {
            return;
        };

        let store_update = {
            let mut room = room_lock.lock().await;
            let Some(p) = room.participants.get_mut(&binding.peer_id) else {
                return;
            };
            if !p.is_connected {
                return;
            }
            p.mark_disconnected();

            let info = Room::info_of(p);
            let user = p.user.clone();
            room.broadcast_except(
                &binding.peer_id,
                &ServerEvent::RoomUserLeft {
                    user_id: user.id.clone(),
                    participant: info,
                },
            );
            (room.call_id.clone(), user)
        };

        self.schedule_reap(binding.room_id.clone(), binding.peer_id.clone());

        let (call_id, user) = store_update;
        if !user.is_guest() {
            if let Err(e) = self
                .store
                .update_participant_status(&call_id, &user.id, false, None)
                .await
            {
                warn!(room_id = %binding.room_id, "failed to record disconnect: {e}");
            }
        }

        self.metrics.inc_leaves();
        info!(room_id = %binding.room_id, peer_id = %binding.peer_id, "participant left");
    }

    /// Transport-close path; same semantics as an explicit leave.
    pub async fn handle_disconnect(self: &Arc<Self>, socket_id: &str) {
        self.leave(socket_id).await;
    }

    /// Apply a partial media-state update and fan the result out.
    pub async fn update_media_state(
        &self,
        socket_id: &str,
        update: MediaStateUpdate,
    ) -> SessionResult<()> {
        let (room_id, peer_id) = self.binding_of(socket_id).ok_or(SessionError::NotInRoom)?;
        let room_lock = self
            .get_room(&room_id)
            .ok_or_else(|| SessionError::RoomNotFound(room_id.clone()))?;

        let mut room = room_lock.lock().await;
        let p = room
            .participants
            .get_mut(&peer_id)
            .ok_or(SessionError::NotInRoom)?;
        p.media_state.apply(update);

        let event = ServerEvent::MediaStateChanged {
            user_id: p.user.id.clone(),
            peer_id: peer_id.clone(),
            media_state: p.media_state,
        };
        room.broadcast_except(&peer_id, &event);
        Ok(())
    }

    /// Host-only: end the call for everyone, tear down SFU state, delete the
    /// room, and record the end durably.
    pub async fn end_call(&self, socket_id: &str, room_id: &str) -> SessionResult<()> {
        let (bound_room, peer_id) = self.binding_of(socket_id).ok_or(SessionError::NotInRoom)?;
        if bound_room != room_id {
            return Err(SessionError::RoomNotFound(room_id.to_string()));
        }
        let room_lock = self
            .get_room(room_id)
            .ok_or_else(|| SessionError::RoomNotFound(room_id.to_string()))?;

        let call_id = {
            let mut room = room_lock.lock().await;
            let caller = room
                .participants
                .get(&peer_id)
                .ok_or(SessionError::NotInRoom)?;
            if caller.user.id != room.host_user_id {
                return Err(SessionError::HostRequired);
            }

            room.broadcast_all(&ServerEvent::RoomCallEnded {
                room_id: room_id.to_string(),
                reason: "Host ended the call".to_string(),
            });

            room.status = CallStatus::Ended;
            let socket_ids: Vec<String> = room
                .participants
                .values()
                .map(|p| p.socket_id.clone())
                .collect();
            room.participants.clear();

            for sid in socket_ids {
                self.unbind_socket(&sid);
            }
            room.call_id.clone()
        };

        {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            rooms.remove(room_id);
        }

        self.media.close_room(room_id).await;
        if let Err(e) = self.store.end(&call_id).await {
            warn!(room_id, "failed to record call end: {e}");
        }

        info!(room_id, "call ended by host");
        Ok(())
    }

    /// Relay a mesh signaling message to one peer in the caller's room. The
    /// outbound `from` is always the caller's server-bound peer id. Missing
    /// targets are a soft error, except ICE candidates which race with
    /// connect/disconnect and are dropped silently.
    pub async fn forward_signal(&self, socket_id: &str, signal: Signal) -> SessionResult<()> {
        let is_ice = matches!(signal, Signal::IceCandidate { .. });
        let Some((room_id, peer_id)) = self.binding_of(socket_id) else {
            return if is_ice {
                Ok(())
            } else {
                Err(SessionError::NotInRoom)
            };
        };
        let room_lock = self
            .get_room(&room_id)
            .ok_or_else(|| SessionError::RoomNotFound(room_id.clone()))?;

        let room = room_lock.lock().await;
        let sender_user = room
            .participants
            .get(&peer_id)
            .map(|p| p.user.clone())
            .ok_or(SessionError::NotInRoom)?;

        let (to, event) = match signal {
            Signal::Offer { to, payload } => (
                to.clone(),
                ServerEvent::WebrtcOffer {
                    from: peer_id.clone(),
                    to,
                    offer: payload,
                    user: Some(sender_user),
                },
            ),
            Signal::Answer { to, payload } => (
                to.clone(),
                ServerEvent::WebrtcAnswer {
                    from: peer_id.clone(),
                    to,
                    answer: payload,
                    user: Some(sender_user),
                },
            ),
            Signal::IceCandidate { to, payload } => (
                to.clone(),
                ServerEvent::WebrtcIceCandidate {
                    from: peer_id.clone(),
                    to,
                    candidate: payload,
                },
            ),
        };

        let target = room.participants.get(&to).filter(|p| p.is_connected);
        match target {
            Some(p) => {
                let json = serde_json::to_string(&event).map_err(SessionError::internal)?;
                let _ = p.sender.try_send(Arc::new(json));
                self.metrics.inc_signals_relayed();
                Ok(())
            }
            None if is_ice => Ok(()),
            None => Err(SessionError::PeerUnreachable(to)),
        }
    }

    /// Room chat. Broadcast to everyone else, or to a single peer when `to`
    /// is set. The message id, timestamp, and sender identity are stamped
    /// server-side.
    pub async fn send_chat(
        &self,
        socket_id: &str,
        message: &str,
        to: Option<&str>,
    ) -> SessionResult<()> {
        if message.is_empty() || message.len() > MAX_CHAT_LEN {
            return Err(SessionError::InvalidRequest(format!(
                "chat message must be 1-{MAX_CHAT_LEN} bytes"
            )));
        }
        let (room_id, peer_id) = self.binding_of(socket_id).ok_or(SessionError::NotInRoom)?;
        let room_lock = self
            .get_room(&room_id)
            .ok_or_else(|| SessionError::RoomNotFound(room_id.clone()))?;

        let room = room_lock.lock().await;
        let sender_user = room
            .participants
            .get(&peer_id)
            .map(|p| p.user.clone())
            .ok_or(SessionError::NotInRoom)?;

        let event = ServerEvent::ChatMessage {
            id: Uuid::new_v4().to_string(),
            room_id: room_id.clone(),
            from: peer_id.clone(),
            user: sender_user,
            message: message.to_string(),
            to: to.map(str::to_string),
            timestamp: Utc::now(),
        };

        match to {
            Some(target_peer) => {
                let target = room
                    .participants
                    .get(target_peer)
                    .filter(|p| p.is_connected)
                    .ok_or_else(|| SessionError::PeerUnreachable(target_peer.to_string()))?;
                let json = serde_json::to_string(&event).map_err(SessionError::internal)?;
                let _ = target.sender.try_send(Arc::new(json));
            }
            None => room.broadcast_except(&peer_id, &event),
        }

        self.metrics.inc_chat_messages();
        Ok(())
    }

    pub async fn send_typing(&self, socket_id: &str, is_typing: bool) -> SessionResult<()> {
        let (room_id, peer_id) = self.binding_of(socket_id).ok_or(SessionError::NotInRoom)?;
        let room_lock = self
            .get_room(&room_id)
            .ok_or_else(|| SessionError::RoomNotFound(room_id.clone()))?;

        let room = room_lock.lock().await;
        let user_id = room
            .participants
            .get(&peer_id)
            .map(|p| p.user.id.clone())
            .ok_or(SessionError::NotInRoom)?;
        room.broadcast_except(
            &peer_id,
            &ServerEvent::ChatTyping {
                peer_id: peer_id.clone(),
                user_id,
                is_typing,
            },
        );
        Ok(())
    }

    pub async fn room_stats(&self, room_id: &str) -> Option<RoomStatsInfo> {
        let room_lock = self.get_room(room_id)?;
        let room = room_lock.lock().await;
        Some(room.stats())
    }

    pub async fn all_rooms(&self) -> Vec<RoomStatsInfo> {
        let room_locks: Vec<Arc<TokioMutex<Room>>> = {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            rooms.values().cloned().collect()
        };
        let mut out = Vec::with_capacity(room_locks.len());
        for room_lock in room_locks {
            let room = room_lock.lock().await;
            out.push(room.stats());
        }
        out
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub async fn participant_count(&self) -> usize {
        let room_locks: Vec<Arc<TokioMutex<Room>>> = {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            rooms.values().cloned().collect()
        };
        let mut total = 0;
        for room_lock in room_locks {
            total += room_lock.lock().await.connected_count();
        }
        total
    }

    fn schedule_reap(self: &Arc<Self>, room_id: String, peer_id: String) {
        let registry = Arc::clone(self);
        let grace = self.grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            registry.reap_participant(&room_id, &peer_id).await;
        });
    }

    /// Remove the participant if they are still disconnected and their whole
    /// grace period has elapsed (a reconnect-then-disconnect restarts it).
    async fn reap_participant(self: &Arc<Self>, room_id: &str, peer_id: &str) {
        let Some(room_lock) = self.get_room(room_id) else {
            return;
        };

        let emptied = {
            let mut room = room_lock.lock().await;
            let Some(p) = room.participants.get(peer_id) else {
                return;
            };
            if p.is_connected {
                return;
            }
            match p.disconnected_at {
                Some(at) if at.elapsed() >= self.grace => {}
                _ => return, // a newer disconnect owns the reap
            }
            room.participants.remove(peer_id);
            debug!(room_id, peer_id, "participant reaped");
            room.participants.is_empty().then(|| room.call_id.clone())
        };

        // The participant is gone for good; release their SFU state too.
        if let Err(e) = self.media.leave(room_id, peer_id).await {
            warn!(room_id, peer_id, "failed to release sfu state: {e}");
        }

        if let Some(call_id) = emptied {
            self.delete_room_if_empty(room_id, &call_id).await;
        }
    }

    /// Remove an empty room. Rechecks emptiness under the outer write lock so
    /// a racing join wins.
    async fn delete_room_if_empty(&self, room_id: &str, call_id: &str) {
        let removed = {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            match rooms.get(room_id) {
                Some(room_lock) => {
                    let empty = room_lock
                        .try_lock()
                        .map(|room| room.participants.is_empty())
                        .unwrap_or(false);
                    if empty {
                        rooms.remove(room_id);
                    }
                    empty
                }
                None => false,
            }
        };

        if removed {
            self.media.close_room(room_id).await;
            if let Err(e) = self.store.end(call_id).await {
                warn!(room_id, "failed to record call end: {e}");
            }
            info!(room_id, "room removed after reap");
        }
    }

    /// Defense-in-depth sweep: every two minutes, remove rooms where nobody
    /// has been connected for over five minutes.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                registry.sweep_once().await;
            }
        })
    }

    async fn sweep_once(self: &Arc<Self>) {
        let candidates: Vec<(String, Arc<TokioMutex<Room>>)> = {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            rooms
                .iter()
                .map(|(id, lock)| (id.clone(), Arc::clone(lock)))
                .collect()
        };

        for (room_id, room_lock) in candidates {
            let stale_call_id = {
                let Ok(room) = room_lock.try_lock() else {
                    continue; // busy room, not stale
                };
                let stale = room.participants.is_empty()
                    || room.participants.values().all(|p| {
                        !p.is_connected
                            && p.disconnected_at
                                .is_some_and(|at| at.elapsed() >= SWEEP_EMPTY_AFTER)
                    });
                stale.then(|| room.call_id.clone())
            };

            if let Some(call_id) = stale_call_id {
                // Evict whatever is left, then remove.
                {
                    let mut room = room_lock.lock().await;
                    for p in room.participants.values() {
                        self.unbind_socket(&p.socket_id);
                    }
                    room.participants.clear();
                }
                self.delete_room_if_empty(&room_id, &call_id).await;
                warn!(%room_id, "room removed by sweep");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::config::MediaConfig;
    use crate::media::embedded::EmbeddedMediaWorker;
    use crate::store::memory::InMemoryCallStore;

    fn user(id: &str, name: &str) -> UserSnapshot {
        UserSnapshot {
            id: id.to_string(),
            display_name: name.to_string(),
            email: None,
            avatar_url: None,
        }
    }

    fn guest(name: &str) -> UserSnapshot {
        user(&format!("guest:{name}"), name)
    }

    struct Harness {
        registry: Arc<RoomRegistry>,
        store: Arc<InMemoryCallStore>,
        media: Arc<MediaSession>,
    }

    fn harness_with_grace(grace: Duration) -> Harness {
        let store = Arc::new(InMemoryCallStore::new());
        let worker = EmbeddedMediaWorker::new(MediaConfig::default());
        let media = MediaSession::new(worker, ServerMetrics::new());
        let registry = RoomRegistry::with_grace(
            Arc::clone(&store) as Arc<dyn CallStore>,
            Arc::clone(&media),
            ServerMetrics::new(),
            grace,
        );
        Harness {
            registry,
            store,
            media,
        }
    }

    fn harness() -> Harness {
        harness_with_grace(DEFAULT_REAP_GRACE)
    }

    async fn seed_room(h: &Harness, room_id: &str, passcode: Option<&str>) -> String {
        let record = CallRecord {
            call_id: format!("call-{room_id}"),
            room_id: room_id.to_string(),
            name: "Demo".to_string(),
            host_user_id: "u_host".to_string(),
            passcode: passcode.map(str::to_string),
            kind: CallKind::Open,
            invited: vec![],
            max_participants: 4,
            status: CallStatus::Waiting,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        };
        h.store.create(record).await.unwrap();
        format!("call-{room_id}")
    }

    fn socket() -> (mpsc::Sender<Arc<String>>, mpsc::Receiver<Arc<String>>) {
        mpsc::channel(64)
    }

    fn drain(rx: &mut mpsc::Receiver<Arc<String>>) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Ok(json) = rx.try_recv() {
            out.push(serde_json::from_str(&json).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn join_unknown_room_fails() {
        let h = harness();
        let (tx, _rx) = socket();
        let err = h
            .registry
            .join("s1", &user("u_1", "Ann"), tx, "nope", None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "RoomNotFound");
    }

    #[tokio::test]
    async fn passcode_is_enforced() {
        let h = harness();
        seed_room(&h, "R2", Some("1234")).await;

        let (tx, _rx) = socket();
        let err = h
            .registry
            .join("s1", &user("u_1", "Ann"), tx.clone(), "R2", Some("0000"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "InvalidPasscode");

        let err = h
            .registry
            .join("s1", &user("u_1", "Ann"), tx.clone(), "R2", None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "InvalidPasscode");

        h.registry
            .join("s1", &user("u_1", "Ann"), tx, "R2", Some("1234"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn passcode_comparison_is_correct_across_prefix_lengths() {
        // Correctness companion to the constant-time guarantee: equal strings
        // match, any shared-prefix length short of equality does not.
        assert!(passcode_matches("secret-passcode", "secret-passcode"));
        for bad in ["", "s", "secret", "secret-passcodX", "secret-passcode-long"] {
            assert!(!passcode_matches("secret-passcode", bad));
        }
    }

    #[tokio::test]
    async fn room_full_rejects_new_users_but_not_rebinds() {
        let h = harness();
        seed_room(&h, "R1", None).await;

        for i in 0..4 {
            let (tx, _rx) = socket();
            h.registry
                .join(&format!("s{i}"), &user(&format!("u_{i}"), "X"), tx, "R1", None)
                .await
                .unwrap();
        }

        let (tx, _rx) = socket();
        let err = h
            .registry
            .join("s9", &user("u_9", "Late"), tx, "R1", None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "RoomFull");

        // An existing user reconnecting is a rebind, not a new slot.
        let (tx, _rx) = socket();
        h.registry
            .join("s0-new", &user("u_0", "X"), tx, "R1", None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn rebind_keeps_peer_id_and_replaces_socket() {
        let h = harness();
        seed_room(&h, "R1", None).await;

        let (tx, _rx) = socket();
        let first = h
            .registry
            .join("s1", &user("u_1", "Ann"), tx, "R1", None)
            .await
            .unwrap();

        let (tx2, _rx2) = socket();
        let second = h
            .registry
            .join("s2", &user("u_1", "Ann"), tx2, "R1", None)
            .await
            .unwrap();

        assert_eq!(first.peer_id, second.peer_id);
        // The old socket no longer resolves; the new one does.
        assert!(h.registry.binding_of("s1").is_none());
        assert_eq!(
            h.registry.binding_of("s2").unwrap().1,
            second.peer_id
        );
        // Still a single participant for this (room, user) pair.
        let stats = h.registry.room_stats("R1").await.unwrap();
        assert_eq!(stats.participant_count, 1);
        assert_eq!(stats.connected_count, 1);
    }

    #[tokio::test]
    async fn join_broadcasts_to_others_but_not_self() {
        let h = harness();
        seed_room(&h, "R1", None).await;

        let (tx_host, mut rx_host) = socket();
        let outcome = h
            .registry
            .join("s-host", &user("u_host", "Host"), tx_host, "R1", None)
            .await
            .unwrap();
        assert!(outcome.is_host);
        assert!(outcome.participants.is_empty());

        let (tx_guest, mut rx_guest) = socket();
        let outcome = h
            .registry
            .join("s-guest", &guest("Alice"), tx_guest, "R1", None)
            .await
            .unwrap();
        assert!(!outcome.is_host);
        assert_eq!(outcome.participants.len(), 1);
        assert_eq!(outcome.participants[0].user_id, "u_host");

        let host_events = drain(&mut rx_host);
        let joined: Vec<_> = host_events
            .iter()
            .filter(|e| e["type"] == "room:user-joined")
            .collect();
        assert_eq!(joined.len(), 1);
        assert_eq!(joined[0]["user"]["displayName"], "Alice");

        // The joiner saw nothing about their own join.
        assert!(drain(&mut rx_guest).is_empty());
    }

    #[tokio::test]
    async fn guest_transitions_skip_the_store() {
        let h = harness();
        let call_id = seed_room(&h, "R1", None).await;

        let (tx, _rx) = socket();
        h.registry
            .join("s-h", &user("u_host", "Host"), tx, "R1", None)
            .await
            .unwrap();
        let (tx, _rx) = socket();
        h.registry
            .join("s-g", &guest("Alice"), tx, "R1", None)
            .await
            .unwrap();

        // Only the registered user produced a participant row.
        assert_eq!(h.store.participant_rows(&call_id), 1);
        // The room still went live.
        assert_eq!(
            h.store.get_by_room_id("R1").await.unwrap().status,
            CallStatus::Live
        );
    }

    #[tokio::test]
    async fn media_state_update_is_partial_and_broadcast() {
        let h = harness();
        seed_room(&h, "R1", None).await;

        let (tx1, _rx1) = socket();
        h.registry
            .join("s1", &user("u_1", "Ann"), tx1, "R1", None)
            .await
            .unwrap();
        let (tx2, mut rx2) = socket();
        h.registry
            .join("s2", &user("u_2", "Ben"), tx2, "R1", None)
            .await
            .unwrap();

        h.registry
            .update_media_state(
                "s1",
                MediaStateUpdate {
                    audio_enabled: Some(false),
                    video_enabled: None,
                    screen_share_enabled: Some(true),
                },
            )
            .await
            .unwrap();

        let events = drain(&mut rx2);
        let changed: Vec<_> = events
            .iter()
            .filter(|e| e["type"] == "participant:media-state-changed")
            .collect();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0]["userId"], "u_1");
        assert_eq!(changed[0]["mediaState"]["audio"], false);
        assert_eq!(changed[0]["mediaState"]["video"], true);
        assert_eq!(changed[0]["mediaState"]["screen"], true);
    }

    #[tokio::test]
    async fn relay_stamps_authoritative_from_and_targets_one_peer() {
        let h = harness();
        seed_room(&h, "R3", None).await;

        let (tx1, _rx1) = socket();
        let p1 = h
            .registry
            .join("s1", &user("u_1", "P1"), tx1, "R3", None)
            .await
            .unwrap();
        let (tx2, mut rx2) = socket();
        let p2 = h
            .registry
            .join("s2", &user("u_2", "P2"), tx2, "R3", None)
            .await
            .unwrap();
        let (tx3, mut rx3) = socket();
        h.registry
            .join("s3", &user("u_3", "P3"), tx3, "R3", None)
            .await
            .unwrap();
        drain(&mut rx2);
        drain(&mut rx3);

        h.registry
            .forward_signal(
                "s1",
                Signal::Offer {
                    to: p2.peer_id.clone(),
                    payload: serde_json::json!({"type": "offer", "sdp": "v=0..."}),
                },
            )
            .await
            .unwrap();

        let events = drain(&mut rx2);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "webrtc:offer");
        assert_eq!(events[0]["from"], p1.peer_id.as_str());
        assert_eq!(events[0]["to"], p2.peer_id.as_str());
        assert_eq!(events[0]["offer"]["sdp"], "v=0...");
        assert_eq!(events[0]["user"]["id"], "u_1");

        // Nobody else saw it.
        assert!(drain(&mut rx3).is_empty());
    }

    #[tokio::test]
    async fn offer_to_missing_peer_errors_but_ice_is_silent() {
        let h = harness();
        seed_room(&h, "R3", None).await;
        let (tx1, _rx1) = socket();
        h.registry
            .join("s1", &user("u_1", "P1"), tx1, "R3", None)
            .await
            .unwrap();

        let err = h
            .registry
            .forward_signal(
                "s1",
                Signal::Offer {
                    to: "peer_GHOST".into(),
                    payload: serde_json::json!({}),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "PeerUnreachable");

        h.registry
            .forward_signal(
                "s1",
                Signal::IceCandidate {
                    to: "peer_GHOST".into(),
                    payload: serde_json::json!({"candidate": "candidate:0"}),
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn chat_broadcasts_exclude_sender_and_direct_targets_one() {
        let h = harness();
        seed_room(&h, "R1", None).await;

        let (tx1, mut rx1) = socket();
        h.registry
            .join("s1", &user("u_1", "Ann"), tx1, "R1", None)
            .await
            .unwrap();
        let (tx2, mut rx2) = socket();
        let p2 = h
            .registry
            .join("s2", &user("u_2", "Ben"), tx2, "R1", None)
            .await
            .unwrap();
        let (tx3, mut rx3) = socket();
        h.registry
            .join("s3", &user("u_3", "Cat"), tx3, "R1", None)
            .await
            .unwrap();
        for rx in [&mut rx1, &mut rx2, &mut rx3] {
            drain(rx);
        }

        h.registry.send_chat("s1", "hello all", None).await.unwrap();
        assert!(drain(&mut rx1).is_empty());
        let to_b = drain(&mut rx2);
        assert_eq!(to_b.len(), 1);
        assert_eq!(to_b[0]["type"], "chat:message");
        assert_eq!(to_b[0]["message"], "hello all");
        assert!(to_b[0]["id"].is_string());
        assert!(to_b[0]["timestamp"].is_string());
        assert_eq!(drain(&mut rx3).len(), 1);

        // Direct message reaches only its target.
        h.registry
            .send_chat("s1", "psst", Some(&p2.peer_id))
            .await
            .unwrap();
        assert_eq!(drain(&mut rx2).len(), 1);
        assert!(drain(&mut rx3).is_empty());
    }

    #[tokio::test]
    async fn end_call_requires_host_and_notifies_everyone() {
        let h = harness();
        let call_id = seed_room(&h, "R4", None).await;

        let (tx_h, mut rx_h) = socket();
        h.registry
            .join("s-h", &user("u_host", "Host"), tx_h, "R4", None)
            .await
            .unwrap();
        let (tx_g, mut rx_g) = socket();
        h.registry
            .join("s-g", &user("u_2", "Ben"), tx_g, "R4", None)
            .await
            .unwrap();
        drain(&mut rx_h);
        drain(&mut rx_g);

        let err = h.registry.end_call("s-g", "R4").await.unwrap_err();
        assert_eq!(err.code(), "HostRequired");

        h.registry.end_call("s-h", "R4").await.unwrap();

        for rx in [&mut rx_h, &mut rx_g] {
            let events = drain(rx);
            let ended: Vec<_> = events
                .iter()
                .filter(|e| e["type"] == "room:call-ended")
                .collect();
            assert_eq!(ended.len(), 1);
            assert_eq!(ended[0]["reason"], "Host ended the call");
        }

        assert_eq!(h.registry.room_count(), 0);
        assert_eq!(
            h.store.get_by_room_id("R4").await.unwrap().status,
            CallStatus::Ended
        );
        assert!(h.store.get_by_room_id("R4").await.unwrap().ended_at.is_some());
        assert_eq!(h.store.participant_rows(&call_id), 2);

        // Joining again surfaces the terminal state.
        let (tx, _rx) = socket();
        let err = h
            .registry
            .join("s-x", &user("u_3", "Late"), tx, "R4", None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "Ended");
    }

    #[tokio::test(start_paused = true)]
    async fn reap_removes_participant_after_grace() {
        let h = harness();
        seed_room(&h, "R1", None).await;

        let (tx1, _rx1) = socket();
        h.registry
            .join("s1", &user("u_1", "Ann"), tx1, "R1", None)
            .await
            .unwrap();
        let (tx2, _rx2) = socket();
        h.registry
            .join("s2", &user("u_2", "Ben"), tx2, "R1", None)
            .await
            .unwrap();

        h.registry.handle_disconnect("s2").await;
        let stats = h.registry.room_stats("R1").await.unwrap();
        assert_eq!(stats.participant_count, 2);
        assert_eq!(stats.connected_count, 1);

        tokio::time::sleep(DEFAULT_REAP_GRACE + Duration::from_secs(1)).await;
        let stats = h.registry.room_stats("R1").await.unwrap();
        assert_eq!(stats.participant_count, 1);

        // Last one out removes the room and ends the call.
        h.registry.handle_disconnect("s1").await;
        tokio::time::sleep(DEFAULT_REAP_GRACE + Duration::from_secs(1)).await;
        assert_eq!(h.registry.room_count(), 0);
        assert_eq!(
            h.store.get_by_room_id("R1").await.unwrap().status,
            CallStatus::Ended
        );
        assert!(!h.media.has_room("R1"));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_within_grace_survives_with_same_peer_id() {
        let h = harness();
        seed_room(&h, "R1", None).await;

        let (tx, _rx) = socket();
        let first = h
            .registry
            .join("s1", &user("u_1", "Ann"), tx, "R1", None)
            .await
            .unwrap();

        h.registry.handle_disconnect("s1").await;
        tokio::time::sleep(Duration::from_secs(10)).await;

        let (tx2, _rx2) = socket();
        let second = h
            .registry
            .join("s2", &user("u_1", "Ann"), tx2, "R1", None)
            .await
            .unwrap();
        assert_eq!(first.peer_id, second.peer_id);

        // The original reap timer fires and must not remove the participant.
        tokio::time::sleep(Duration::from_secs(40)).await;
        let stats = h.registry.room_stats("R1").await.unwrap();
        assert_eq!(stats.participant_count, 1);
        assert_eq!(stats.connected_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn second_disconnect_restarts_the_grace_period() {
        let h = harness();
        seed_room(&h, "R1", None).await;

        let (tx, _rx) = socket();
        h.registry
            .join("s1", &user("u_1", "Ann"), tx, "R1", None)
            .await
            .unwrap();
        h.registry.handle_disconnect("s1").await;

        tokio::time::sleep(Duration::from_secs(10)).await;
        let (tx2, _rx2) = socket();
        h.registry
            .join("s2", &user("u_1", "Ann"), tx2, "R1", None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        h.registry.handle_disconnect("s2").await;

        // At t=40 the first timer has fired, but only 25s have passed since
        // the second disconnect: still present.
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(
            h.registry.room_stats("R1").await.unwrap().participant_count,
            1
        );

        // The second timer completes the removal.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.registry.room_count(), 0);
    }

    #[tokio::test]
    async fn leave_is_idempotent() {
        let h = harness();
        seed_room(&h, "R1", None).await;
        let (tx, _rx) = socket();
        h.registry
            .join("s1", &user("u_1", "Ann"), tx, "R1", None)
            .await
            .unwrap();

        h.registry.leave("s1").await;
        h.registry.leave("s1").await;
        h.registry.handle_disconnect("s1").await;
        let stats = h.registry.room_stats("R1").await.unwrap();
        assert_eq!(stats.connected_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_rooms_with_lost_timers() {
        let h = harness();
        seed_room(&h, "R1", None).await;
        let (tx, _rx) = socket();
        h.registry
            .join("s1", &user("u_1", "Ann"), tx, "R1", None)
            .await
            .unwrap();

        // Simulate a lost reap: mark disconnected without scheduling.
        {
            let room_lock = h.registry.get_room("R1").unwrap();
            let mut room = room_lock.lock().await;
            for p in room.participants.values_mut() {
                p.mark_disconnected();
            }
        }
        h.registry.unbind_socket("s1");

        tokio::time::sleep(SWEEP_EMPTY_AFTER + Duration::from_secs(1)).await;
        h.registry.sweep_once().await;
        assert_eq!(h.registry.room_count(), 0);
    }

    #[tokio::test]
    async fn membership_accounting_matches_connected_sockets() {
        let h = harness();
        seed_room(&h, "R1", None).await;

        let mut sockets = Vec::new();
        for i in 0..4 {
            let (tx, rx) = socket();
            h.registry
                .join(&format!("s{i}"), &user(&format!("u_{i}"), "X"), tx, "R1", None)
                .await
                .unwrap();
            sockets.push(rx);
        }
        assert_eq!(h.registry.room_stats("R1").await.unwrap().connected_count, 4);

        h.registry.leave("s0").await;
        h.registry.handle_disconnect("s1").await;
        assert_eq!(h.registry.room_stats("R1").await.unwrap().connected_count, 2);
        assert_eq!(h.registry.participant_count().await, 2);
    }

    #[tokio::test]
    async fn create_room_rejects_guests_and_duplicates() {
        let h = harness();
        let err = h
            .registry
            .create_room(&guest("Mallory"), "Sneaky", false, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "HostRequired");

        let (room_id, settings) = h
            .registry
            .create_room(&user("u_1", "Ann"), "Demo", false, Some(8), Some("R1".into()))
            .await
            .unwrap();
        assert_eq!(room_id, "R1");
        assert_eq!(settings.max_participants, 8);
        assert!(!settings.is_private);

        let err = h
            .registry
            .create_room(&user("u_2", "Ben"), "Other", false, None, Some("R1".into()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "InvalidRequest");
    }
}
