#![forbid(unsafe_code)]

// Per-socket event loop. Each connection owns a bounded writer channel and a
// send task; inbound events are dispatched to the room registry or the media
// session. One slow peer never blocks another: all fan-out uses try_send.

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::UserSnapshot;
use crate::error::{SessionError, SessionResult};
use crate::media::MediaSession;
use crate::metrics::ServerMetrics;
use crate::room::{RoomRegistry, Signal};
use crate::signaling::protocol::{ClientEvent, RoomStatsInfo, ServerEvent};
use crate::turn::IceConfig;

/// Bounded writer capacity per client. Messages beyond this are stale and
/// dropped rather than queued.
const CHANNEL_CAPACITY: usize = 256;

/// Close connections that stay silent this long.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Shared collaborators handed to every connection.
pub struct SessionDeps {
    pub registry: Arc<RoomRegistry>,
    pub media: Arc<MediaSession>,
    pub ice: Arc<IceConfig>,
    pub metrics: ServerMetrics,
}

/// Per-connection identity and writer handle.
pub struct ConnHandle {
    pub socket_id: String,
    pub user: UserSnapshot,
    pub sender: mpsc::Sender<Arc<String>>,
}

impl ConnHandle {
    fn send(&self, event: &ServerEvent) {
        match serde_json::to_string(event) {
            Ok(json) => {
                let _ = self.sender.try_send(Arc::new(json));
            }
            Err(e) => warn!(socket_id = %self.socket_id, "failed to serialize event: {e}"),
        }
    }

    fn send_error(&self, err: &SessionError) {
        self.send(&ServerEvent::Error {
            message: err.client_message(),
            code: Some(err.code().to_string()),
        });
    }
}

/// Drive one authenticated WebSocket until it closes, then hand control back
/// to the registry for disconnect bookkeeping.
pub async fn handle_connection(
    socket: WebSocket,
    user: UserSnapshot,
    deps: Arc<SessionDeps>,
    _permit: OwnedSemaphorePermit,
) {
    let socket_id = Uuid::new_v4().to_string();
    info!(%socket_id, user_id = %user.id, "socket connected");

    deps.metrics.inc_connections_total();
    let _gauge = deps.metrics.connection_guard();

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(CHANNEL_CAPACITY);

    let send_task = tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            if ws_sender
                .send(Message::Text((*json).clone().into()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    let conn = ConnHandle {
        socket_id: socket_id.clone(),
        user,
        sender: tx.clone(),
    };

    loop {
        let msg = match tokio::time::timeout(IDLE_TIMEOUT, ws_receiver.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(_)) | None) => break,
            Err(_) => {
                warn!(%socket_id, "idle timeout, closing connection");
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                deps.metrics.inc_events_received();
                let event = match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(event) => event,
                    Err(e) => {
                        deps.metrics.inc_errors();
                        conn.send_error(&SessionError::InvalidRequest(format!(
                            "malformed event: {e}"
                        )));
                        continue;
                    }
                };

                let start = Instant::now();
                let result = dispatch_event(&deps, &conn, event).await;
                deps.metrics.observe_event_handling(start.elapsed());

                if let Err(err) = result {
                    deps.metrics.inc_errors();
                    if let SessionError::Internal(source) = &err {
                        let correlation_id = Uuid::new_v4().to_string();
                        error!(%socket_id, %correlation_id, "internal error: {source:#}");
                    } else {
                        debug!(%socket_id, code = err.code(), "request failed: {err}");
                    }
                    if tx.is_closed() {
                        break;
                    }
                    conn.send_error(&err);
                }
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => {}
        }
    }

    deps.registry.handle_disconnect(&socket_id).await;

    drop(tx);
    drop(conn);
    let _ = send_task.await;
    info!(%socket_id, "socket closed");
}

/// Route one client event. Every error maps to a non-fatal `error` event.
pub async fn dispatch_event(
    deps: &SessionDeps,
    conn: &ConnHandle,
    event: ClientEvent,
) -> SessionResult<()> {
    match event {
        ClientEvent::RoomJoin {
            room_id, passcode, ..
        } => {
            let outcome = deps
                .registry
                .join(
                    &conn.socket_id,
                    &conn.user,
                    conn.sender.clone(),
                    &room_id,
                    passcode.as_deref(),
                )
                .await?;
            conn.send(&ServerEvent::RoomJoined {
                room_id: outcome.room_id,
                user: outcome.user,
                participants: outcome.participants,
                settings: outcome.settings,
                is_host: outcome.is_host,
            });
        }

        ClientEvent::RoomCreate {
            name,
            is_private,
            max_participants,
            id,
        } => {
            let (room_id, settings) = deps
                .registry
                .create_room(
                    &conn.user,
                    &name,
                    is_private.unwrap_or(false),
                    max_participants,
                    id,
                )
                .await?;
            conn.send(&ServerEvent::RoomCreated { room_id, settings });
        }

        ClientEvent::RoomLeave { .. } => {
            deps.registry.leave(&conn.socket_id).await;
        }

        ClientEvent::RoomEndCall { room_id } => {
            deps.registry.end_call(&conn.socket_id, &room_id).await?;
        }

        ClientEvent::UpdateMediaState(update) => {
            deps.registry
                .update_media_state(&conn.socket_id, update)
                .await?;
        }

        ClientEvent::WebrtcOffer { to, offer } => {
            deps.registry
                .forward_signal(&conn.socket_id, Signal::Offer { to, payload: offer })
                .await?;
        }

        ClientEvent::WebrtcAnswer { to, answer } => {
            deps.registry
                .forward_signal(&conn.socket_id, Signal::Answer { to, payload: answer })
                .await?;
        }

        ClientEvent::WebrtcIceCandidate { to, candidate } => {
            deps.registry
                .forward_signal(
                    &conn.socket_id,
                    Signal::IceCandidate {
                        to,
                        payload: candidate,
                    },
                )
                .await?;
        }

        ClientEvent::WebrtcGetIceServers => {
            conn.send(&ServerEvent::WebrtcIceServers {
                ice_servers: deps.ice.ice_servers(&conn.socket_id),
            });
        }

        ClientEvent::SfuJoinRoom {
            room_id,
            rtp_capabilities,
        } => {
            let (bound_room, peer_id) = sfu_binding(deps, conn)?;
            if bound_room != room_id {
                return Err(SessionError::InvalidRequest(
                    "sfu room does not match the joined room".to_string(),
                ));
            }
            let (capabilities, existing) = deps
                .media
                .join(&room_id, &peer_id, conn.sender.clone(), rtp_capabilities)
                .await?;
            conn.send(&ServerEvent::SfuRouterRtpCapabilities {
                rtp_capabilities: capabilities,
            });
            // Late joiner learns about every producer already in the room.
            for announcement in existing {
                conn.send(&ServerEvent::SfuNewProducer {
                    peer_id: announcement.peer_id,
                    producer_id: announcement.producer_id,
                    kind: announcement.kind,
                });
            }
        }

        ClientEvent::SfuCreateTransport { direction } => {
            let (room_id, peer_id) = sfu_binding(deps, conn)?;
            let info = deps
                .media
                .create_transport(&room_id, &peer_id, direction)
                .await?;
            conn.send(&ServerEvent::SfuTransportCreated {
                id: info.id,
                direction,
                ice_parameters: info.ice_parameters,
                ice_candidates: info.ice_candidates,
                dtls_parameters: info.dtls_parameters,
            });
        }

        ClientEvent::SfuConnectTransport { dtls_parameters } => {
            let (room_id, peer_id) = sfu_binding(deps, conn)?;
            let direction = deps
                .media
                .connect_transport(&room_id, &peer_id, dtls_parameters)
                .await?;
            conn.send(&ServerEvent::SfuTransportConnected { direction });
        }

        ClientEvent::SfuProduce {
            kind,
            rtp_parameters,
        } => {
            let (room_id, peer_id) = sfu_binding(deps, conn)?;
            let id = deps
                .media
                .produce(&room_id, &peer_id, kind, rtp_parameters)
                .await?;
            conn.send(&ServerEvent::SfuProducerCreated { id });
        }

        ClientEvent::SfuConsume {
            producer_id,
            rtp_capabilities,
        } => {
            let (room_id, peer_id) = sfu_binding(deps, conn)?;
            let info = deps
                .media
                .consume(&room_id, &peer_id, &producer_id, rtp_capabilities)
                .await?;
            conn.send(&ServerEvent::SfuConsumerCreated {
                id: info.id,
                producer_id: info.producer_id,
                kind: info.kind,
                rtp_parameters: info.rtp_parameters,
                producer_peer_id: info.producer_peer_id,
            });
        }

        ClientEvent::SfuResumeConsumer { consumer_id } => {
            let (room_id, peer_id) = sfu_binding(deps, conn)?;
            deps.media
                .resume_consumer(&room_id, &peer_id, &consumer_id)
                .await?;
            conn.send(&ServerEvent::SfuConsumerResumed { consumer_id });
        }

        ClientEvent::SfuPauseProducer { pause } => {
            let (room_id, peer_id) = sfu_binding(deps, conn)?;
            deps.media.pause_producers(&room_id, &peer_id, pause).await?;
        }

        ClientEvent::ChatMessage { message, to } => {
            deps.registry
                .send_chat(&conn.socket_id, &message, to.as_deref())
                .await?;
        }

        ClientEvent::ChatTyping { is_typing } => {
            deps.registry.send_typing(&conn.socket_id, is_typing).await?;
        }

        ClientEvent::AdminGetRoomStats { room_id } => {
            let stats = deps
                .registry
                .room_stats(&room_id)
                .await
                .ok_or_else(|| SessionError::RoomNotFound(room_id.clone()))?;
            let stats = with_sfu_stats(deps, stats).await;
            conn.send(&ServerEvent::AdminRoomStats { stats });
        }

        ClientEvent::AdminGetAllRooms => {
            let mut rooms = Vec::new();
            for stats in deps.registry.all_rooms().await {
                rooms.push(with_sfu_stats(deps, stats).await);
            }
            conn.send(&ServerEvent::AdminAllRooms { rooms });
        }
    }

    Ok(())
}

fn sfu_binding(deps: &SessionDeps, conn: &ConnHandle) -> SessionResult<(String, String)> {
    deps.registry
        .binding_of(&conn.socket_id)
        .ok_or(SessionError::NotInRoom)
}

async fn with_sfu_stats(deps: &SessionDeps, mut stats: RoomStatsInfo) -> RoomStatsInfo {
    stats.sfu = deps.media.room_stats(&stats.room_id).await;
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::GUEST_ID_PREFIX;
    use crate::media::config::{default_codecs, MediaConfig};
    use crate::media::embedded::EmbeddedMediaWorker;
    use crate::media::types::RtpCapabilities;
    use crate::store::memory::InMemoryCallStore;
    use crate::store::CallStore;

    struct TestClient {
        conn: ConnHandle,
        rx: mpsc::Receiver<Arc<String>>,
    }

    impl TestClient {
        fn new(socket_id: &str, user_id: &str, name: &str) -> Self {
            let (tx, rx) = mpsc::channel(256);
            Self {
                conn: ConnHandle {
                    socket_id: socket_id.to_string(),
                    user: UserSnapshot {
                        id: user_id.to_string(),
                        display_name: name.to_string(),
                        email: None,
                        avatar_url: None,
                    },
                    sender: tx,
                },
                rx,
            }
        }

        fn guest(socket_id: &str, name: &str) -> Self {
            Self::new(socket_id, &format!("{GUEST_ID_PREFIX}{socket_id}"), name)
        }

        fn drain(&mut self) -> Vec<serde_json::Value> {
            let mut out = Vec::new();
            while let Ok(json) = self.rx.try_recv() {
                out.push(serde_json::from_str(&json).unwrap());
            }
            out
        }

        fn events_of(&mut self, kind: &str) -> Vec<serde_json::Value> {
            self.drain()
                .into_iter()
                .filter(|e| e["type"] == kind)
                .collect()
        }
    }

    fn deps() -> Arc<SessionDeps> {
        deps_with_store().0
    }

    fn deps_with_store() -> (Arc<SessionDeps>, Arc<InMemoryCallStore>) {
        let store = Arc::new(InMemoryCallStore::new());
        let worker = EmbeddedMediaWorker::new(MediaConfig::default());
        let metrics = ServerMetrics::new();
        let media = MediaSession::new(worker, metrics.clone());
        let registry = RoomRegistry::new(
            Arc::clone(&store) as Arc<dyn CallStore>,
            Arc::clone(&media),
            metrics.clone(),
        );
        (
            Arc::new(SessionDeps {
                registry,
                media,
                ice: Arc::new(IceConfig::default()),
                metrics,
            }),
            store,
        )
    }

    async fn send(
        deps: &SessionDeps,
        client: &TestClient,
        json: serde_json::Value,
    ) -> SessionResult<()> {
        let event: ClientEvent = serde_json::from_value(json).unwrap();
        dispatch_event(deps, &client.conn, event).await
    }

    async fn send_ok(deps: &SessionDeps, client: &TestClient, json: serde_json::Value) {
        if let Err(e) = send(deps, client, json).await {
            panic!("dispatch failed with {}: {e}", e.code());
        }
    }

    fn caps_json() -> serde_json::Value {
        serde_json::to_value(RtpCapabilities {
            codecs: default_codecs(),
            header_extensions: vec![],
        })
        .unwrap()
    }

    /// Joins the room and completes the full SFU setup (join, send + recv
    /// transports, both connected).
    async fn join_sfu_ready(deps: &SessionDeps, client: &mut TestClient, room_id: &str) {
        send_ok(
            deps,
            client,
            serde_json::json!({"type": "room:join", "roomId": room_id}),
        )
        .await;
        send_ok(
            deps,
            client,
            serde_json::json!({"type": "sfu:join-room", "roomId": room_id, "rtpCapabilities": caps_json()}),
        )
        .await;
        for direction in ["send", "recv"] {
            send_ok(
                deps,
                client,
                serde_json::json!({"type": "sfu:create-transport", "direction": direction}),
            )
            .await;
            let created = client.events_of("sfu:transport-created");
            let dtls = created.last().unwrap()["dtlsParameters"].clone();
            send_ok(
                deps,
                client,
                serde_json::json!({"type": "sfu:connect-transport", "dtlsParameters": dtls}),
            )
            .await;
        }
        client.drain();
    }

    // S1: host creates a public room, a guest joins it.
    #[tokio::test]
    async fn scenario_create_and_guest_join() {
        let deps = deps();
        let mut host = TestClient::new("s-host", "u_host", "Host");
        let mut guest = TestClient::guest("s-guest", "Alice");

        send_ok(
            &deps,
            &host,
            serde_json::json!({"type": "room:create", "name": "Demo", "isPrivate": false, "id": "R1"}),
        )
        .await;
        let created = host.events_of("room:created");
        assert_eq!(created.len(), 1);
        assert_eq!(created[0]["roomId"], "R1");

        send_ok(
            &deps,
            &host,
            serde_json::json!({"type": "room:join", "roomId": "R1"}),
        )
        .await;
        let joined = host.events_of("room:joined");
        assert_eq!(joined[0]["isHost"], true);
        assert_eq!(joined[0]["participants"].as_array().unwrap().len(), 0);

        send_ok(
            &deps,
            &guest,
            serde_json::json!({"type": "room:join", "roomId": "R1"}),
        )
        .await;
        let joined = guest.events_of("room:joined");
        assert_eq!(joined.len(), 1);
        assert_eq!(joined[0]["isHost"], false);
        let participants = joined[0]["participants"].as_array().unwrap();
        assert_eq!(participants.len(), 1);
        assert_eq!(participants[0]["userId"], "u_host");

        let user_joined = host.events_of("room:user-joined");
        assert_eq!(user_joined.len(), 1);
        assert_eq!(user_joined[0]["user"]["displayName"], "Alice");
        assert_eq!(user_joined[0]["participant"]["role"], "guest");
    }

    // S2: passcode-protected room rejects the wrong passcode.
    #[tokio::test]
    async fn scenario_passcode_required() {
        let (deps, store) = deps_with_store();
        // Passcodes are set through the API service; seed the record directly.
        store
            .create(crate::store::CallRecord {
                call_id: "call-R2".into(),
                room_id: "R2".into(),
                name: "Secret".into(),
                host_user_id: "u_host".into(),
                passcode: Some("1234".into()),
                kind: crate::store::CallKind::Open,
                invited: vec![],
                max_participants: 8,
                status: crate::store::CallStatus::Waiting,
                created_at: chrono::Utc::now(),
                started_at: None,
                ended_at: None,
            })
            .await
            .unwrap();

        let mut user = TestClient::new("s-u", "u_2", "Ben");
        let err = send(
            &deps,
            &user,
            serde_json::json!({"type": "room:join", "roomId": "R2", "passcode": "0000"}),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "InvalidPasscode");

        send_ok(
            &deps,
            &user,
            serde_json::json!({"type": "room:join", "roomId": "R2", "passcode": "1234"}),
        )
        .await;
        assert_eq!(user.events_of("room:joined").len(), 1);
    }

    // S3 + property 4: relay stamps the server-bound `from`.
    #[tokio::test]
    async fn scenario_webrtc_relay_targets_one_peer() {
        let deps = deps();
        let mut p1 = TestClient::new("s1", "u_1", "P1");
        let mut p2 = TestClient::new("s2", "u_2", "P2");
        let mut p3 = TestClient::new("s3", "u_3", "P3");

        make_room(&deps, "R3").await;
        for c in [&p1, &p2, &p3] {
            send_ok(
                &deps,
                c,
                serde_json::json!({"type": "room:join", "roomId": "R3"}),
            )
            .await;
        }
        let p1_peer = deps.registry.binding_of("s1").unwrap().1;
        let p2_peer = deps.registry.binding_of("s2").unwrap().1;
        for c in [&mut p1, &mut p2, &mut p3] {
            c.drain();
        }

        send_ok(
            &deps,
            &p1,
            serde_json::json!({
                "type": "webrtc:offer",
                "from": "peer_FORGED",
                "to": p2_peer,
                "offer": {"type": "offer", "sdp": "v=0..."}
            }),
        )
        .await;

        let offers = p2.events_of("webrtc:offer");
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0]["from"], p1_peer.as_str());
        assert_eq!(offers[0]["to"], p2_peer.as_str());
        assert_eq!(offers[0]["offer"]["sdp"], "v=0...");
        assert!(p1.drain().is_empty());
        assert!(p3.drain().is_empty());
    }

    // S4: ICE to a missing peer is silently dropped.
    #[tokio::test]
    async fn scenario_ice_to_ghost_is_silent() {
        let deps = deps();
        let mut p1 = TestClient::new("s1", "u_1", "P1");
        make_room(&deps, "R1").await;
        send_ok(
            &deps,
            &p1,
            serde_json::json!({"type": "room:join", "roomId": "R1"}),
        )
        .await;
        p1.drain();

        send_ok(
            &deps,
            &p1,
            serde_json::json!({
                "type": "webrtc:ice-candidate",
                "to": "peer_GHOST",
                "candidate": {"candidate": "candidate:0 1 udp ..."}
            }),
        )
        .await;
        assert!(p1.drain().is_empty());
    }

    // S5: host ends the call; everyone hears it, later joins see Ended.
    #[tokio::test]
    async fn scenario_host_ends_call() {
        let deps = deps();
        let mut host = TestClient::new("s-h", "u_host", "Host");
        let mut other = TestClient::new("s-o", "u_2", "Ben");

        make_room(&deps, "R4").await;
        send_ok(
            &deps,
            &host,
            serde_json::json!({"type": "room:join", "roomId": "R4"}),
        )
        .await;
        send_ok(
            &deps,
            &other,
            serde_json::json!({"type": "room:join", "roomId": "R4"}),
        )
        .await;
        host.drain();
        other.drain();

        send_ok(
            &deps,
            &host,
            serde_json::json!({"type": "room:end-call", "roomId": "R4"}),
        )
        .await;

        for c in [&mut host, &mut other] {
            let ended = c.events_of("room:call-ended");
            assert_eq!(ended.len(), 1);
            assert_eq!(ended[0]["roomId"], "R4");
            assert_eq!(ended[0]["reason"], "Host ended the call");
        }

        let mut late = TestClient::new("s-l", "u_3", "Late");
        let err = send(
            &deps,
            &late,
            serde_json::json!({"type": "room:join", "roomId": "R4"}),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "Ended");
    }

    // S6: SFU producer fan-out reaches exactly the other peers.
    #[tokio::test]
    async fn scenario_sfu_producer_fan_out() {
        let deps = deps();
        let mut a = TestClient::new("sa", "u_a", "A");
        let mut b = TestClient::new("sb", "u_b", "B");
        let mut c = TestClient::new("sc", "u_c", "C");

        make_room(&deps, "R5").await;
        join_sfu_ready(&deps, &mut a, "R5").await;
        join_sfu_ready(&deps, &mut b, "R5").await;
        join_sfu_ready(&deps, &mut c, "R5").await;
        let a_peer = deps.registry.binding_of("sa").unwrap().1;
        for client in [&mut a, &mut b, &mut c] {
            client.drain();
        }

        send_ok(
            &deps,
            &a,
            serde_json::json!({"type": "sfu:produce", "kind": "video", "rtpParameters": {}}),
        )
        .await;
        let created = a.events_of("sfu:producer-created");
        assert_eq!(created.len(), 1);
        let producer_id = created[0]["id"].as_str().unwrap().to_string();

        for peer in [&mut b, &mut c] {
            let news = peer.events_of("sfu:new-producer");
            assert_eq!(news.len(), 1);
            assert_eq!(news[0]["peerId"], a_peer.as_str());
            assert_eq!(news[0]["producerId"], producer_id.as_str());
            assert_eq!(news[0]["kind"], "video");
        }
        assert!(a.events_of("sfu:new-producer").is_empty());

        // B consumes A's producer: starts paused, resumes on request.
        send_ok(
            &deps,
            &b,
            serde_json::json!({
                "type": "sfu:consume",
                "producerId": producer_id,
                "rtpCapabilities": caps_json()
            }),
        )
        .await;
        let consumers = b.events_of("sfu:consumer-created");
        assert_eq!(consumers.len(), 1);
        assert_eq!(consumers[0]["producerPeerId"], a_peer.as_str());
        let consumer_id = consumers[0]["id"].as_str().unwrap().to_string();

        send_ok(
            &deps,
            &b,
            serde_json::json!({"type": "sfu:resume-consumer", "consumerId": consumer_id}),
        )
        .await;
        assert_eq!(b.events_of("sfu:consumer-resumed").len(), 1);
    }

    #[tokio::test]
    async fn sfu_join_requires_room_membership() {
        let deps = deps();
        let outsider = TestClient::new("sx", "u_x", "X");
        let err = send(
            &deps,
            &outsider,
            serde_json::json!({"type": "sfu:join-room", "roomId": "R1", "rtpCapabilities": caps_json()}),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "NotInRoom");
    }

    #[tokio::test]
    async fn unconsumable_producer_is_reported() {
        let deps = deps();
        let mut a = TestClient::new("sa", "u_a", "A");
        make_room(&deps, "R1").await;
        join_sfu_ready(&deps, &mut a, "R1").await;

        let err = send(
            &deps,
            &a,
            serde_json::json!({
                "type": "sfu:consume",
                "producerId": "no-such-producer",
                "rtpCapabilities": caps_json()
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "Unconsumable");
    }

    #[tokio::test]
    async fn ice_servers_are_returned_on_request() {
        let deps = deps();
        let mut c = TestClient::new("s1", "u_1", "Ann");
        send_ok(&deps, &c, serde_json::json!({"type": "webrtc:get-ice-servers"})).await;
        let events = c.events_of("webrtc:ice-servers");
        assert_eq!(events.len(), 1);
        let servers = events[0]["iceServers"].as_array().unwrap();
        assert_eq!(servers.len(), 1);
        assert!(servers[0]["urls"][0].as_str().unwrap().starts_with("stun:"));
    }

    #[tokio::test]
    async fn admin_stats_cover_room_and_sfu() {
        let deps = deps();
        let mut a = TestClient::new("sa", "u_a", "A");
        make_room(&deps, "R1").await;
        join_sfu_ready(&deps, &mut a, "R1").await;
        send_ok(
            &deps,
            &a,
            serde_json::json!({"type": "sfu:produce", "kind": "audio", "rtpParameters": {}}),
        )
        .await;
        a.drain();

        send_ok(
            &deps,
            &a,
            serde_json::json!({"type": "admin:get-room-stats", "roomId": "R1"}),
        )
        .await;
        let stats = a.events_of("admin:room-stats");
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0]["stats"]["connectedCount"], 1);
        assert_eq!(stats[0]["stats"]["sfu"]["producers"], 1);
        // No secrets anywhere in the payload.
        assert!(stats[0]["stats"].get("passcode").is_none());

        send_ok(&deps, &a, serde_json::json!({"type": "admin:get-all-rooms"})).await;
        let all = a.events_of("admin:all-rooms");
        assert_eq!(all[0]["rooms"].as_array().unwrap().len(), 1);

        let err = send(
            &deps,
            &a,
            serde_json::json!({"type": "admin:get-room-stats", "roomId": "nope"}),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "RoomNotFound");
    }

    #[tokio::test]
    async fn chat_and_typing_fan_out_through_dispatch() {
        let deps = deps();
        let mut a = TestClient::new("sa", "u_a", "A");
        let mut b = TestClient::new("sb", "u_b", "B");
        make_room(&deps, "R1").await;
        for c in [&a, &b] {
            send_ok(
                &deps,
                c,
                serde_json::json!({"type": "room:join", "roomId": "R1"}),
            )
            .await;
        }
        a.drain();
        b.drain();

        send_ok(
            &deps,
            &a,
            serde_json::json!({"type": "chat:message", "message": "hello"}),
        )
        .await;
        send_ok(
            &deps,
            &a,
            serde_json::json!({"type": "chat:typing", "isTyping": true}),
        )
        .await;

        let messages = b.events_of("chat:message");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["message"], "hello");
        assert_eq!(messages[0]["user"]["id"], "u_a");

        // Re-drain for typing (events_of consumed the buffer).
        send_ok(
            &deps,
            &a,
            serde_json::json!({"type": "chat:typing", "isTyping": false}),
        )
        .await;
        let typing = b.events_of("chat:typing");
        assert_eq!(typing.len(), 1);
        assert!(a.drain().is_empty());
    }

    /// Create a room through a throwaway host connection.
    async fn make_room(deps: &SessionDeps, room_id: &str) {
        let creator = TestClient::new("s-creator", "u_host", "Host");
        send_ok(
            deps,
            &creator,
            serde_json::json!({"type": "room:create", "name": "Demo", "id": room_id}),
        )
        .await;
    }
}
