#![forbid(unsafe_code)]

// MediaSession — SFU control plane. One router per room in SFU mode, one
// send/recv transport pair per peer, producers announced to every other peer.
//
// Locking mirrors the room registry: the outer map under a std RwLock held
// only for lookups, each SFU room under its own tokio Mutex, and worker calls
// made outside the room lock with a commit step after.

pub mod config;
pub mod embedded;
pub mod peer;
pub mod types;
pub mod worker;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};
use tokio::sync::mpsc;
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, info, warn};

use crate::metrics::ServerMetrics;
use crate::signaling::protocol::ServerEvent;

use peer::{ConsumerEntry, PeerResources, SfuPeer};
use types::{
    ConsumerInfo, MediaError, MediaKind, MediaResult, RtpCapabilities, RtpParameters,
    TransportDirection, TransportInfo,
};
use worker::{MediaRouter, MediaWorker};

/// A producer another peer should start consuming.
#[derive(Debug, Clone)]
pub struct ProducerAnnouncement {
    pub peer_id: String,
    pub producer_id: String,
    pub kind: MediaKind,
}

/// SFU counters exposed through the admin surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SfuRoomStats {
    pub peers: usize,
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
}

struct SfuRoom {
    room_id: String,
    router: Arc<dyn MediaRouter>,
    peers: HashMap<String, SfuPeer>,
}

impl SfuRoom {
    fn peer(&self, peer_id: &str) -> MediaResult<&SfuPeer> {
        self.peers
            .get(peer_id)
            .ok_or_else(|| MediaError::PeerNotFound(peer_id.to_string()))
    }

    fn peer_mut(&mut self, peer_id: &str) -> MediaResult<&mut SfuPeer> {
        self.peers
            .get_mut(peer_id)
            .ok_or_else(|| MediaError::PeerNotFound(peer_id.to_string()))
    }

    /// Push an event to every peer except `except`. Slow receivers drop.
    fn broadcast_except(&self, except: &str, event: &ServerEvent) {
        let json = match serde_json::to_string(event) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!(room_id = %self.room_id, "failed to serialize sfu broadcast: {e}");
                return;
            }
        };
        for (id, peer) in &self.peers {
            if id != except {
                let _ = peer.sender.try_send(Arc::clone(&json));
            }
        }
    }
}

pub struct MediaSession {
    rooms: StdRwLock<HashMap<String, Arc<TokioMutex<SfuRoom>>>>,
    worker: Arc<dyn MediaWorker>,
    metrics: ServerMetrics,
}

impl MediaSession {
    #[must_use]
    pub fn new(worker: Arc<dyn MediaWorker>, metrics: ServerMetrics) -> Arc<Self> {
        Arc::new(Self {
            rooms: StdRwLock::new(HashMap::new()),
            worker,
            metrics,
        })
    }

    fn get_room(&self, room_id: &str) -> MediaResult<Arc<TokioMutex<SfuRoom>>> {
        self.rooms
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(room_id)
            .cloned()
            .ok_or_else(|| MediaError::RoomNotFound(room_id.to_string()))
    }

    async fn get_or_create_room(&self, room_id: &str) -> MediaResult<Arc<TokioMutex<SfuRoom>>> {
        {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            if let Some(room) = rooms.get(room_id) {
                return Ok(Arc::clone(room));
            }
        }

        // Router creation happens before taking the write lock.
        let router = self.worker.create_router().await?;
        info!(room_id, router_id = %router.id(), "created sfu router");

        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        Ok(Arc::clone(rooms.entry(room_id.to_string()).or_insert_with(
            || {
                Arc::new(TokioMutex::new(SfuRoom {
                    room_id: room_id.to_string(),
                    router,
                    peers: HashMap::new(),
                }))
            },
        )))
    }

    /// Join SFU mode: create or reuse the room router, register the peer, and
    /// return the router capabilities plus announcements for every producer
    /// that already exists in the room (the late-joiner path).
    pub async fn join(
        &self,
        room_id: &str,
        peer_id: &str,
        sender: mpsc::Sender<Arc<String>>,
        client_capabilities: RtpCapabilities,
    ) -> MediaResult<(RtpCapabilities, Vec<ProducerAnnouncement>)> {
        let room_lock = self.get_or_create_room(room_id).await?;
        let mut room = room_lock.lock().await;

        let capabilities = room.router.rtp_capabilities();

        let existing: Vec<ProducerAnnouncement> = room
            .peers
            .iter()
            .filter(|(id, _)| id.as_str() != peer_id)
            .flat_map(|(id, peer)| {
                peer.producer_list()
                    .into_iter()
                    .map(|(producer_id, kind)| ProducerAnnouncement {
                        peer_id: id.clone(),
                        producer_id,
                        kind,
                    })
            })
            .collect();

        // A rejoin replaces the old peer entry; stale media closes outside
        // the lock.
        let stale = room
            .peers
            .insert(
                peer_id.to_string(),
                SfuPeer::new(peer_id.to_string(), sender, client_capabilities),
            )
            .map(|mut old| old.take_resources());
        drop(room);

        if let Some(resources) = stale {
            resources.close_all().await;
        }

        debug!(room_id, peer_id, announced = existing.len(), "peer joined sfu");
        Ok((capabilities, existing))
    }

    pub async fn create_transport(
        &self,
        room_id: &str,
        peer_id: &str,
        direction: TransportDirection,
    ) -> MediaResult<TransportInfo> {
        let room_lock = self.get_room(room_id)?;

        // Snapshot the router, create the transport unlocked, then commit.
        let router = {
            let room = room_lock.lock().await;
            room.peer(peer_id)?;
            Arc::clone(&room.router)
        };
        let transport = router.create_transport().await?;
        let info = transport.info();

        let replaced = {
            let mut room = room_lock.lock().await;
            match room.peer_mut(peer_id) {
                Ok(peer) => peer.install_transport(direction, Arc::clone(&transport)),
                Err(e) => {
                    // Peer vanished between the two lock windows.
                    drop(room);
                    transport.close().await;
                    return Err(e);
                }
            }
        };
        if let Some(old) = replaced {
            old.close().await;
        }

        debug!(room_id, peer_id, ?direction, transport_id = %info.id, "created transport");
        Ok(info)
    }

    /// Apply DTLS parameters to the caller's most recently created transport.
    pub async fn connect_transport(
        &self,
        room_id: &str,
        peer_id: &str,
        dtls_parameters: types::DtlsParameters,
    ) -> MediaResult<TransportDirection> {
        let room_lock = self.get_room(room_id)?;
        let (transport, direction) = {
            let room = room_lock.lock().await;
            let peer = room.peer(peer_id)?;
            let direction = peer.last_created.ok_or_else(|| {
                MediaError::TransportError("no transport created yet".to_string())
            })?;
            let transport = peer.transport(direction).ok_or_else(|| {
                MediaError::TransportError("no transport created yet".to_string())
            })?;
            (transport, direction)
        };

        transport.connect(dtls_parameters).await?;
        Ok(direction)
    }

    /// Create a producer on the caller's send transport and announce it to
    /// every other peer in the room.
    pub async fn produce(
        &self,
        room_id: &str,
        peer_id: &str,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> MediaResult<String> {
        let room_lock = self.get_room(room_id)?;
        let transport = {
            let room = room_lock.lock().await;
            room.peer(peer_id)?
                .transport(TransportDirection::Send)
                .ok_or_else(|| {
                    MediaError::TransportError("send transport not created".to_string())
                })?
        };

        let producer = transport.produce(kind, rtp_parameters).await?;
        let producer_id = producer.id().to_string();

        let mut room = room_lock.lock().await;
        match room.peer_mut(peer_id) {
            Ok(peer) => {
                peer.producers.insert(producer_id.clone(), Arc::clone(&producer));
            }
            Err(e) => {
                drop(room);
                producer.close().await;
                return Err(e);
            }
        }
        room.broadcast_except(
            peer_id,
            &ServerEvent::SfuNewProducer {
                peer_id: peer_id.to_string(),
                producer_id: producer_id.clone(),
                kind,
            },
        );
        drop(room);

        self.metrics.inc_producers_created();
        info!(room_id, peer_id, %producer_id, %kind, "producer created");
        Ok(producer_id)
    }

    /// Create a paused consumer on the caller's recv transport. The producer
    /// must belong to a peer of the same room, and the router must accept the
    /// client's receive capabilities.
    pub async fn consume(
        &self,
        room_id: &str,
        peer_id: &str,
        producer_id: &str,
        rtp_capabilities: RtpCapabilities,
    ) -> MediaResult<ConsumerInfo> {
        let room_lock = self.get_room(room_id)?;
        let (transport, producer_peer_id) = {
            let room = room_lock.lock().await;

            let owner = room
                .peers
                .iter()
                .find(|(_, p)| p.producers.contains_key(producer_id))
                .map(|(id, _)| id.clone())
                .ok_or_else(|| MediaError::Unconsumable(producer_id.to_string()))?;

            if !room.router.can_consume(producer_id, &rtp_capabilities) {
                return Err(MediaError::Unconsumable(producer_id.to_string()));
            }

            let transport = room
                .peer(peer_id)?
                .transport(TransportDirection::Recv)
                .ok_or_else(|| {
                    MediaError::TransportError("recv transport not created".to_string())
                })?;
            (transport, owner)
        };

        // Consumers start paused; the client resumes once its receiving track
        // is wired up.
        let consumer = transport.consume(producer_id, rtp_capabilities, true).await?;
        let info = ConsumerInfo {
            id: consumer.id().to_string(),
            producer_id: producer_id.to_string(),
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters(),
            producer_peer_id: producer_peer_id.clone(),
        };

        let mut room = room_lock.lock().await;
        match room.peer_mut(peer_id) {
            Ok(peer) => {
                peer.consumers.insert(
                    info.id.clone(),
                    ConsumerEntry {
                        consumer,
                        producer_peer_id,
                    },
                );
            }
            Err(e) => {
                drop(room);
                consumer.close().await;
                return Err(e);
            }
        }
        drop(room);

        self.metrics.inc_consumers_created();
        debug!(room_id, peer_id, consumer_id = %info.id, "consumer created");
        Ok(info)
    }

    pub async fn resume_consumer(
        &self,
        room_id: &str,
        peer_id: &str,
        consumer_id: &str,
    ) -> MediaResult<()> {
        let room_lock = self.get_room(room_id)?;
        let consumer = {
            let room = room_lock.lock().await;
            room.peer(peer_id)?
                .consumers
                .get(consumer_id)
                .map(|e| Arc::clone(&e.consumer))
                .ok_or_else(|| MediaError::ConsumerError(consumer_id.to_string()))?
        };
        consumer.resume().await
    }

    /// Pause or resume every producer owned by the caller (mute semantics)
    /// and broadcast the new state to the rest of the room.
    pub async fn pause_producers(
        &self,
        room_id: &str,
        peer_id: &str,
        pause: bool,
    ) -> MediaResult<Vec<String>> {
        let room_lock = self.get_room(room_id)?;
        let producers: Vec<Arc<dyn worker::MediaProducer>> = {
            let room = room_lock.lock().await;
            room.peer(peer_id)?.producers.values().cloned().collect()
        };

        let mut changed = Vec::with_capacity(producers.len());
        for producer in &producers {
            if pause {
                producer.pause().await?;
            } else {
                producer.resume().await?;
            }
            changed.push(producer.id().to_string());
        }

        let room = room_lock.lock().await;
        for producer_id in &changed {
            room.broadcast_except(
                peer_id,
                &ServerEvent::SfuProducerPaused {
                    producer_id: producer_id.clone(),
                    paused: pause,
                },
            );
        }
        Ok(changed)
    }

    /// Tear down the caller's SFU state. Consumers held by other peers on the
    /// caller's producers are closed and their owners notified. The last peer
    /// out closes the router.
    pub async fn leave(&self, room_id: &str, peer_id: &str) -> MediaResult<()> {
        let room_lock = match self.get_room(room_id) {
            Ok(room) => room,
            // Leaving a room without SFU state is a no-op.
            Err(MediaError::RoomNotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        let mut orphaned: Vec<Arc<dyn worker::MediaConsumer>> = Vec::new();
        let mut resources: Option<PeerResources> = None;
        let mut close_router: Option<Arc<dyn MediaRouter>> = None;

        {
            let mut room = room_lock.lock().await;
            if let Some(mut peer) = room.peers.remove(peer_id) {
                resources = Some(peer.take_resources());
            }

            // Other peers' consumers of this peer's producers become dead ends.
            for other in room.peers.values_mut() {
                let stale: Vec<String> = other
                    .consumers
                    .iter()
                    .filter(|(_, e)| e.producer_peer_id == peer_id)
                    .map(|(id, _)| id.clone())
                    .collect();
                for consumer_id in stale {
                    if let Some(entry) = other.consumers.remove(&consumer_id) {
                        orphaned.push(entry.consumer);
                        let event = ServerEvent::SfuConsumerClosed {
                            consumer_id: consumer_id.clone(),
                        };
                        if let Ok(json) = serde_json::to_string(&event) {
                            let _ = other.sender.try_send(Arc::new(json));
                        }
                    }
                }
            }

            if room.peers.is_empty() {
                close_router = Some(Arc::clone(&room.router));
            }
        }

        if let Some(resources) = resources {
            resources.close_all().await;
        }
        for consumer in orphaned {
            consumer.close().await;
        }

        if let Some(router) = close_router {
            {
                let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
                rooms.remove(room_id);
            }
            router.close().await;
            info!(room_id, "sfu room empty, router closed");
        }

        Ok(())
    }

    /// Tear down a whole room (call ended, room reaped).
    pub async fn close_room(&self, room_id: &str) {
        let room_lock = {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            rooms.remove(room_id)
        };
        let Some(room_lock) = room_lock else { return };

        let (resources, router) = {
            let mut room = room_lock.lock().await;
            let resources: Vec<PeerResources> = room
                .peers
                .values_mut()
                .map(SfuPeer::take_resources)
                .collect();
            room.peers.clear();
            (resources, Arc::clone(&room.router))
        };

        for r in resources {
            r.close_all().await;
        }
        router.close().await;
        info!(room_id, "sfu room closed");
    }

    #[must_use]
    pub fn has_room(&self, room_id: &str) -> bool {
        self.rooms
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(room_id)
    }

    pub async fn room_stats(&self, room_id: &str) -> Option<SfuRoomStats> {
        let room_lock = self.get_room(room_id).ok()?;
        let room = room_lock.lock().await;
        let mut stats = SfuRoomStats {
            peers: room.peers.len(),
            ..SfuRoomStats::default()
        };
        for peer in room.peers.values() {
            stats.transports += usize::from(peer.send_transport.is_some())
                + usize::from(peer.recv_transport.is_some());
            stats.producers += peer.producers.len();
            stats.consumers += peer.consumers.len();
        }
        Some(stats)
    }
}
