#![forbid(unsafe_code)]

// Per-participant SFU state: at most one transport per direction, any number
// of producers and consumers.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::types::{MediaKind, RtpCapabilities, TransportDirection};
use super::worker::{MediaConsumer, MediaProducer, MediaTransport};

/// A consumer plus the peer whose producer it is reading.
pub struct ConsumerEntry {
    pub consumer: Arc<dyn MediaConsumer>,
    pub producer_peer_id: String,
}

pub struct SfuPeer {
    pub peer_id: String,
    /// Writer channel of the peer's socket, for SFU fan-out.
    pub sender: mpsc::Sender<Arc<String>>,
    /// Receive capabilities the client declared at SFU join.
    pub rtp_capabilities: RtpCapabilities,
    pub send_transport: Option<Arc<dyn MediaTransport>>,
    pub recv_transport: Option<Arc<dyn MediaTransport>>,
    /// Direction of the most recently created transport; `connect-transport`
    /// events carry no transport id and bind to this one.
    pub last_created: Option<TransportDirection>,
    pub producers: HashMap<String, Arc<dyn MediaProducer>>,
    pub consumers: HashMap<String, ConsumerEntry>,
}

impl SfuPeer {
    #[must_use]
    pub fn new(
        peer_id: String,
        sender: mpsc::Sender<Arc<String>>,
        rtp_capabilities: RtpCapabilities,
    ) -> Self {
        Self {
            peer_id,
            sender,
            rtp_capabilities,
            send_transport: None,
            recv_transport: None,
            last_created: None,
            producers: HashMap::new(),
            consumers: HashMap::new(),
        }
    }

    #[must_use]
    pub fn transport(&self, direction: TransportDirection) -> Option<Arc<dyn MediaTransport>> {
        match direction {
            TransportDirection::Send => self.send_transport.clone(),
            TransportDirection::Recv => self.recv_transport.clone(),
        }
    }

    /// Install a transport, returning any previous one so the caller can
    /// close it outside the room lock.
    pub fn install_transport(
        &mut self,
        direction: TransportDirection,
        transport: Arc<dyn MediaTransport>,
    ) -> Option<Arc<dyn MediaTransport>> {
        self.last_created = Some(direction);
        match direction {
            TransportDirection::Send => self.send_transport.replace(transport),
            TransportDirection::Recv => self.recv_transport.replace(transport),
        }
    }

    /// Announcements for this peer's current producers, in no particular order.
    pub fn producer_list(&self) -> Vec<(String, MediaKind)> {
        self.producers
            .iter()
            .map(|(id, p)| (id.clone(), p.kind()))
            .collect()
    }

    /// Drain everything for teardown. Closing happens outside the room lock.
    pub fn take_resources(&mut self) -> PeerResources {
        PeerResources {
            transports: self
                .send_transport
                .take()
                .into_iter()
                .chain(self.recv_transport.take())
                .collect(),
            producers: self.producers.drain().map(|(_, p)| p).collect(),
            consumers: self.consumers.drain().map(|(_, e)| e.consumer).collect(),
        }
    }
}

/// Media resources detached from a peer, pending close.
pub struct PeerResources {
    pub transports: Vec<Arc<dyn MediaTransport>>,
    pub producers: Vec<Arc<dyn MediaProducer>>,
    pub consumers: Vec<Arc<dyn MediaConsumer>>,
}

impl PeerResources {
    /// Close consumers and producers first, then their transports.
    pub async fn close_all(self) {
        for consumer in self.consumers {
            consumer.close().await;
        }
        for producer in self.producers {
            producer.close().await;
        }
        for transport in self.transports {
            transport.close().await;
        }
    }
}
