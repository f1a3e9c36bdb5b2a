#![forbid(unsafe_code)]

// Embedded control-plane worker. Owns the signaling-side state machine of the
// SFU — router/transport/producer/consumer lifecycles, ICE/DTLS parameter
// allocation, pause state, codec matching — while packet forwarding stays in
// the native data plane behind the same trait surface.

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use super::config::MediaConfig;
use super::types::{
    DtlsFingerprint, DtlsParameters, DtlsState, IceCandidate, IceParameters, MediaError,
    MediaKind, MediaResult, RtpCapabilities, RtpParameters, TransportInfo,
};
use super::worker::{
    MediaConsumer, MediaProducer, MediaRouter, MediaTransport, MediaWorker, WorkerStatus,
};

fn unwrap_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn random_alnum(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn random_fingerprint() -> DtlsFingerprint {
    let bytes: Vec<u8> = (0..32).map(|_| rand::thread_rng().gen()).collect();
    let value = bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":");
    DtlsFingerprint {
        algorithm: "sha-256".to_string(),
        value,
    }
}

pub struct EmbeddedMediaWorker {
    config: Arc<MediaConfig>,
    status_tx: watch::Sender<WorkerStatus>,
}

impl EmbeddedMediaWorker {
    #[must_use]
    pub fn new(config: MediaConfig) -> Arc<Self> {
        let (status_tx, _) = watch::channel(WorkerStatus::Running);
        Arc::new(Self {
            config: Arc::new(config),
            status_tx,
        })
    }

    /// Signal worker death. Mirrors the native library's `died` event; used by
    /// operational tooling and the test suite.
    pub fn kill(&self) {
        let _ = self.status_tx.send(WorkerStatus::Died);
    }

    fn is_dead(&self) -> bool {
        *self.status_tx.borrow() == WorkerStatus::Died
    }
}

#[async_trait]
impl MediaWorker for EmbeddedMediaWorker {
    async fn create_router(&self) -> MediaResult<Arc<dyn MediaRouter>> {
        if self.is_dead() {
            return Err(MediaError::WorkerError("worker has died".to_string()));
        }
        let router = EmbeddedRouter::new(Arc::clone(&self.config));
        debug!(router_id = %router.id, "created router");
        Ok(router)
    }

    fn status(&self) -> watch::Receiver<WorkerStatus> {
        self.status_tx.subscribe()
    }
}

struct ProducerRecord {
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    paused: Arc<AtomicBool>,
}

/// State shared between a router and its transports.
struct RouterShared {
    producers: RwLock<HashMap<String, ProducerRecord>>,
    transports: RwLock<Vec<Weak<EmbeddedTransport>>>,
    closed: AtomicBool,
}

pub struct EmbeddedRouter {
    id: String,
    capabilities: RtpCapabilities,
    config: Arc<MediaConfig>,
    shared: Arc<RouterShared>,
}

impl EmbeddedRouter {
    fn new(config: Arc<MediaConfig>) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            capabilities: RtpCapabilities {
                codecs: config.codecs.clone(),
                header_extensions: vec![],
            },
            config,
            shared: Arc::new(RouterShared {
                producers: RwLock::new(HashMap::new()),
                transports: RwLock::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        })
    }
}

#[async_trait]
impl MediaRouter for EmbeddedRouter {
    fn id(&self) -> &str {
        &self.id
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.capabilities.clone()
    }

    fn can_consume(&self, producer_id: &str, rtp_capabilities: &RtpCapabilities) -> bool {
        let producers = read_lock(&self.shared.producers);
        producers
            .get(producer_id)
            .is_some_and(|record| rtp_capabilities.supports_kind(record.kind))
    }

    async fn create_transport(&self) -> MediaResult<Arc<dyn MediaTransport>> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(MediaError::RouterError("router is closed".to_string()));
        }

        let port = rand::thread_rng()
            .gen_range(self.config.rtc_min_port..=self.config.rtc_max_port);

        let transport = Arc::new(EmbeddedTransport {
            id: Uuid::new_v4().to_string(),
            ice_parameters: IceParameters {
                username_fragment: random_alnum(8),
                password: random_alnum(22),
                ice_lite: true,
            },
            ice_candidates: vec![IceCandidate {
                foundation: "udpcandidate".to_string(),
                priority: 1_076_302_079,
                address: self.config.candidate_ip().to_string(),
                protocol: "udp".to_string(),
                port,
                kind: "host".to_string(),
            }],
            dtls_parameters: DtlsParameters {
                role: Some("auto".to_string()),
                fingerprints: vec![random_fingerprint()],
            },
            state: RwLock::new(DtlsState::New),
            shared: Arc::clone(&self.shared),
            children: RwLock::new(TransportChildren::default()),
        });

        unwrap_lock(&self.shared.transports).push(Arc::downgrade(&transport));
        Ok(transport)
    }

    async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let transports: Vec<Arc<EmbeddedTransport>> = unwrap_lock(&self.shared.transports)
            .drain(..)
            .filter_map(|w| w.upgrade())
            .collect();
        for transport in transports {
            transport.close_inner();
        }
        unwrap_lock(&self.shared.producers).clear();
        debug!(router_id = %self.id, "router closed");
    }
}

#[derive(Default)]
struct TransportChildren {
    producers: Vec<Arc<EmbeddedProducer>>,
    consumers: Vec<Arc<EmbeddedConsumer>>,
}

pub struct EmbeddedTransport {
    id: String,
    ice_parameters: IceParameters,
    ice_candidates: Vec<IceCandidate>,
    dtls_parameters: DtlsParameters,
    state: RwLock<DtlsState>,
    shared: Arc<RouterShared>,
    children: RwLock<TransportChildren>,
}

impl EmbeddedTransport {
    /// Closing a transport closes every producer and consumer created on it.
    fn close_inner(&self) {
        {
            let mut state = unwrap_lock(&self.state);
            if *state == DtlsState::Closed {
                return;
            }
            *state = DtlsState::Closed;
        }
        let children = {
            let mut children = unwrap_lock(&self.children);
            std::mem::take(&mut *children)
        };
        for producer in children.producers {
            producer.close_inner();
        }
        for consumer in children.consumers {
            consumer.closed.store(true, Ordering::Release);
        }
    }
}

#[async_trait]
impl MediaTransport for EmbeddedTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn info(&self) -> TransportInfo {
        TransportInfo {
            id: self.id.clone(),
            ice_parameters: self.ice_parameters.clone(),
            ice_candidates: self.ice_candidates.clone(),
            dtls_parameters: self.dtls_parameters.clone(),
        }
    }

    fn dtls_state(&self) -> DtlsState {
        *read_lock(&self.state)
    }

    async fn connect(&self, _dtls_parameters: DtlsParameters) -> MediaResult<()> {
        let mut state = unwrap_lock(&self.state);
        match *state {
            DtlsState::Closed => Err(MediaError::InvalidState(
                "transport is closed".to_string(),
            )),
            // Re-connecting an already connected transport is a no-op.
            DtlsState::New | DtlsState::Connected => {
                *state = DtlsState::Connected;
                Ok(())
            }
        }
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> MediaResult<Arc<dyn MediaProducer>> {
        if self.dtls_state() == DtlsState::Closed {
            return Err(MediaError::TransportError(
                "transport is closed".to_string(),
            ));
        }

        let paused = Arc::new(AtomicBool::new(false));
        let producer = Arc::new(EmbeddedProducer {
            id: Uuid::new_v4().to_string(),
            kind,
            paused: Arc::clone(&paused),
            closed: AtomicBool::new(false),
            shared: Arc::clone(&self.shared),
        });

        unwrap_lock(&self.shared.producers).insert(
            producer.id.clone(),
            ProducerRecord {
                kind,
                rtp_parameters,
                paused,
            },
        );
        unwrap_lock(&self.children).producers.push(Arc::clone(&producer));
        Ok(producer)
    }

    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: RtpCapabilities,
        paused: bool,
    ) -> MediaResult<Arc<dyn MediaConsumer>> {
        if self.dtls_state() == DtlsState::Closed {
            return Err(MediaError::TransportError(
                "transport is closed".to_string(),
            ));
        }

        let (kind, rtp_parameters) = {
            let producers = read_lock(&self.shared.producers);
            let record = producers
                .get(producer_id)
                .ok_or_else(|| MediaError::Unconsumable(producer_id.to_string()))?;
            if !rtp_capabilities.supports_kind(record.kind) {
                return Err(MediaError::Unconsumable(producer_id.to_string()));
            }
            (record.kind, record.rtp_parameters.clone())
        };

        let consumer = Arc::new(EmbeddedConsumer {
            id: Uuid::new_v4().to_string(),
            producer_id: producer_id.to_string(),
            kind,
            rtp_parameters,
            paused: AtomicBool::new(paused),
            closed: AtomicBool::new(false),
        });
        unwrap_lock(&self.children).consumers.push(Arc::clone(&consumer));
        Ok(consumer)
    }

    async fn close(&self) {
        self.close_inner();
    }
}

pub struct EmbeddedProducer {
    id: String,
    kind: MediaKind,
    paused: Arc<AtomicBool>,
    closed: AtomicBool,
    shared: Arc<RouterShared>,
}

impl EmbeddedProducer {
    fn close_inner(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            unwrap_lock(&self.shared.producers).remove(&self.id);
        }
    }

    fn ensure_open(&self) -> MediaResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MediaError::ProducerError("producer is closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl MediaProducer for EmbeddedProducer {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    async fn pause(&self) -> MediaResult<()> {
        self.ensure_open()?;
        self.paused.store(true, Ordering::Release);
        Ok(())
    }

    async fn resume(&self) -> MediaResult<()> {
        self.ensure_open()?;
        self.paused.store(false, Ordering::Release);
        Ok(())
    }

    async fn close(&self) {
        self.close_inner();
    }
}

pub struct EmbeddedConsumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    paused: AtomicBool,
    closed: AtomicBool,
}

impl EmbeddedConsumer {
    fn ensure_open(&self) -> MediaResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MediaError::ConsumerError("consumer is closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl MediaConsumer for EmbeddedConsumer {
    fn id(&self) -> &str {
        &self.id
    }

    fn producer_id(&self) -> &str {
        &self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    async fn pause(&self) -> MediaResult<()> {
        self.ensure_open()?;
        self.paused.store(true, Ordering::Release);
        Ok(())
    }

    async fn resume(&self) -> MediaResult<()> {
        self.ensure_open()?;
        self.paused.store(false, Ordering::Release);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
