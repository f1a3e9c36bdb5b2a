#![forbid(unsafe_code)]

// Media worker collaborator contract. The native routing library sits behind
// these traits; the session layer only drives the control plane: routers per
// room, transports per peer, producers and consumers per transport.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;

use super::types::{
    DtlsParameters, DtlsState, MediaKind, MediaResult, RtpCapabilities, RtpParameters,
    TransportInfo,
};

/// Health of the shared worker handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Running,
    /// The worker process died. Fatal for the session layer.
    Died,
}

/// Shared handle to the media worker.
#[async_trait]
pub trait MediaWorker: Send + Sync {
    /// Create a router with the worker's configured codec set.
    async fn create_router(&self) -> MediaResult<Arc<dyn MediaRouter>>;

    /// Observe worker liveness; flips to [`WorkerStatus::Died`] exactly once.
    fn status(&self) -> watch::Receiver<WorkerStatus>;
}

/// One router per SFU room.
#[async_trait]
pub trait MediaRouter: Send + Sync {
    fn id(&self) -> &str;

    fn rtp_capabilities(&self) -> RtpCapabilities;

    /// Whether a consumer for `producer_id` can be created for a client with
    /// the given receive capabilities.
    fn can_consume(&self, producer_id: &str, rtp_capabilities: &RtpCapabilities) -> bool;

    async fn create_transport(&self) -> MediaResult<Arc<dyn MediaTransport>>;

    /// Closes the router and everything beneath it.
    async fn close(&self);
}

/// A WebRTC transport. Closing it closes all of its producers and consumers.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    fn id(&self) -> &str;

    fn info(&self) -> TransportInfo;

    fn dtls_state(&self) -> DtlsState;

    /// Apply the client's DTLS parameters. Idempotent once connected.
    async fn connect(&self, dtls_parameters: DtlsParameters) -> MediaResult<()>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> MediaResult<Arc<dyn MediaProducer>>;

    /// Create a consumer for `producer_id`. Consumers start paused when
    /// `paused` is set so the client can wire the receiving track first.
    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: RtpCapabilities,
        paused: bool,
    ) -> MediaResult<Arc<dyn MediaConsumer>>;

    async fn close(&self);
}

#[async_trait]
pub trait MediaProducer: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    fn paused(&self) -> bool;

    async fn pause(&self) -> MediaResult<()>;
    async fn resume(&self) -> MediaResult<()>;
    async fn close(&self);
}

#[async_trait]
pub trait MediaConsumer: Send + Sync {
    fn id(&self) -> &str;
    fn producer_id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    fn rtp_parameters(&self) -> RtpParameters;
    fn paused(&self) -> bool;

    async fn pause(&self) -> MediaResult<()>;
    async fn resume(&self) -> MediaResult<()>;
    async fn close(&self);
}
