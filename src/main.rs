#![forbid(unsafe_code)]

mod auth;
mod config;
mod error;
mod media;
mod metrics;
mod room;
mod signaling;
mod store;
mod turn;

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use auth::jwt::JwtVerifier;
use auth::TokenVerifier;
use config::ServerConfig;
use media::embedded::EmbeddedMediaWorker;
use media::worker::{MediaWorker, WorkerStatus};
use media::MediaSession;
use metrics::ServerMetrics;
use room::RoomRegistry;
use signaling::SignalingServer;
use store::memory::InMemoryCallStore;
use store::postgres::PgCallStore;
use store::CallStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("parley signaling server starting");
    let config = ServerConfig::from_env();

    let store: Arc<dyn CallStore> = match &config.database_url {
        Some(url) => Arc::new(PgCallStore::connect(url).await?),
        None => {
            info!("DATABASE_URL not set — using the in-memory call store");
            Arc::new(InMemoryCallStore::new())
        }
    };

    let verifier: Arc<dyn TokenVerifier> = match &config.jwt_secret {
        Some(secret) => Arc::new(JwtVerifier::new(secret)),
        None => anyhow::bail!("JWT_SECRET must be set"),
    };

    let metrics = ServerMetrics::new();
    let worker = EmbeddedMediaWorker::new(config.media.clone());

    // Worker death is fatal: log, give the sink a moment, and let the
    // supervisor restart us.
    let mut worker_status = worker.status();
    tokio::spawn(async move {
        while worker_status.changed().await.is_ok() {
            if *worker_status.borrow() == WorkerStatus::Died {
                error!("media worker died, exiting for supervisor restart");
                tokio::time::sleep(Duration::from_secs(2)).await;
                std::process::exit(1);
            }
        }
    });

    let media = MediaSession::new(
        Arc::clone(&worker) as Arc<dyn MediaWorker>,
        metrics.clone(),
    );
    let registry = RoomRegistry::new(store, Arc::clone(&media), metrics.clone());
    let _sweeper = registry.spawn_sweeper();

    let server = SignalingServer::new(
        Arc::clone(&registry),
        media,
        verifier,
        config.ice.clone(),
        config.allowed_origins.clone(),
        metrics,
    );

    tokio::select! {
        result = server.serve(config.signaling_port) => {
            if let Err(e) = result {
                error!("signaling server error: {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
        }
    }

    info!("server shutdown complete");
    Ok(())
}
