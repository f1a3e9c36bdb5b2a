#![forbid(unsafe_code)]

// Signaling server: WebSocket endpoint plus health and metrics. The
// handshake gates every socket through the origin allow-list, the
// per-address rate limiter, and the token verifier — an unauthenticated
// socket never creates session state.

pub mod connection;
pub mod protocol;

use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::auth::rate_limit::AuthRateLimiter;
use crate::auth::TokenVerifier;
use crate::media::MediaSession;
use crate::metrics::ServerMetrics;
use crate::room::RoomRegistry;
use crate::turn::IceConfig;

use connection::SessionDeps;

const DEFAULT_MAX_CONNECTIONS: usize = 10_000;
const MAX_WS_MESSAGE_SIZE: usize = 64 * 1024;

#[derive(Debug, Deserialize)]
struct WsQuery {
    /// Bearer token fallback for browser clients that cannot set headers.
    token: Option<String>,
}

#[derive(Clone)]
pub struct SignalingServer {
    deps: Arc<SessionDeps>,
    verifier: Arc<dyn TokenVerifier>,
    rate_limiter: Arc<AuthRateLimiter>,
    allowed_origins: Arc<Vec<String>>,
    connection_semaphore: Arc<Semaphore>,
    metrics: ServerMetrics,
}

impl SignalingServer {
    #[must_use]
    pub fn new(
        registry: Arc<RoomRegistry>,
        media: Arc<MediaSession>,
        verifier: Arc<dyn TokenVerifier>,
        ice: IceConfig,
        allowed_origins: Vec<String>,
        metrics: ServerMetrics,
    ) -> Self {
        let max_connections = std::env::var("MAX_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|&n| n > 0)
            .unwrap_or(DEFAULT_MAX_CONNECTIONS);

        Self {
            deps: Arc::new(SessionDeps {
                registry,
                media,
                ice: Arc::new(ice),
                metrics: metrics.clone(),
            }),
            verifier,
            rate_limiter: Arc::new(AuthRateLimiter::default()),
            allowed_origins: Arc::new(allowed_origins),
            connection_semaphore: Arc::new(Semaphore::new(max_connections)),
            metrics,
        }
    }

    #[must_use]
    pub fn router(self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self)
            .layer(CorsLayer::permissive())
    }

    /// Bind and serve until the process is told to stop.
    pub async fn serve(self, port: u16) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{port}");
        info!("signaling server listening on {addr}");

        // Limiter state ages out in the background.
        let limiter = Arc::clone(&self.rate_limiter);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(300));
            loop {
                ticker.tick().await;
                limiter.prune();
            }
        });

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let app = self.router();
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await?;
        Ok(())
    }

    fn origin_allowed(&self, headers: &HeaderMap) -> bool {
        if self.allowed_origins.is_empty() {
            return true;
        }
        let Some(origin) = headers.get("origin").and_then(|v| v.to_str().ok()) else {
            // Non-browser clients send no Origin header.
            return true;
        };
        self.allowed_origins
            .iter()
            .any(|allowed| allowed == "*" || allowed == origin)
    }
}

fn bearer_token<'a>(headers: &'a HeaderMap, query: &'a WsQuery) -> Option<&'a str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or(query.token.as_deref())
}

async fn ws_handler(
    State(server): State<SignalingServer>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !server.origin_allowed(&headers) {
        warn!(%remote, "rejected socket: origin not allowed");
        return (StatusCode::FORBIDDEN, "Origin not allowed").into_response();
    }

    // Every authentication attempt counts against the per-address budget,
    // successful or not.
    if !server.rate_limiter.check(remote.ip()) {
        server.metrics.inc_auth_rejections();
        warn!(%remote, "rejected socket: auth rate limited");
        return (StatusCode::TOO_MANY_REQUESTS, "Too many attempts").into_response();
    }

    let Some(token) = bearer_token(&headers, &query) else {
        server.metrics.inc_auth_rejections();
        return (StatusCode::UNAUTHORIZED, "Missing token").into_response();
    };

    let user = match server.verifier.verify(token).await {
        Ok(user) => user,
        Err(e) => {
            server.metrics.inc_auth_rejections();
            warn!(%remote, "rejected socket: {e}");
            return (StatusCode::UNAUTHORIZED, "Authentication failed").into_response();
        }
    };

    let permit = match server.connection_semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            warn!("connection limit reached, rejecting upgrade");
            return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
        }
    };

    let deps = Arc::clone(&server.deps);
    ws.max_message_size(MAX_WS_MESSAGE_SIZE)
        .on_failed_upgrade(|error| {
            warn!("websocket upgrade failed: {error}");
        })
        .on_upgrade(move |socket| connection::handle_connection(socket, user, deps, permit))
}

async fn health_handler(State(server): State<SignalingServer>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "rooms": server.deps.registry.room_count(),
        "participants": server.deps.registry.participant_count().await,
    }))
}

/// Prometheus text exposition, optionally guarded by `METRICS_TOKEN`.
async fn metrics_handler(State(server): State<SignalingServer>, headers: HeaderMap) -> Response {
    if let Ok(expected) = std::env::var("METRICS_TOKEN") {
        let provided = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if provided != format!("Bearer {expected}") {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let rooms = server.deps.registry.room_count();
    let participants = server.deps.registry.participant_count().await;
    let body = server.metrics.render_prometheus(rooms, participants);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}
