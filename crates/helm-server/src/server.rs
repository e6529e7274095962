//! `HelmServer`: Axum HTTP + WebSocket surface for observers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::response::{Json, Response};
use axum::routing::get;
use helm_settings::ServerSettings;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::error::ServerError;
use crate::health::{self, HealthResponse};
use crate::websocket::hub::EventHub;
use crate::websocket::session::run_ws_session;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Observer registry.
    pub hub: Arc<EventHub>,
}

/// The observer-facing server.
pub struct HelmServer {
    settings: ServerSettings,
    hub: Arc<EventHub>,
    shutdown: CancellationToken,
}

impl HelmServer {
    /// Create a server with a fresh hub.
    pub fn new(settings: ServerSettings) -> Self {
        let hub = Arc::new(EventHub::new(settings.send_queue_size));
        Self::with_hub(settings, hub)
    }

    /// Create a server around an existing hub.
    pub fn with_hub(settings: ServerSettings, hub: Arc<EventHub>) -> Self {
        Self {
            settings,
            hub,
            shutdown: CancellationToken::new(),
        }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            hub: self.hub.clone(),
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/ws", get(ws_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// Bind, start the hub heartbeat, and serve in the background.
    ///
    /// Returns the bound address (useful with port `0`) and the serve task.
    pub async fn listen(&self) -> Result<(SocketAddr, JoinHandle<()>), ServerError> {
        let host = self.settings.host.as_str();
        let port = self.settings.port;
        let addr = tokio::net::lookup_host((host, port))
            .await
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| ServerError::InvalidAddress {
                host: host.to_string(),
                port,
            })?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local = listener.local_addr()?;

        self.hub
            .start_heartbeat(Duration::from_secs(self.settings.heartbeat_interval_secs));

        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await;
            if let Err(e) = served {
                error!(error = %e, "server exited with error");
            }
        });

        info!(addr = %local, "observer server listening");
        Ok((local, handle))
    }

    /// Stop accepting new HTTP connections.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// The observer hub.
    pub fn hub(&self) -> &Arc<EventHub> {
        &self.hub
    }

    /// The server settings.
    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.hub.uptime(),
        state.hub.connection_count(),
    ))
}

/// GET /ws
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| run_ws_session(socket, state.hub, peer.ip()))
}
