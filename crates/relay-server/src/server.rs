//! `RelayServer`: Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use axum::Extension;
use axum::Router;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use futures::StreamExt;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusHandle;
use relay_core::credentials::CredentialStore;
use relay_core::log::MessageLog;
use relay_store::FileRepo;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::delivery::DeliveryPipeline;
use crate::health::{self, HealthResponse};
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_REJECTED_TOTAL,
    WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL,
};
use crate::presence::PresenceRegistry;
use crate::shutdown::ShutdownCoordinator;
use crate::upload::{self, UploadState};
use crate::websocket::session::{SessionContext, run_session};

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Everything a WebSocket session needs.
    pub session: SessionContext,
    /// Open WebSocket connections.
    pub connections: Arc<AtomicUsize>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus metrics handle for rendering `/metrics`.
    pub metrics_handle: PrometheusHandle,
}

/// The relay server.
pub struct RelayServer {
    config: ServerConfig,
    session: SessionContext,
    uploads: UploadState,
    shutdown: Arc<ShutdownCoordinator>,
    connections: Arc<AtomicUsize>,
    start_time: Instant,
    metrics_handle: PrometheusHandle,
}

impl RelayServer {
    /// Create a new server over its collaborators.
    pub fn new(
        config: ServerConfig,
        log: Arc<dyn MessageLog>,
        credentials: Arc<dyn CredentialStore>,
        files: FileRepo,
        metrics_handle: PrometheusHandle,
    ) -> Self {
        let shutdown = Arc::new(ShutdownCoordinator::new());
        let registry = Arc::new(PresenceRegistry::new());
        let pipeline = Arc::new(DeliveryPipeline::new(
            log,
            registry.clone(),
            credentials.clone(),
            config.clone(),
        ));
        let session = SessionContext {
            registry,
            pipeline,
            credentials: credentials.clone(),
            config: config.clone(),
            shutdown: shutdown.token(),
        };
        let uploads = UploadState {
            credentials,
            files,
            upload_dir: config.upload_dir.clone(),
        };
        Self {
            config,
            session,
            uploads,
            shutdown,
            connections: Arc::new(AtomicUsize::new(0)),
            start_time: Instant::now(),
            metrics_handle,
        }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            session: self.session.clone(),
            connections: self.connections.clone(),
            start_time: self.start_time,
            metrics_handle: self.metrics_handle.clone(),
        };

        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(state)
            .merge(upload::router(
                self.uploads.clone(),
                self.config.max_upload_bytes,
            ))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// Bind and serve in a background task until shutdown.
    ///
    /// Returns the bound address (useful with port `0`) and the serve task.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;
        let app = self.router();
        let token = self.shutdown.token();

        info!(%local_addr, "relay server listening");
        let handle = tokio::spawn(async move {
            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await;
            if let Err(e) = result {
                error!(error = %e, "server error");
            }
            info!("relay server stopped");
        });
        Ok((local_addr, handle))
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the presence registry.
    pub fn registry(&self) -> &Arc<PresenceRegistry> {
        &self.session.registry
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Open WebSocket connections.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

/// Holds one slot of the connection limit until dropped.
struct ConnectionSlot {
    connections: Arc<AtomicUsize>,
}

impl ConnectionSlot {
    fn acquire(connections: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < max).then_some(n + 1)
            })
            .ok()?;
        Some(Self {
            connections: connections.clone(),
        })
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        let _ = self.connections.fetch_sub(1, Ordering::SeqCst);
    }
}

/// GET /ws
async fn ws_handler(
    State(state): State<AppState>,
    connect_info: Option<Extension<ConnectInfo<SocketAddr>>>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let max = state.session.config.max_connections;
    let Some(slot) = ConnectionSlot::acquire(&state.connections, max) else {
        counter!(WS_CONNECTIONS_REJECTED_TOTAL).increment(1);
        warn!(max, "connection limit reached, refusing upgrade");
        return (StatusCode::SERVICE_UNAVAILABLE, "too many connections").into_response();
    };

    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => {
            return (StatusCode::BAD_REQUEST, rejection.body_text()).into_response();
        }
    };

    let remote_addr = connect_info.map(|Extension(ConnectInfo(addr))| addr);
    let max_message_size = state.session.config.max_message_size;
    upgrade
        .max_message_size(max_message_size)
        .on_upgrade(move |socket| async move {
            handle_socket(socket, state, remote_addr).await;
            drop(slot);
        })
}

/// Drive an upgraded socket through a session.
async fn handle_socket(socket: WebSocket, state: AppState, remote_addr: Option<SocketAddr>) {
    let started = Instant::now();
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

    let (sink, stream) = socket.split();
    let _ = run_session(sink, stream, state.session, remote_addr).await;

    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let registry = &state.session.registry;
    Json(health::health_check(
        state.start_time,
        state.connections.load(Ordering::SeqCst),
        registry.identity_count(),
        registry.session_count(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> String {
    state.metrics_handle.render()
}
