//! Prometheus metrics recorder and `/metrics` endpoint handler.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Call once at startup before any metrics are recorded.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// A handle that is not installed globally (for tests and embedding).
pub fn detached_handle() -> PrometheusHandle {
    PrometheusBuilder::new().build_recorder().handle()
}

// Metric name constants to avoid typos across modules.

/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections total (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Upgrades refused at the connection limit (counter).
pub const WS_CONNECTIONS_REJECTED_TOTAL: &str = "ws_connections_rejected_total";
/// Connection lifetime in seconds (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Sessions torn down after a failed probe write (counter).
pub const WS_PROBE_FAILURES_TOTAL: &str = "ws_probe_failures_total";
/// Error frames sent (counter, labels: kind).
pub const FRAME_ERRORS_TOTAL: &str = "frame_errors_total";
/// Authenticated identities with at least one session (gauge).
pub const PRESENCE_IDENTITIES: &str = "presence_identities";
/// Messages accepted for delivery (counter).
pub const MESSAGES_SENT_TOTAL: &str = "messages_sent_total";
/// Live pushes accepted by a session queue (counter).
pub const DELIVERY_PUSHES_TOTAL: &str = "delivery_pushes_total";
/// Live pushes dropped because a queue was full or closed (counter).
pub const DELIVERY_MISSES_TOTAL: &str = "delivery_misses_total";
/// Messages replayed from the backlog at login (counter).
pub const BACKLOG_REPLAYED_TOTAL: &str = "backlog_replayed_total";
/// Message log failures (counter, labels: op).
pub const PERSISTENCE_FAILURES_TOTAL: &str = "persistence_failures_total";
/// Register/login attempts (counter, labels: action, outcome).
pub const AUTH_ATTEMPTS_TOTAL: &str = "auth_attempts_total";
/// Rejected bearer tokens (counter, labels: reason).
pub const TOKEN_REJECTIONS_TOTAL: &str = "token_rejections_total";
/// Completed uploads (counter).
pub const UPLOADS_TOTAL: &str = "uploads_total";
/// Uploaded bytes (counter).
pub const UPLOAD_BYTES_TOTAL: &str = "upload_bytes_total";
