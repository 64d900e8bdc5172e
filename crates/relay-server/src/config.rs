//! Server configuration.

use std::path::PathBuf;
use std::time::Duration;

use relay_settings::RelaySettings;
use serde::{Deserialize, Serialize};

/// Configuration for the relay server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Interval between `{"type":"ping"}` probes, in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Per-session outbound queue capacity.
    pub send_queue_capacity: usize,
    /// Directory uploads are written to and served from.
    pub upload_dir: PathBuf,
    /// Largest accepted upload in bytes.
    pub max_upload_bytes: usize,
    /// History limit used when a request omits one.
    pub default_history_limit: u32,
    /// History requests above this are clamped.
    pub max_history_limit: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_connections: 1024,
            max_message_size: 1024 * 1024,
            heartbeat_interval_ms: 10_000,
            send_queue_capacity: 256,
            upload_dir: PathBuf::from("uploads"),
            max_upload_bytes: 50 * 1024 * 1024,
            default_history_limit: 50,
            max_history_limit: 500,
        }
    }
}

impl ServerConfig {
    /// Probe interval as a `Duration`.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Resolve a requested history limit: zero or missing means the default,
    /// anything above the maximum is clamped.
    pub fn history_limit(&self, requested: Option<u32>) -> u32 {
        match requested {
            None | Some(0) => self.default_history_limit,
            Some(n) => n.min(self.max_history_limit),
        }
    }
}

impl From<&RelaySettings> for ServerConfig {
    fn from(s: &RelaySettings) -> Self {
        Self {
            host: s.server.host.clone(),
            port: s.server.port,
            max_connections: s.server.max_connections,
            max_message_size: s.server.max_message_size,
            heartbeat_interval_ms: s.server.heartbeat_interval_ms,
            send_queue_capacity: s.server.send_queue_capacity,
            upload_dir: PathBuf::from(&s.storage.upload_dir),
            max_upload_bytes: s.storage.max_upload_bytes,
            default_history_limit: s.history.default_limit,
            max_history_limit: s.history.max_limit,
        }
    }
}
