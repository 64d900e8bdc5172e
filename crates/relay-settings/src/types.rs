//! Settings structure.
//!
//! Every section is `#[serde(default)]` so a partial JSON file only needs the
//! keys it changes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RelaySettings {
    /// Listener and per-connection limits.
    pub server: ServerSettings,
    /// Database and upload locations.
    pub storage: StorageSettings,
    /// Token signing and password hashing.
    pub auth: AuthSettings,
    /// History query limits.
    pub history: HistorySettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl RelaySettings {
    /// Reject combinations that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.history.default_limit == 0 {
            return Err(SettingsError::InvalidValue(
                "history.defaultLimit must be positive".into(),
            ));
        }
        if self.history.max_limit < self.history.default_limit {
            return Err(SettingsError::InvalidValue(
                "history.maxLimit must be at least history.defaultLimit".into(),
            ));
        }
        if self.server.heartbeat_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "server.heartbeatIntervalMs must be positive".into(),
            ));
        }
        if self.server.send_queue_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "server.sendQueueCapacity must be positive".into(),
            ));
        }
        if !(4..=31).contains(&self.auth.bcrypt_cost) {
            return Err(SettingsError::InvalidValue(
                "auth.bcryptCost must be between 4 and 31".into(),
            ));
        }
        Ok(())
    }
}

/// Listener and per-connection limits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Concurrent WebSocket connections before upgrades are refused.
    pub max_connections: usize,
    /// Largest accepted WebSocket frame in bytes.
    pub max_message_size: usize,
    /// Interval between server `ping` probes.
    pub heartbeat_interval_ms: u64,
    /// Outbound frames buffered per session before pushes are dropped.
    pub send_queue_capacity: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8081,
            max_connections: 1024,
            max_message_size: 1024 * 1024,
            heartbeat_interval_ms: 10_000,
            send_queue_capacity: 256,
        }
    }
}

/// Database and upload locations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StorageSettings {
    /// `SQLite` file. `None` means `~/.relay/relay.db`.
    pub db_path: Option<String>,
    /// Directory uploads are written to and served from.
    pub upload_dir: String,
    /// Largest accepted upload in bytes.
    pub max_upload_bytes: usize,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            db_path: None,
            upload_dir: "uploads".into(),
            max_upload_bytes: 50 * 1024 * 1024,
        }
    }
}

/// Token signing and password hashing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AuthSettings {
    /// HMAC secret for bearer tokens. Generated per process when unset.
    pub jwt_secret: Option<String>,
    /// Token lifetime.
    pub token_ttl_secs: u64,
    /// bcrypt work factor.
    pub bcrypt_cost: u32,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            token_ttl_secs: 24 * 60 * 60,
            bcrypt_cost: 12,
        }
    }
}

/// History query limits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HistorySettings {
    /// Used when a request omits `limit` or sends zero.
    pub default_limit: u32,
    /// Requests above this are clamped.
    pub max_limit: u32,
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self {
            default_limit: 50,
            max_limit: 500,
        }
    }
}

/// Log output.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoggingSettings {
    /// Default level (`trace`..`error`). `RUST_LOG` takes precedence.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Per-target level overrides, e.g. `{"relay_store": "debug"}`.
    pub modules: BTreeMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
            modules: BTreeMap::new(),
        }
    }
}
