//! # relay-settings
//!
//! Relay configuration, loaded in three layers:
//!
//! 1. Compiled defaults ([`RelaySettings::default()`])
//! 2. `~/.relay/settings.json` (or an explicit path), deep-merged over defaults
//! 3. `RELAY_*` environment variables

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{load_settings, load_settings_from_path, relay_home, settings_path};
pub use types::{
    AuthSettings, HistorySettings, LoggingSettings, RelaySettings, ServerSettings,
    StorageSettings,
};
