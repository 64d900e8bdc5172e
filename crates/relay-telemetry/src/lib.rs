//! # relay-telemetry
//!
//! Installs the global `tracing` subscriber: an `EnvFilter` built from the
//! configured level and per-module overrides (`RUST_LOG` wins when set), and
//! a fmt layer writing either JSON lines or human-readable output.

#![deny(unsafe_code)]

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by `RUST_LOG`.
    pub log_level: Level,
    /// Per-module level overrides (e.g. `relay_store` => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit JSON lines.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
        }
    }
}

impl TelemetryConfig {
    /// Build from string levels, skipping unparseable entries.
    pub fn from_names<'a>(
        level: &str,
        modules: impl IntoIterator<Item = (&'a String, &'a String)>,
        json: bool,
    ) -> Self {
        let log_level = Level::from_str(level).unwrap_or(Level::INFO);
        let module_levels = modules
            .into_iter()
            .filter_map(|(module, lvl)| Level::from_str(lvl).ok().map(|l| (module.clone(), l)))
            .collect();
        Self {
            log_level,
            module_levels,
            json,
        }
    }
}

/// Telemetry initialisation failure.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// A global subscriber is already installed.
    #[error("failed to install tracing subscriber: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

/// Render the filter directive string for a config.
pub fn filter_directives(config: &TelemetryConfig) -> String {
    let mut filter = config.log_level.to_string().to_lowercase();
    for (module, level) in &config.module_levels {
        filter.push(',');
        filter.push_str(module);
        filter.push('=');
        filter.push_str(&level.to_string().to_lowercase());
    }
    filter
}

/// Initialize the global subscriber. Call once at startup.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(config)));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(true).boxed()
    };

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(env_filter))
        .try_init()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn directives_include_module_overrides() {
        let config = TelemetryConfig {
            log_level: Level::WARN,
            module_levels: vec![("relay_server".into(), Level::DEBUG)],
            json: true,
        };
        assert_eq!(filter_directives(&config), "warn,relay_server=debug");
    }

    #[test]
    fn directives_default_is_info() {
        assert_eq!(filter_directives(&TelemetryConfig::default()), "info");
    }

    #[test]
    fn from_names_skips_invalid_levels() {
        let mut modules = BTreeMap::new();
        let _ = modules.insert("relay_store".to_string(), "trace".to_string());
        let _ = modules.insert("hyper".to_string(), "loud".to_string());
        let config = TelemetryConfig::from_names("debug", &modules, false);
        assert_eq!(config.log_level, Level::DEBUG);
        assert_eq!(config.module_levels, vec![("relay_store".to_string(), Level::TRACE)]);
    }

    #[test]
    fn from_names_falls_back_to_info() {
        let config = TelemetryConfig::from_names("chatty", &BTreeMap::new(), false);
        assert_eq!(config.log_level, Level::INFO);
    }

    #[test]
    fn second_init_fails_cleanly() {
        let config = TelemetryConfig::default();
        let _ = init_telemetry(&config);
        assert!(init_telemetry(&config).is_err());
    }
}
