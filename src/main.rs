//! # relay
//!
//! Direct-message relay binary: loads settings, opens the database and
//! serves the HTTP/WebSocket endpoints until interrupted.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use relay_core::credentials::CredentialStore;
use relay_core::log::MessageLog;
use relay_server::{AuthConfig, RelayServer, ServerConfig, SqliteCredentialStore, TokenIssuer};
use relay_settings::RelaySettings;
use relay_store::{Database, FileRepo, MessageRepo, UserRepo};
use relay_telemetry::TelemetryConfig;

/// Real-time direct-message relay.
#[derive(Parser, Debug)]
#[command(name = "relay", about = "Real-time direct-message relay server")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Path to the `SQLite` database.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Settings file (defaults to `~/.relay/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

fn load_settings(args: &Cli) -> Result<RelaySettings> {
    let path = args
        .settings
        .clone()
        .unwrap_or_else(relay_settings::settings_path);
    let mut settings = relay_settings::load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    if let Some(host) = &args.host {
        settings.server.host.clone_from(host);
    }
    if let Some(port) = args.port {
        settings.server.port = port;
    }
    Ok(settings)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let settings = load_settings(&args)?;

    let telemetry = TelemetryConfig::from_names(
        &settings.logging.level,
        &settings.logging.modules,
        settings.logging.json,
    );
    relay_telemetry::init_telemetry(&telemetry).context("Failed to initialize logging")?;

    let db_path = args
        .db_path
        .or_else(|| settings.storage.db_path.clone().map(PathBuf::from))
        .unwrap_or_else(|| relay_settings::relay_home().join("relay.db"));
    ensure_parent_dir(&db_path)?;
    let db = Database::open(&db_path)
        .with_context(|| format!("Failed to open database: {}", db_path.display()))?;

    let config = ServerConfig::from(&settings);
    std::fs::create_dir_all(&config.upload_dir).with_context(|| {
        format!(
            "Failed to create upload directory: {}",
            config.upload_dir.display()
        )
    })?;

    let auth = AuthConfig::from(&settings);
    let tokens = Arc::new(TokenIssuer::from_config(&auth));
    let credentials: Arc<dyn CredentialStore> = Arc::new(SqliteCredentialStore::new(
        UserRepo::new(db.clone()),
        tokens,
        auth.bcrypt_cost,
    ));
    let log: Arc<dyn MessageLog> = Arc::new(MessageRepo::new(db.clone()));
    let metrics_handle =
        relay_server::metrics::install_recorder().context("Failed to install metrics recorder")?;

    let server = RelayServer::new(config, log, credentials, FileRepo::new(db), metrics_handle);
    let (addr, handle) = server
        .listen()
        .await
        .context("Failed to bind server")?;

    tracing::info!(db = %db_path.display(), "relay listening on http://{addr}");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    server.shutdown().graceful_shutdown(vec![handle], None).await;
    Ok(())
}
