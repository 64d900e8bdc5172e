//! # relay-server
//!
//! Axum HTTP + `WebSocket` server for direct-message delivery.
//!
//! - Presence registry: live sessions per authenticated identity
//! - `WebSocket` sessions: state machine, outbound queue, liveness probes
//! - Delivery pipeline: persist, fan out, replay backlogs on login
//! - Credential store over `SQLite` with bcrypt hashes and HS256 tokens
//! - HTTP endpoints: uploads, health check, Prometheus metrics
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod auth;
pub mod config;
pub mod delivery;
pub mod health;
pub mod metrics;
pub mod presence;
pub mod server;
pub mod shutdown;
pub mod upload;
pub mod websocket;

pub use auth::{AuthConfig, SqliteCredentialStore, TokenIssuer};
pub use config::ServerConfig;
pub use delivery::{DeliveryPipeline, DeliveryReport};
pub use presence::PresenceRegistry;
pub use server::RelayServer;
