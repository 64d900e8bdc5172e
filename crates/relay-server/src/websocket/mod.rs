//! WebSocket sessions: connection handle, outbound task and read loop.

pub mod connection;
pub mod heartbeat;
pub mod session;
