//! Outbound task: drains the session queue and probes liveness.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use futures::{Sink, SinkExt};
use metrics::counter;
use relay_core::protocol::OutboundFrame;
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, warn};

use super::connection::SessionHandle;
use crate::metrics::WS_PROBE_FAILURES_TOTAL;
use crate::presence::PresenceRegistry;

/// Why the outbound task stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundExit {
    /// The session was torn down elsewhere.
    Cancelled,
    /// Writing a queued frame failed.
    WriteFailed,
    /// Writing a `{"type":"ping"}` probe failed.
    ProbeFailed,
}

/// Run the outbound half of a session.
///
/// Forwards queued frames to `sink` and writes a `ping` frame every
/// `interval`. Liveness is judged by the probe write alone: a failed write
/// tears the session down. Whatever the exit reason, the session is torn
/// down and the sink is closed exactly once before returning.
pub async fn run_outbound<S>(
    mut sink: S,
    mut rx: mpsc::Receiver<Arc<String>>,
    session: Arc<SessionHandle>,
    registry: Arc<PresenceRegistry>,
    interval: Duration,
) -> OutboundExit
where
    S: Sink<Message> + Unpin,
{
    let probe = match OutboundFrame::Ping.encode() {
        Ok(text) => text,
        Err(_) => Arc::new(r#"{"type":"ping"}"#.to_owned()),
    };

    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let _ = ticker.tick().await; // consume first immediate tick

    let exit = loop {
        tokio::select! {
            biased;
            () = session.cancelled() => break OutboundExit::Cancelled,
            frame = rx.recv() => {
                let Some(text) = frame else {
                    break OutboundExit::Cancelled;
                };
                if sink.send(Message::Text(text.to_string().into())).await.is_err() {
                    break OutboundExit::WriteFailed;
                }
            }
            _ = ticker.tick() => {
                if sink.send(Message::Text(probe.to_string().into())).await.is_err() {
                    counter!(WS_PROBE_FAILURES_TOTAL).increment(1);
                    warn!(session_id = %session.id, "liveness probe failed, closing session");
                    break OutboundExit::ProbeFailed;
                }
                tracing::trace!(session_id = %session.id, "sent probe");
            }
        }
    };

    let _ = session.teardown(&registry);
    let _ = sink.close().await;
    debug!(session_id = %session.id, ?exit, "outbound task finished");
    exit
}
