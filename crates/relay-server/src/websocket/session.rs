//! Session state machine: the read loop of one connection.

use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::Message;
use futures::{Sink, Stream, StreamExt};
use metrics::counter;
use relay_core::credentials::CredentialStore;
use relay_core::protocol::{
    ActionKind, ActionRequest, InboundFrame, MessageFrame, OutboundFrame, parse_frame,
};
use relay_core::{Identity, RelayError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::connection::SessionHandle;
use super::heartbeat::run_outbound;
use crate::config::ServerConfig;
use crate::delivery::DeliveryPipeline;
use crate::metrics::FRAME_ERRORS_TOTAL;
use crate::presence::PresenceRegistry;

/// Everything a session needs from the server.
#[derive(Clone)]
pub struct SessionContext {
    /// Live sessions per identity.
    pub registry: Arc<PresenceRegistry>,
    /// Message routing.
    pub pipeline: Arc<DeliveryPipeline>,
    /// Account and token checks.
    pub credentials: Arc<dyn CredentialStore>,
    /// Queue sizes, probe interval.
    pub config: ServerConfig,
    /// Server-wide shutdown signal.
    pub shutdown: CancellationToken,
}

/// Lifecycle of a session after the upgrade completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// HTTP upgrade in progress. Failures here are answered with an HTTP
    /// status and never reach the read loop.
    Connecting,
    /// Connected, no identity bound.
    Unauthenticated,
    /// Logged in as this identity.
    Authenticated(Identity),
    /// Torn down. Terminal.
    Closed,
}

/// Drive one connection until it closes.
///
/// Spawns the outbound task on `sink`, then reads frames from `stream` and
/// dispatches them in order. Returns after teardown, once the outbound task
/// has closed the sink.
#[instrument(skip_all, fields(remote = ?remote_addr))]
pub async fn run_session<S, R, E>(
    sink: S,
    mut stream: R,
    ctx: SessionContext,
    remote_addr: Option<SocketAddr>,
) -> SessionState
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Send,
    R: Stream<Item = Result<Message, E>> + Unpin + Send,
    E: Display + Send,
{
    let (handle, rx) = SessionHandle::new(remote_addr, ctx.config.send_queue_capacity);
    let handle = Arc::new(handle);
    info!(session_id = %handle.id, "session opened");

    let outbound = tokio::spawn(run_outbound(
        sink,
        rx,
        handle.clone(),
        ctx.registry.clone(),
        ctx.config.heartbeat_interval(),
    ));

    let mut state = SessionState::Unauthenticated;
    loop {
        let next = tokio::select! {
            () = handle.cancelled() => break,
            () = ctx.shutdown.cancelled() => break,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(Message::Text(text))) => {
                handle_text(text.as_str(), &mut state, &handle, &ctx).await;
            }
            Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                Ok(text) => handle_text(text, &mut state, &handle, &ctx).await,
                Err(_) => reply_error(&handle, &RelayError::InvalidJson).await,
            },
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) | None => {
                debug!(session_id = %handle.id, "client closed connection");
                break;
            }
            Some(Err(e)) => {
                let err = RelayError::Transport(e.to_string());
                debug!(session_id = %handle.id, error = %err, "read failed");
                break;
            }
        }
    }

    let _ = handle.teardown(&ctx.registry);
    if let Err(e) = outbound.await {
        warn!(session_id = %handle.id, error = %e, "outbound task panicked");
    }
    info!(
        session_id = %handle.id,
        last_state = ?state,
        duration_ms = handle.age().as_millis(),
        dropped = handle.drop_count(),
        "session closed"
    );
    SessionState::Closed
}

/// Parse and dispatch one text frame, replying with an `error` frame on
/// failure.
async fn handle_text(
    text: &str,
    state: &mut SessionState,
    handle: &Arc<SessionHandle>,
    ctx: &SessionContext,
) {
    let result = match parse_frame(text) {
        Ok(frame) => dispatch(frame, state, handle, ctx).await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        reply_error(handle, &e).await;
    }
}

async fn reply_error(handle: &SessionHandle, err: &RelayError) {
    counter!(FRAME_ERRORS_TOTAL, "kind" => err.kind().as_str()).increment(1);
    debug!(session_id = %handle.id, error = %err, "rejecting frame");
    let _ = handle.send_frame(&OutboundFrame::error(err)).await;
}

async fn dispatch(
    frame: InboundFrame,
    state: &mut SessionState,
    handle: &Arc<SessionHandle>,
    ctx: &SessionContext,
) -> Result<(), RelayError> {
    let authenticated = matches!(state, SessionState::Authenticated(_));
    match frame {
        InboundFrame::Ping => {
            let _ = handle.send_frame(&OutboundFrame::Pong).await;
            Ok(())
        }
        InboundFrame::Pong => Ok(()),
        InboundFrame::Unknown => Err(RelayError::UnknownType),

        InboundFrame::Action(_) if authenticated => Err(RelayError::AlreadyAuthenticated),
        InboundFrame::Action(request) => handle_action(request, state, handle, ctx).await,

        InboundFrame::Message(_) | InboundFrame::History(_) | InboundFrame::Chats(_)
            if !authenticated =>
        {
            Err(RelayError::NotAuthenticated)
        }
        InboundFrame::Message(request) => {
            let _ = ctx.pipeline.send(request).await?;
            Ok(())
        }
        InboundFrame::History(request) => {
            let messages = ctx
                .pipeline
                .history(&request.token, &request.chat_with, request.limit)
                .await?;
            for message in &messages {
                let frame = OutboundFrame::Message(MessageFrame::from(message));
                if !handle.send_frame(&frame).await {
                    break;
                }
            }
            Ok(())
        }
        InboundFrame::Chats(request) => {
            let chats = ctx.pipeline.chats(&request.token).await?;
            let _ = handle.send_frame(&OutboundFrame::Chats { chats }).await;
            Ok(())
        }
    }
}

async fn handle_action(
    request: ActionRequest,
    state: &mut SessionState,
    handle: &Arc<SessionHandle>,
    ctx: &SessionContext,
) -> Result<(), RelayError> {
    let identity = Identity::from(request.username);
    match request.action {
        ActionKind::Register => {
            ctx.credentials.register(&identity, &request.password).await?;
            let _ = handle.send_frame(&OutboundFrame::register_ok()).await;
            Ok(())
        }
        ActionKind::Login => {
            let token = ctx.credentials.login(&identity, &request.password).await?;
            let _ = handle.send_frame(&OutboundFrame::login_ok(token)).await;
            if !handle.authenticate(identity.clone(), &ctx.registry) {
                return Ok(());
            }
            info!(session_id = %handle.id, %identity, "session authenticated");
            *state = SessionState::Authenticated(identity.clone());
            let _ = ctx.pipeline.replay_backlog(&identity, handle).await?;
            Ok(())
        }
        ActionKind::Unknown => Err(RelayError::UnknownAction),
    }
}
