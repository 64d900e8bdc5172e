//! Per-connection session handle.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use relay_core::Identity;
use relay_core::ids::SessionId;
use relay_core::protocol::OutboundFrame;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::presence::PresenceRegistry;

/// Shared handle to one live connection.
///
/// The read loop, the outbound task and the delivery pipeline each hold an
/// `Arc` to it. Frames are queued on a bounded channel drained by the
/// outbound task, which owns the socket sink.
pub struct SessionHandle {
    /// Unique session ID.
    pub id: SessionId,
    /// Bound identity (set once, on login).
    identity: Mutex<Option<Identity>>,
    /// Peer address, when the listener provided one.
    pub remote_addr: Option<SocketAddr>,
    /// When this connection was established.
    pub connected_at: Instant,
    tx: mpsc::Sender<Arc<String>>,
    closed: AtomicBool,
    cancel: CancellationToken,
    /// Count of frames dropped due to a full or closed queue.
    pub dropped_messages: AtomicU64,
}

impl SessionHandle {
    /// Create a handle and the receiving end of its outbound queue.
    pub fn new(
        remote_addr: Option<SocketAddr>,
        queue_capacity: usize,
    ) -> (Self, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let handle = Self {
            id: SessionId::new(),
            identity: Mutex::new(None),
            remote_addr,
            connected_at: Instant::now(),
            tx,
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            dropped_messages: AtomicU64::new(0),
        };
        (handle, rx)
    }

    /// Identity bound by a successful login, if any.
    pub fn identity(&self) -> Option<Identity> {
        self.identity.lock().clone()
    }

    /// Whether teardown has started.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once teardown has started.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Queue a frame without waiting.
    ///
    /// Returns `false` if the session is closed or its queue is full, and
    /// increments the dropped message counter.
    pub fn push(&self, frame: Arc<String>) -> bool {
        if !self.is_closed() && self.tx.try_send(frame).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Queue a frame, waiting for room.
    ///
    /// Used for replies to this session's own requests, where waiting only
    /// slows the requester. Gives up when the session is torn down.
    pub async fn enqueue(&self, frame: Arc<String>) -> bool {
        if self.is_closed() {
            return false;
        }
        tokio::select! {
            sent = self.tx.send(frame) => sent.is_ok(),
            () = self.cancel.cancelled() => false,
        }
    }

    /// Encode and queue a frame, waiting for room.
    pub async fn send_frame(&self, frame: &OutboundFrame) -> bool {
        match frame.encode() {
            Ok(text) => self.enqueue(text).await,
            Err(e) => {
                error!(session_id = %self.id, error = %e, "failed to encode outbound frame");
                false
            }
        }
    }

    /// Bind `identity` and publish this session in the registry.
    ///
    /// Returns `false` without registering if the session is already closed
    /// or already bound. The identity lock is held across registration so a
    /// concurrent [`teardown`](Self::teardown) either sees the binding or
    /// prevents it.
    pub fn authenticate(self: &Arc<Self>, identity: Identity, registry: &PresenceRegistry) -> bool {
        let mut bound = self.identity.lock();
        if self.is_closed() || bound.is_some() {
            return false;
        }
        registry.register(identity.clone(), Arc::clone(self));
        *bound = Some(identity);
        true
    }

    /// Close the session exactly once.
    ///
    /// Cancels the session token (stopping the outbound task, which closes
    /// the sink) and removes the session from the registry if it was bound.
    /// Returns `false` if teardown already ran.
    pub fn teardown(&self, registry: &PresenceRegistry) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.cancel.cancel();

        let bound = self.identity.lock();
        if let Some(identity) = bound.as_ref() {
            let _ = registry.deregister(identity, &self.id);
        }
        debug!(session_id = %self.id, identity = ?bound.as_ref(), "session torn down");
        true
    }

    /// Total frames dropped for this session.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}
