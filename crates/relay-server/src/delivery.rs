//! Delivery pipeline: persist, fan out to live sessions, replay backlogs.

use std::sync::Arc;

use metrics::counter;
use relay_core::credentials::CredentialStore;
use relay_core::log::MessageLog;
use relay_core::messages::{ChatSummary, StoredMessage, sort_chronologically};
use relay_core::protocol::{MessageFrame, OutboundFrame, SendRequest};
use relay_core::{Identity, MessageId, RelayError};
use tracing::{debug, instrument, warn};

use crate::config::ServerConfig;
use crate::metrics::{
    BACKLOG_REPLAYED_TOTAL, DELIVERY_MISSES_TOTAL, DELIVERY_PUSHES_TOTAL, MESSAGES_SENT_TOTAL,
    PERSISTENCE_FAILURES_TOTAL,
};
use crate::presence::PresenceRegistry;
use crate::websocket::connection::SessionHandle;

/// Outcome of one [`DeliveryPipeline::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Log id, or `None` if persisting failed.
    pub message_id: Option<MessageId>,
    /// Sessions whose queue accepted the frame.
    pub pushed: usize,
    /// Sessions whose queue was full or closed.
    pub missed: usize,
    /// Whether the message was flagged delivered in the log.
    pub marked_delivered: bool,
}

/// Routes messages from senders to every live session of the recipient.
pub struct DeliveryPipeline {
    log: Arc<dyn MessageLog>,
    registry: Arc<PresenceRegistry>,
    credentials: Arc<dyn CredentialStore>,
    config: ServerConfig,
}

impl DeliveryPipeline {
    /// Create a pipeline.
    pub fn new(
        log: Arc<dyn MessageLog>,
        registry: Arc<PresenceRegistry>,
        credentials: Arc<dyn CredentialStore>,
        config: ServerConfig,
    ) -> Self {
        Self {
            log,
            registry,
            credentials,
            config,
        }
    }

    /// Deliver a chat message.
    ///
    /// The token must name the declared sender. Persistence is best-effort:
    /// a failed append is logged and the message is still pushed to live
    /// sessions, but then never marked delivered.
    #[instrument(skip_all, fields(from = %request.from, to = %request.to))]
    pub async fn send(&self, request: SendRequest) -> Result<DeliveryReport, RelayError> {
        let (envelope, token) = request.into_parts();
        let holder = self.credentials.validate_token(&token).await?;
        if holder != envelope.from {
            warn!(token_identity = %holder, "sender does not match token");
            return Err(RelayError::SenderMismatch);
        }

        let message_id = match self.log.append(&envelope) {
            Ok(id) => Some(id),
            Err(e) => {
                counter!(PERSISTENCE_FAILURES_TOTAL, "op" => "append").increment(1);
                warn!(error = %e, "failed to persist message, delivering anyway");
                None
            }
        };
        counter!(MESSAGES_SENT_TOTAL).increment(1);

        let frame = OutboundFrame::Message(MessageFrame::from(&envelope)).encode()?;
        let (pushed, missed) = self.fan_out(&envelope.to, &frame);

        let marked_delivered = match message_id {
            Some(id) if pushed > 0 => match self.log.mark_delivered(&[id]) {
                Ok(()) => true,
                Err(e) => {
                    counter!(PERSISTENCE_FAILURES_TOTAL, "op" => "mark_delivered").increment(1);
                    warn!(%id, error = %e, "failed to mark message delivered");
                    false
                }
            },
            _ => false,
        };

        let report = DeliveryReport {
            message_id,
            pushed,
            missed,
            marked_delivered,
        };
        debug!(?report, "message routed");
        Ok(report)
    }

    /// Push an encoded frame to every live session of `recipient`.
    ///
    /// Returns `(pushed, missed)`.
    fn fan_out(&self, recipient: &Identity, frame: &Arc<String>) -> (usize, usize) {
        let sessions = self.registry.sessions_for(recipient);
        let mut pushed = 0;
        let mut missed = 0;
        for session in &sessions {
            if session.push(Arc::clone(frame)) {
                pushed += 1;
            } else {
                missed += 1;
                debug!(session_id = %session.id, "push missed");
            }
        }
        counter!(DELIVERY_PUSHES_TOTAL).increment(pushed as u64);
        counter!(DELIVERY_MISSES_TOTAL).increment(missed as u64);
        (pushed, missed)
    }

    /// Send `identity`'s undelivered messages to a freshly logged-in session.
    ///
    /// Messages go out oldest first, to this session only. Every message the
    /// session accepted is then marked delivered in one batch. Returns the
    /// number replayed.
    #[instrument(skip_all, fields(%identity, session_id = %session.id))]
    pub async fn replay_backlog(
        &self,
        identity: &Identity,
        session: &SessionHandle,
    ) -> Result<usize, RelayError> {
        let backlog = self.log.list_undelivered(identity).inspect_err(|_| {
            counter!(PERSISTENCE_FAILURES_TOTAL, "op" => "list_undelivered").increment(1);
        })?;
        if backlog.is_empty() {
            return Ok(0);
        }

        let mut replayed = Vec::with_capacity(backlog.len());
        for message in &backlog {
            let frame = OutboundFrame::Message(MessageFrame::from(message)).encode()?;
            if !session.enqueue(frame).await {
                debug!("session closed during replay");
                break;
            }
            replayed.push(message.id);
        }

        if !replayed.is_empty() {
            if let Err(e) = self.log.mark_delivered(&replayed) {
                counter!(PERSISTENCE_FAILURES_TOTAL, "op" => "mark_delivered").increment(1);
                warn!(count = replayed.len(), error = %e, "failed to mark backlog delivered");
            }
        }
        counter!(BACKLOG_REPLAYED_TOTAL).increment(replayed.len() as u64);
        debug!(count = replayed.len(), "backlog replayed");
        Ok(replayed.len())
    }

    /// The most recent messages between the token holder and `peer`,
    /// oldest first.
    pub async fn history(
        &self,
        token: &str,
        peer: &Identity,
        limit: Option<u32>,
    ) -> Result<Vec<StoredMessage>, RelayError> {
        let requester = self.credentials.validate_token(token).await?;
        let limit = self.config.history_limit(limit);
        let mut messages = self.log.list_history(&requester, peer, limit)?;
        sort_chronologically(&mut messages);
        Ok(messages)
    }

    /// Conversation summaries for the token holder, newest first.
    pub async fn chats(&self, token: &str) -> Result<Vec<ChatSummary>, RelayError> {
        let requester = self.credentials.validate_token(token).await?;
        Ok(self.log.list_chats(&requester)?)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use parking_lot::Mutex;
    use relay_core::credentials::BearerToken;
    use relay_core::messages::Envelope;
    use relay_core::{CredentialError, LogError};
    use tokio::sync::mpsc;

    /// Tokens are `tok:<username>`.
    pub(crate) struct StaticCredentials;

    #[async_trait]
    impl CredentialStore for StaticCredentials {
        async fn register(&self, identity: &Identity, _secret: &str) -> Result<(), CredentialError> {
            if identity.as_str() == "taken" {
                return Err(CredentialError::UsernameTaken);
            }
            Ok(())
        }

        async fn login(&self, identity: &Identity, secret: &str) -> Result<BearerToken, CredentialError> {
            if secret == "pw" {
                Ok(format!("tok:{identity}"))
            } else {
                Err(CredentialError::InvalidCredentials)
            }
        }

        async fn validate_token(&self, token: &str) -> Result<Identity, CredentialError> {
            token
                .strip_prefix("tok:")
                .map(Identity::from)
                .ok_or(CredentialError::InvalidToken)
        }
    }

    /// In-memory message log. `fail` makes every call error.
    #[derive(Default)]
    pub(crate) struct MemoryLog {
        pub(crate) rows: Mutex<Vec<StoredMessage>>,
        pub(crate) fail: bool,
    }

    impl MemoryLog {
        fn check(&self) -> Result<(), LogError> {
            if self.fail {
                Err(LogError("disk on fire".into()))
            } else {
                Ok(())
            }
        }

        pub(crate) fn delivered(&self, id: MessageId) -> bool {
            self.rows.lock().iter().any(|m| m.id == id && m.delivered)
        }
    }

    impl MessageLog for MemoryLog {
        fn append(&self, envelope: &Envelope) -> Result<MessageId, LogError> {
            self.check()?;
            let mut rows = self.rows.lock();
            let id = MessageId(rows.len() as i64 + 1);
            rows.push(StoredMessage {
                id,
                envelope: envelope.clone(),
                sent_at: Utc::now() + ChronoDuration::milliseconds(id.0),
                delivered: false,
                delivered_at: None,
            });
            Ok(id)
        }

        fn mark_delivered(&self, ids: &[MessageId]) -> Result<(), LogError> {
            self.check()?;
            for row in self.rows.lock().iter_mut() {
                if ids.contains(&row.id) && !row.delivered {
                    row.delivered = true;
                    row.delivered_at = Some(Utc::now());
                }
            }
            Ok(())
        }

        fn list_undelivered(&self, recipient: &Identity) -> Result<Vec<StoredMessage>, LogError> {
            self.check()?;
            let mut out: Vec<_> = self
                .rows
                .lock()
                .iter()
                .filter(|m| &m.envelope.to == recipient && !m.delivered)
                .cloned()
                .collect();
            sort_chronologically(&mut out);
            Ok(out)
        }

        fn list_history(
            &self,
            a: &Identity,
            b: &Identity,
            limit: u32,
        ) -> Result<Vec<StoredMessage>, LogError> {
            self.check()?;
            let mut out: Vec<_> = self
                .rows
                .lock()
                .iter()
                .filter(|m| {
                    (&m.envelope.from == a && &m.envelope.to == b)
                        || (&m.envelope.from == b && &m.envelope.to == a)
                })
                .cloned()
                .collect();
            out.reverse();
            out.truncate(limit as usize);
            Ok(out)
        }

        fn list_chats(&self, identity: &Identity) -> Result<Vec<ChatSummary>, LogError> {
            self.check()?;
            let mut out: Vec<ChatSummary> = Vec::new();
            for m in self.rows.lock().iter().rev() {
                let peer = if &m.envelope.from == identity {
                    &m.envelope.to
                } else if &m.envelope.to == identity {
                    &m.envelope.from
                } else {
                    continue;
                };
                if out.iter().all(|c| &c.with != peer) {
                    out.push(ChatSummary {
                        with: peer.clone(),
                        last_message: m.envelope.content.clone(),
                        updated_at: m.sent_at,
                    });
                }
            }
            Ok(out)
        }
    }

    fn pipeline(log: Arc<MemoryLog>) -> (DeliveryPipeline, Arc<PresenceRegistry>) {
        let registry = Arc::new(PresenceRegistry::new());
        let pipeline = DeliveryPipeline::new(
            log,
            registry.clone(),
            Arc::new(StaticCredentials),
            ServerConfig::default(),
        );
        (pipeline, registry)
    }

    fn online(
        registry: &PresenceRegistry,
        identity: &str,
        capacity: usize,
    ) -> (Arc<SessionHandle>, mpsc::Receiver<Arc<String>>) {
        let (handle, rx) = SessionHandle::new(None, capacity);
        let handle = Arc::new(handle);
        assert!(handle.authenticate(identity.into(), registry));
        (handle, rx)
    }

    fn request(from: &str, to: &str, content: &str) -> SendRequest {
        SendRequest {
            from: from.into(),
            to: to.into(),
            content_type: "text".into(),
            content: content.into(),
            token: format!("tok:{from}"),
        }
    }

    #[tokio::test]
    async fn offline_recipient_stays_undelivered() {
        let log = Arc::new(MemoryLog::default());
        let (pipeline, _registry) = pipeline(log.clone());

        let report = pipeline.send(request("alice", "bob", "hi")).await.unwrap();
        assert_eq!(report.pushed, 0);
        assert!(!report.marked_delivered);
        let id = report.message_id.unwrap();
        assert!(!log.delivered(id));
    }

    #[tokio::test]
    async fn online_recipient_gets_every_session() {
        let log = Arc::new(MemoryLog::default());
        let (pipeline, registry) = pipeline(log.clone());
        let (_a, mut rx_a) = online(&registry, "bob", 8);
        let (_b, mut rx_b) = online(&registry, "bob", 8);

        let report = pipeline.send(request("alice", "bob", "hi")).await.unwrap();
        assert_eq!(report.pushed, 2);
        assert_eq!(report.missed, 0);
        assert!(report.marked_delivered);
        assert!(log.delivered(report.message_id.unwrap()));

        let expected = r#"{"type":"message","from":"alice","to":"bob","contentType":"text","content":"hi"}"#;
        assert_eq!(&*rx_a.recv().await.unwrap(), expected);
        assert_eq!(&*rx_b.recv().await.unwrap(), expected);
    }

    #[tokio::test]
    async fn full_queue_is_a_miss_not_an_error() {
        let log = Arc::new(MemoryLog::default());
        let (pipeline, registry) = pipeline(log.clone());
        let (full, _rx_full) = online(&registry, "bob", 1);
        assert!(full.push(Arc::new("filler".into())));
        let (_ok, mut rx_ok) = online(&registry, "bob", 8);

        let report = pipeline.send(request("alice", "bob", "hi")).await.unwrap();
        assert_eq!(report.pushed, 1);
        assert_eq!(report.missed, 1);
        assert!(report.marked_delivered);
        assert!(rx_ok.recv().await.is_some());
    }

    #[tokio::test]
    async fn all_misses_leave_message_undelivered() {
        let log = Arc::new(MemoryLog::default());
        let (pipeline, registry) = pipeline(log.clone());
        let (session, rx) = online(&registry, "bob", 8);
        drop(rx);

        let report = pipeline.send(request("alice", "bob", "hi")).await.unwrap();
        assert_eq!(report.pushed, 0);
        assert_eq!(report.missed, 1);
        assert!(!report.marked_delivered);
        assert!(!log.delivered(report.message_id.unwrap()));
        drop(session);
    }

    #[tokio::test]
    async fn sender_mismatch_is_rejected_before_persisting() {
        let log = Arc::new(MemoryLog::default());
        let (pipeline, registry) = pipeline(log.clone());
        let (_bob, mut rx) = online(&registry, "bob", 8);

        let mut req = request("alice", "bob", "spoofed");
        req.token = "tok:mallory".into();
        let err = pipeline.send(req).await.unwrap_err();
        assert!(matches!(err, RelayError::SenderMismatch));
        assert!(log.rows.lock().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn invalid_token_is_rejected() {
        let log = Arc::new(MemoryLog::default());
        let (pipeline, _registry) = pipeline(log.clone());
        let mut req = request("alice", "bob", "hi");
        req.token = "garbage".into();
        let err = pipeline.send(req).await.unwrap_err();
        assert!(matches!(
            err,
            RelayError::Credential(CredentialError::InvalidToken)
        ));
        assert!(log.rows.lock().is_empty());
    }

    #[tokio::test]
    async fn failed_append_still_delivers() {
        let log = Arc::new(MemoryLog {
            fail: true,
            ..MemoryLog::default()
        });
        let (pipeline, registry) = pipeline(log);
        let (_bob, mut rx) = online(&registry, "bob", 8);

        let report = pipeline.send(request("alice", "bob", "hi")).await.unwrap();
        assert_eq!(report.message_id, None);
        assert_eq!(report.pushed, 1);
        assert!(!report.marked_delivered);
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn replay_sends_backlog_oldest_first_and_marks_it() {
        let log = Arc::new(MemoryLog::default());
        let (pipeline, registry) = pipeline(log.clone());
        for body in ["one", "two", "three"] {
            let _ = pipeline.send(request("alice", "bob", body)).await.unwrap();
        }

        let (session, mut rx) = online(&registry, "bob", 8);
        let count = pipeline
            .replay_backlog(&"bob".into(), &session)
            .await
            .unwrap();
        assert_eq!(count, 3);

        for body in ["one", "two", "three"] {
            let frame: serde_json::Value =
                serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
            assert_eq!(frame["type"], "message");
            assert_eq!(frame["content"], body);
        }
        assert!(log.list_undelivered(&"bob".into()).unwrap().is_empty());

        // Nothing left for a second login.
        let again = pipeline
            .replay_backlog(&"bob".into(), &session)
            .await
            .unwrap();
        assert_eq!(again, 0);
    }

    #[tokio::test]
    async fn replay_only_marks_accepted_frames() {
        let log = Arc::new(MemoryLog::default());
        let (pipeline, registry) = pipeline(log.clone());
        for body in ["one", "two"] {
            let _ = pipeline.send(request("alice", "bob", body)).await.unwrap();
        }

        let (session, _rx) = online(&registry, "bob", 8);
        let _ = session.teardown(&registry);
        let count = pipeline
            .replay_backlog(&"bob".into(), &session)
            .await
            .unwrap();
        assert_eq!(count, 0);
        assert_eq!(log.list_undelivered(&"bob".into()).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn replay_surfaces_log_failure() {
        let log = Arc::new(MemoryLog {
            fail: true,
            ..MemoryLog::default()
        });
        let (pipeline, registry) = pipeline(log);
        let (session, _rx) = online(&registry, "bob", 8);
        let err = pipeline
            .replay_backlog(&"bob".into(), &session)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Persistence(_)));
    }

    #[tokio::test]
    async fn history_is_oldest_first_and_limited() {
        let log = Arc::new(MemoryLog::default());
        let (pipeline, _registry) = pipeline(log.clone());
        for i in 0..5 {
            let (from, to) = if i % 2 == 0 { ("alice", "bob") } else { ("bob", "alice") };
            let _ = pipeline
                .send(request(from, to, &format!("m{i}")))
                .await
                .unwrap();
        }
        let _ = pipeline.send(request("alice", "carol", "other")).await.unwrap();

        let history = pipeline
            .history("tok:alice", &"bob".into(), Some(3))
            .await
            .unwrap();
        let bodies: Vec<_> = history.iter().map(|m| m.envelope.content.as_str()).collect();
        assert_eq!(bodies, ["m2", "m3", "m4"]);
        assert!(history.windows(2).all(|w| w[0].sent_at <= w[1].sent_at));
        // Reading history does not flag anything delivered.
        assert!(history.iter().all(|m| !m.delivered));
    }

    #[tokio::test]
    async fn history_requires_valid_token() {
        let (pipeline, _registry) = pipeline(Arc::new(MemoryLog::default()));
        let err = pipeline
            .history("nope", &"bob".into(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Credential(_)));
    }

    #[tokio::test]
    async fn chats_lists_newest_first() {
        let log = Arc::new(MemoryLog::default());
        let (pipeline, _registry) = pipeline(log);
        let _ = pipeline.send(request("alice", "bob", "first")).await.unwrap();
        let _ = pipeline.send(request("carol", "alice", "second")).await.unwrap();

        let chats = pipeline.chats("tok:alice").await.unwrap();
        assert_eq!(chats.len(), 2);
        assert_eq!(chats[0].with, Identity::from("carol"));
        assert_eq!(chats[0].last_message, "second");
        assert_eq!(chats[1].with, Identity::from("bob"));
    }
}
