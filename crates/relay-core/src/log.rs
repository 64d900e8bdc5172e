//! Message log boundary.

use crate::errors::LogError;
use crate::identity::{Identity, MessageId};
use crate::messages::{ChatSummary, Envelope, StoredMessage};

/// Durable append-only store of messages.
///
/// Implementations are synchronous; the relay calls them inline from its
/// tasks and keeps each call short.
pub trait MessageLog: Send + Sync {
    /// Persist a message with `delivered = false` and refresh the pair's
    /// conversation summary.
    fn append(&self, envelope: &Envelope) -> Result<MessageId, LogError>;

    /// Flip `delivered` to true for every listed id. Already delivered ids
    /// are left untouched.
    fn mark_delivered(&self, ids: &[MessageId]) -> Result<(), LogError>;

    /// Undelivered messages addressed to `recipient`, oldest first.
    fn list_undelivered(&self, recipient: &Identity) -> Result<Vec<StoredMessage>, LogError>;

    /// The most recent `limit` messages between `a` and `b` in either
    /// direction. Ordering is unspecified.
    fn list_history(
        &self,
        a: &Identity,
        b: &Identity,
        limit: u32,
    ) -> Result<Vec<StoredMessage>, LogError>;

    /// Conversation summaries for `identity`, newest first.
    fn list_chats(&self, identity: &Identity) -> Result<Vec<ChatSummary>, LogError>;
}
