//! Message shapes exchanged between the delivery pipeline and the message log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::{Identity, MessageId};

/// A chat message as submitted by a sender, before it is persisted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Declared sender.
    pub from: Identity,
    /// Recipient.
    pub to: Identity,
    /// Free-form content type, e.g. `text` or `image`.
    pub content_type: String,
    /// Payload. Binary content travels as an upload URL.
    pub content: String,
}

/// A message as stored in the message log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    /// Log-assigned identifier.
    pub id: MessageId,
    /// Sender, recipient and payload.
    #[serde(flatten)]
    pub envelope: Envelope,
    /// When the message was appended.
    pub sent_at: DateTime<Utc>,
    /// Whether at least one live delivery attempt completed.
    pub delivered: bool,
    /// When `delivered` flipped to true.
    pub delivered_at: Option<DateTime<Utc>>,
}

/// Most recent activity between the requester and one peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSummary {
    /// The other participant.
    pub with: Identity,
    /// Content of the newest message in the conversation.
    pub last_message: String,
    /// Timestamp of the newest message.
    pub updated_at: DateTime<Utc>,
}

/// Sort messages oldest first, using the log id to break timestamp ties.
pub fn sort_chronologically(messages: &mut [StoredMessage]) {
    messages.sort_by(|a, b| a.sent_at.cmp(&b.sent_at).then(a.id.cmp(&b.id)));
}
