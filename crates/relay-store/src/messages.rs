//! `SQLite` message log and conversation summaries.

use chrono::Utc;
use tracing::{instrument, warn};

use relay_core::log::MessageLog;
use relay_core::messages::{ChatSummary, Envelope, StoredMessage};
use relay_core::{Identity, LogError, MessageId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

const SELECT_COLUMNS: &str =
    "SELECT id, sender, recipient, content_type, content, sent_at, delivered, delivered_at FROM messages";

/// Message log backed by the `messages` and `conversations` tables.
#[derive(Clone)]
pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    /// Wrap a database handle.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a message and refresh the conversation summary.
    ///
    /// A failed summary upsert is logged and does not fail the insert.
    #[instrument(skip(self, envelope), fields(from = %envelope.from, to = %envelope.to))]
    pub fn insert(&self, envelope: &Envelope) -> Result<MessageId, StoreError> {
        let now = row_helpers::format_timestamp(Utc::now());

        self.db.with_conn(|conn| {
            let _ = conn.execute(
                "INSERT INTO messages (sender, recipient, content_type, content, sent_at, delivered)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0)",
                rusqlite::params![
                    envelope.from.as_str(),
                    envelope.to.as_str(),
                    envelope.content_type,
                    envelope.content,
                    now,
                ],
            )?;
            let id = MessageId(conn.last_insert_rowid());

            let (user1, user2) = ordered_pair(&envelope.from, &envelope.to);
            if let Err(e) = conn.execute(
                "INSERT INTO conversations (user1, user2, last_message, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(user1, user2) DO UPDATE SET
                     last_message = excluded.last_message,
                     updated_at = excluded.updated_at",
                rusqlite::params![user1, user2, envelope.content, now],
            ) {
                warn!(error = %e, message_id = %id, "conversation summary upsert failed");
            }

            Ok(id)
        })
    }

    /// Mark messages delivered in one transaction.
    #[instrument(skip(self, ids), fields(count = ids.len()))]
    pub fn set_delivered(&self, ids: &[MessageId]) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let now = row_helpers::format_timestamp(Utc::now());

        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let mut updated = 0;
            {
                let mut stmt = tx.prepare(
                    "UPDATE messages SET delivered = 1, delivered_at = ?1
                     WHERE id = ?2 AND delivered = 0",
                )?;
                for id in ids {
                    updated += stmt.execute(rusqlite::params![now, id.0])?;
                }
            }
            tx.commit()?;
            Ok(updated)
        })
    }

    /// Fetch one message by id.
    pub fn get(&self, id: MessageId) -> Result<StoredMessage, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} WHERE id = ?1"))?;
            let mut rows = stmt.query([id.0])?;
            match rows.next()? {
                Some(row) => row_to_message(row),
                None => Err(StoreError::NotFound(format!("message {id}"))),
            }
        })
    }

    /// Undelivered messages for `recipient`, oldest first.
    #[instrument(skip(self), fields(recipient = %recipient))]
    pub fn undelivered(&self, recipient: &Identity) -> Result<Vec<StoredMessage>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_COLUMNS} WHERE recipient = ?1 AND delivered = 0 ORDER BY sent_at ASC, id ASC"
            ))?;
            let mut rows = stmt.query([recipient.as_str()])?;
            collect_messages(&mut rows)
        })
    }

    /// Newest `limit` messages between `a` and `b`, newest first.
    #[instrument(skip(self), fields(a = %a, b = %b))]
    pub fn between(
        &self,
        a: &Identity,
        b: &Identity,
        limit: u32,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_COLUMNS}
                 WHERE (sender = ?1 AND recipient = ?2) OR (sender = ?2 AND recipient = ?1)
                 ORDER BY sent_at DESC, id DESC
                 LIMIT ?3"
            ))?;
            let mut rows = stmt.query(rusqlite::params![a.as_str(), b.as_str(), limit])?;
            collect_messages(&mut rows)
        })
    }

    /// Conversation summaries involving `identity`, newest first.
    #[instrument(skip(self), fields(identity = %identity))]
    pub fn conversations(&self, identity: &Identity) -> Result<Vec<ChatSummary>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT CASE WHEN user1 = ?1 THEN user2 ELSE user1 END AS peer,
                        last_message, updated_at
                 FROM conversations
                 WHERE user1 = ?1 OR user2 = ?1
                 ORDER BY updated_at DESC, rowid DESC",
            )?;
            let mut rows = stmt.query([identity.as_str()])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let peer: String = row_helpers::get(row, 0, "conversations", "peer")?;
                let updated_at: String = row_helpers::get(row, 2, "conversations", "updated_at")?;
                out.push(ChatSummary {
                    with: Identity::from(peer),
                    last_message: row_helpers::get(row, 1, "conversations", "last_message")?,
                    updated_at: row_helpers::parse_timestamp(
                        &updated_at,
                        "conversations",
                        "updated_at",
                    )?,
                });
            }
            Ok(out)
        })
    }
}

impl MessageLog for MessageRepo {
    fn append(&self, envelope: &Envelope) -> Result<MessageId, LogError> {
        Ok(self.insert(envelope)?)
    }

    fn mark_delivered(&self, ids: &[MessageId]) -> Result<(), LogError> {
        let _ = self.set_delivered(ids)?;
        Ok(())
    }

    fn list_undelivered(&self, recipient: &Identity) -> Result<Vec<StoredMessage>, LogError> {
        Ok(self.undelivered(recipient)?)
    }

    fn list_history(
        &self,
        a: &Identity,
        b: &Identity,
        limit: u32,
    ) -> Result<Vec<StoredMessage>, LogError> {
        Ok(self.between(a, b, limit)?)
    }

    fn list_chats(&self, identity: &Identity) -> Result<Vec<ChatSummary>, LogError> {
        Ok(self.conversations(identity)?)
    }
}

fn ordered_pair<'a>(a: &'a Identity, b: &'a Identity) -> (&'a str, &'a str) {
    if a <= b {
        (a.as_str(), b.as_str())
    } else {
        (b.as_str(), a.as_str())
    }
}

fn collect_messages(rows: &mut rusqlite::Rows<'_>) -> Result<Vec<StoredMessage>, StoreError> {
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(row_to_message(row)?);
    }
    Ok(out)
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<StoredMessage, StoreError> {
    let sender: String = row_helpers::get(row, 1, "messages", "sender")?;
    let recipient: String = row_helpers::get(row, 2, "messages", "recipient")?;
    let sent_at: String = row_helpers::get(row, 5, "messages", "sent_at")?;
    let delivered_at: Option<String> = row_helpers::get_opt(row, 7, "messages", "delivered_at")?;

    Ok(StoredMessage {
        id: MessageId(row_helpers::get(row, 0, "messages", "id")?),
        envelope: Envelope {
            from: Identity::from(sender),
            to: Identity::from(recipient),
            content_type: row_helpers::get(row, 3, "messages", "content_type")?,
            content: row_helpers::get(row, 4, "messages", "content")?,
        },
        sent_at: row_helpers::parse_timestamp(&sent_at, "messages", "sent_at")?,
        delivered: row_helpers::get(row, 6, "messages", "delivered")?,
        delivered_at: delivered_at
            .map(|raw| row_helpers::parse_timestamp(&raw, "messages", "delivered_at"))
            .transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> MessageRepo {
        MessageRepo::new(Database::in_memory().unwrap())
    }

    fn env(from: &str, to: &str, content: &str) -> Envelope {
        Envelope {
            from: from.into(),
            to: to.into(),
            content_type: "text".into(),
            content: content.into(),
        }
    }

    #[test]
    fn append_starts_undelivered() {
        let repo = setup();
        let id = repo.append(&env("bob", "alice", "hi")).unwrap();
        let msg = repo.get(id).unwrap();
        assert!(!msg.delivered);
        assert!(msg.delivered_at.is_none());
        assert_eq!(msg.envelope.content, "hi");
    }

    #[test]
    fn undelivered_in_send_order_for_recipient_only() {
        let repo = setup();
        let first = repo.append(&env("bob", "alice", "1")).unwrap();
        let _ = repo.append(&env("alice", "bob", "not for alice")).unwrap();
        let second = repo.append(&env("carol", "alice", "2")).unwrap();

        let pending = repo.list_undelivered(&"alice".into()).unwrap();
        let ids: Vec<MessageId> = pending.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![first, second]);
    }

    #[test]
    fn mark_delivered_is_monotonic() {
        let repo = setup();
        let id = repo.append(&env("bob", "alice", "hi")).unwrap();

        assert_eq!(repo.set_delivered(&[id]).unwrap(), 1);
        let first = repo.get(id).unwrap();
        assert!(first.delivered);
        let stamped = first.delivered_at.unwrap();

        // Second mark is a no-op and keeps the original timestamp.
        assert_eq!(repo.set_delivered(&[id]).unwrap(), 0);
        assert_eq!(repo.get(id).unwrap().delivered_at, Some(stamped));
        assert!(repo.list_undelivered(&"alice".into()).unwrap().is_empty());
    }

    #[test]
    fn mark_delivered_batch() {
        let repo = setup();
        let ids: Vec<MessageId> = (0..5)
            .map(|i| repo.append(&env("bob", "alice", &i.to_string())).unwrap())
            .collect();
        repo.mark_delivered(&ids[..3]).unwrap();
        let pending = repo.list_undelivered(&"alice".into()).unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, ids[3]);
    }

    #[test]
    fn mark_delivered_empty_is_noop() {
        let repo = setup();
        assert_eq!(repo.set_delivered(&[]).unwrap(), 0);
    }

    #[test]
    fn history_covers_both_directions_and_limits() {
        let repo = setup();
        for i in 0..6 {
            let (from, to) = if i % 2 == 0 { ("alice", "bob") } else { ("bob", "alice") };
            let _ = repo.append(&env(from, to, &format!("m{i}"))).unwrap();
        }
        let _ = repo.append(&env("alice", "carol", "elsewhere")).unwrap();

        let history = repo.list_history(&"alice".into(), &"bob".into(), 4).unwrap();
        assert_eq!(history.len(), 4);
        // Newest first from the store.
        assert_eq!(history[0].envelope.content, "m5");
        assert!(history.iter().all(|m| {
            let pair = (m.envelope.from.as_str(), m.envelope.to.as_str());
            pair == ("alice", "bob") || pair == ("bob", "alice")
        }));
    }

    #[test]
    fn history_does_not_touch_delivery() {
        let repo = setup();
        let id = repo.append(&env("bob", "alice", "hi")).unwrap();
        let _ = repo.list_history(&"alice".into(), &"bob".into(), 10).unwrap();
        assert!(!repo.get(id).unwrap().delivered);
    }

    #[test]
    fn conversations_track_latest_message_per_pair() {
        let repo = setup();
        let _ = repo.append(&env("alice", "bob", "first")).unwrap();
        let _ = repo.append(&env("bob", "alice", "reply")).unwrap();
        let _ = repo.append(&env("carol", "alice", "hey")).unwrap();

        let chats = repo.list_chats(&"alice".into()).unwrap();
        assert_eq!(chats.len(), 2);
        assert_eq!(chats[0].with, Identity::from("carol"));
        assert_eq!(chats[0].last_message, "hey");
        assert_eq!(chats[1].with, Identity::from("bob"));
        assert_eq!(chats[1].last_message, "reply");

        let bob_chats = repo.list_chats(&"bob".into()).unwrap();
        assert_eq!(bob_chats.len(), 1);
        assert_eq!(bob_chats[0].with, Identity::from("alice"));
    }

    #[test]
    fn get_missing_is_not_found() {
        let repo = setup();
        assert!(matches!(repo.get(MessageId(99)), Err(StoreError::NotFound(_))));
    }
}
