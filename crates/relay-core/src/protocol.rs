//! Wire frames.
//!
//! Every frame is a JSON object discriminated by its `type` field. Inbound
//! text is parsed exactly once into [`InboundFrame`]; an unrecognised `type`
//! becomes [`InboundFrame::Unknown`] rather than a parse failure.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::error::Category;

use crate::errors::RelayError;
use crate::identity::Identity;
use crate::messages::{ChatSummary, Envelope, StoredMessage};

/// Acknowledgement status for successful `register` and `login` actions.
pub const STATUS_OK: &str = "ok";

/// Frame received from a client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InboundFrame {
    /// Client liveness probe; answered with `pong`.
    Ping,
    /// Answer to a server probe; ignored.
    Pong,
    /// `register` or `login`.
    Action(ActionRequest),
    /// Chat message to deliver.
    Message(SendRequest),
    /// Conversation history query.
    History(HistoryRequest),
    /// Conversation list query.
    Chats(ChatsRequest),
    /// Any other `type` value.
    #[serde(other)]
    Unknown,
}

/// Which credential action an `action` frame requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    /// Create an account.
    Register,
    /// Authenticate this session.
    Login,
    /// Anything else.
    #[serde(other)]
    Unknown,
}

/// Payload of an `action` frame.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ActionRequest {
    /// Requested action.
    pub action: ActionKind,
    /// Username.
    pub username: String,
    /// Plain-text password.
    pub password: String,
}

/// Payload of a `message` frame.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SendRequest {
    /// Declared sender; must match the token.
    pub from: Identity,
    /// Recipient.
    pub to: Identity,
    /// Content type, `text` when omitted.
    #[serde(rename = "contentType", alias = "content_type", default = "default_content_type")]
    pub content_type: String,
    /// Payload.
    pub content: String,
    /// Bearer token of the sender.
    pub token: String,
}

impl SendRequest {
    /// Split into the envelope to persist and the token to check.
    pub fn into_parts(self) -> (Envelope, String) {
        (
            Envelope {
                from: self.from,
                to: self.to,
                content_type: self.content_type,
                content: self.content,
            },
            self.token,
        )
    }
}

fn default_content_type() -> String {
    "text".to_owned()
}

/// Payload of a `history` frame.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HistoryRequest {
    /// Bearer token of the requester.
    pub token: String,
    /// The other participant.
    #[serde(rename = "chatWith", alias = "chat_with")]
    pub chat_with: Identity,
    /// Maximum number of messages; server default when omitted or zero.
    #[serde(default)]
    pub limit: Option<u32>,
}

/// Payload of a `chats` frame.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChatsRequest {
    /// Bearer token of the requester.
    pub token: String,
}

/// Parse one text frame.
pub fn parse_frame(text: &str) -> Result<InboundFrame, RelayError> {
    serde_json::from_str(text).map_err(|e| match e.classify() {
        Category::Data => RelayError::MalformedFrame,
        Category::Syntax | Category::Eof | Category::Io => RelayError::InvalidJson,
    })
}

/// A chat message as seen by its recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFrame {
    /// Sender.
    pub from: Identity,
    /// Recipient.
    pub to: Identity,
    /// Content type.
    #[serde(rename = "contentType")]
    pub content_type: String,
    /// Payload.
    pub content: String,
}

impl From<&Envelope> for MessageFrame {
    fn from(env: &Envelope) -> Self {
        Self {
            from: env.from.clone(),
            to: env.to.clone(),
            content_type: env.content_type.clone(),
            content: env.content.clone(),
        }
    }
}

impl From<&StoredMessage> for MessageFrame {
    fn from(msg: &StoredMessage) -> Self {
        Self::from(&msg.envelope)
    }
}

/// Frame sent to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundFrame {
    /// Server liveness probe.
    Ping,
    /// Answer to a client `ping`.
    Pong,
    /// Registration acknowledgement.
    Register {
        /// Always [`STATUS_OK`].
        status: String,
    },
    /// Login acknowledgement.
    Login {
        /// Always [`STATUS_OK`].
        status: String,
        /// Bearer token for subsequent frames.
        token: String,
    },
    /// Live delivery, backlog replay or history entry.
    Message(MessageFrame),
    /// Conversation list.
    Chats {
        /// Newest first.
        chats: Vec<ChatSummary>,
    },
    /// Rejected or malformed frame.
    Error {
        /// Client-safe reason.
        msg: String,
    },
}

impl OutboundFrame {
    /// Successful registration.
    pub fn register_ok() -> Self {
        Self::Register {
            status: STATUS_OK.to_owned(),
        }
    }

    /// Successful login.
    pub fn login_ok(token: impl Into<String>) -> Self {
        Self::Login {
            status: STATUS_OK.to_owned(),
            token: token.into(),
        }
    }

    /// Error frame for a relay error.
    pub fn error(err: &RelayError) -> Self {
        Self::Error {
            msg: err.client_message(),
        }
    }

    /// Serialize to shareable JSON text.
    pub fn encode(&self) -> Result<Arc<String>, serde_json::Error> {
        serde_json::to_string(self).map(Arc::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    #[test]
    fn parses_ping_and_pong() {
        assert_eq!(parse_frame(r#"{"type":"ping"}"#).unwrap(), InboundFrame::Ping);
        assert_eq!(parse_frame(r#"{"type":"pong"}"#).unwrap(), InboundFrame::Pong);
    }

    #[test]
    fn parses_register_action() {
        let frame =
            parse_frame(r#"{"type":"action","action":"register","username":"alice","password":"pw"}"#)
                .unwrap();
        let InboundFrame::Action(req) = frame else {
            panic!("expected action, got {frame:?}");
        };
        assert_eq!(req.action, ActionKind::Register);
        assert_eq!(req.username, "alice");
        assert_eq!(req.password, "pw");
    }

    #[test]
    fn unknown_action_is_a_variant() {
        let frame =
            parse_frame(r#"{"type":"action","action":"delete","username":"a","password":"b"}"#)
                .unwrap();
        assert!(matches!(
            frame,
            InboundFrame::Action(ActionRequest { action: ActionKind::Unknown, .. })
        ));
    }

    #[test]
    fn parses_message_with_camel_case_content_type() {
        let frame = parse_frame(
            r#"{"type":"message","from":"bob","to":"alice","contentType":"image","content":"/uploads/x.png","token":"t"}"#,
        )
        .unwrap();
        let InboundFrame::Message(req) = frame else {
            panic!("expected message");
        };
        assert_eq!(req.content_type, "image");
        let (env, token) = req.into_parts();
        assert_eq!(env.from, Identity::from("bob"));
        assert_eq!(env.to, Identity::from("alice"));
        assert_eq!(token, "t");
    }

    #[test]
    fn message_accepts_snake_case_and_defaults_content_type() {
        let frame = parse_frame(
            r#"{"type":"message","from":"b","to":"a","content_type":"file","content":"x","token":"t"}"#,
        )
        .unwrap();
        let InboundFrame::Message(req) = frame else {
            panic!("expected message");
        };
        assert_eq!(req.content_type, "file");

        let frame =
            parse_frame(r#"{"type":"message","from":"b","to":"a","content":"x","token":"t"}"#)
                .unwrap();
        let InboundFrame::Message(req) = frame else {
            panic!("expected message");
        };
        assert_eq!(req.content_type, "text");
    }

    #[test]
    fn parses_history_with_optional_limit() {
        let frame = parse_frame(r#"{"type":"history","token":"t","chatWith":"bob","limit":20}"#)
            .unwrap();
        assert_eq!(
            frame,
            InboundFrame::History(HistoryRequest {
                token: "t".into(),
                chat_with: "bob".into(),
                limit: Some(20),
            })
        );

        let frame = parse_frame(r#"{"type":"history","token":"t","chatWith":"bob"}"#).unwrap();
        assert!(matches!(frame, InboundFrame::History(HistoryRequest { limit: None, .. })));
    }

    #[test]
    fn parses_chats() {
        let frame = parse_frame(r#"{"type":"chats","token":"t"}"#).unwrap();
        assert_eq!(frame, InboundFrame::Chats(ChatsRequest { token: "t".into() }));
    }

    #[test]
    fn unknown_type_is_a_variant() {
        assert_eq!(
            parse_frame(r#"{"type":"typing","to":"bob"}"#).unwrap(),
            InboundFrame::Unknown
        );
    }

    #[test]
    fn invalid_json_is_distinguished_from_bad_payload() {
        assert!(matches!(parse_frame("not json"), Err(RelayError::InvalidJson)));
        assert!(matches!(parse_frame(r#"{"type":"#), Err(RelayError::InvalidJson)));
        assert!(matches!(
            parse_frame(r#"{"type":"message","from":"a"}"#),
            Err(RelayError::MalformedFrame)
        ));
        assert!(matches!(parse_frame("42"), Err(RelayError::MalformedFrame)));
    }

    #[test]
    fn outbound_unit_frames() {
        let ping: Value = serde_json::from_str(&OutboundFrame::Ping.encode().unwrap()).unwrap();
        assert_eq!(ping, json!({"type": "ping"}));
        let pong: Value = serde_json::from_str(&OutboundFrame::Pong.encode().unwrap()).unwrap();
        assert_eq!(pong, json!({"type": "pong"}));
    }

    #[test]
    fn outbound_acks() {
        let reg: Value =
            serde_json::from_str(&OutboundFrame::register_ok().encode().unwrap()).unwrap();
        assert_eq!(reg, json!({"type": "register", "status": "ok"}));

        let login: Value =
            serde_json::from_str(&OutboundFrame::login_ok("jwt").encode().unwrap()).unwrap();
        assert_eq!(login, json!({"type": "login", "status": "ok", "token": "jwt"}));
    }

    #[test]
    fn outbound_message_frame_shape() {
        let env = Envelope {
            from: "bob".into(),
            to: "alice".into(),
            content_type: "text".into(),
            content: "hi".into(),
        };
        let frame = OutboundFrame::Message(MessageFrame::from(&env));
        let value: Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "message", "from": "bob", "to": "alice", "contentType": "text", "content": "hi"})
        );
    }

    #[test]
    fn outbound_error_uses_client_message() {
        let frame = OutboundFrame::error(&RelayError::SenderMismatch);
        let value: Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "error", "msg": "sender mismatch"}));
    }
}
