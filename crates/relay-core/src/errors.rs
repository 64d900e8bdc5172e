//! Relay error taxonomy.
//!
//! Every failure the relay can observe falls into one [`ErrorKind`]. Protocol,
//! authorization and credential failures are reported to the client as an
//! `error` frame; transport failures end the session silently; persistence
//! failures are logged and never reach the client on the send path.

use thiserror::Error;

/// Failure reported by a [`CredentialStore`](crate::credentials::CredentialStore).
///
/// Variants carry no internal detail so they are safe to show to clients.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
    /// Username or password was empty.
    #[error("username and password are required")]
    MissingFields,
    /// Registration collided with an existing username.
    #[error("username already taken")]
    UsernameTaken,
    /// Unknown username or wrong password.
    #[error("invalid credentials")]
    InvalidCredentials,
    /// Token was malformed, forged, or signed with another key.
    #[error("invalid token")]
    InvalidToken,
    /// Token signature is valid but it has expired.
    #[error("token expired")]
    TokenExpired,
    /// The backing store failed; details are logged where it happened.
    #[error("credential store unavailable")]
    Unavailable,
}

/// Failure reported by a [`MessageLog`](crate::log::MessageLog).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("message log: {0}")]
pub struct LogError(pub String);

/// Coarse classification used for logging, metrics and client reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or unrecognised frame.
    Protocol,
    /// Missing, invalid or mismatched token; action not allowed in this state.
    Authorization,
    /// The connection itself failed.
    Transport,
    /// The message log failed.
    Persistence,
    /// The credential store rejected a register or login.
    Credential,
    /// A bug: a frame could not be encoded.
    Internal,
}

impl ErrorKind {
    /// Label for metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Protocol => "protocol",
            Self::Authorization => "authorization",
            Self::Transport => "transport",
            Self::Persistence => "persistence",
            Self::Credential => "credential",
            Self::Internal => "internal",
        }
    }
}

/// Any error raised while handling a client frame.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Frame text was not JSON.
    #[error("invalid JSON")]
    InvalidJson,
    /// Frame was JSON but did not match its declared type.
    #[error("malformed frame")]
    MalformedFrame,
    /// Frame `type` is not recognised.
    #[error("unknown type")]
    UnknownType,
    /// `action` frame named an unsupported action.
    #[error("unknown action")]
    UnknownAction,
    /// Frame requires an authenticated session.
    #[error("not authenticated")]
    NotAuthenticated,
    /// `action` frame received after login.
    #[error("already authenticated")]
    AlreadyAuthenticated,
    /// Token identity does not match the declared sender.
    #[error("sender mismatch")]
    SenderMismatch,
    /// Credential store rejected the request.
    #[error(transparent)]
    Credential(#[from] CredentialError),
    /// The connection failed.
    #[error("transport error: {0}")]
    Transport(String),
    /// The message log failed.
    #[error(transparent)]
    Persistence(#[from] LogError),
    /// A frame could not be serialized.
    #[error("frame encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl RelayError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidJson | Self::MalformedFrame | Self::UnknownType | Self::UnknownAction => {
                ErrorKind::Protocol
            }
            Self::NotAuthenticated
            | Self::AlreadyAuthenticated
            | Self::SenderMismatch
            | Self::Credential(CredentialError::InvalidToken | CredentialError::TokenExpired) => {
                ErrorKind::Authorization
            }
            Self::Credential(_) => ErrorKind::Credential,
            Self::Transport(_) => ErrorKind::Transport,
            Self::Persistence(_) => ErrorKind::Persistence,
            Self::Encoding(_) => ErrorKind::Internal,
        }
    }

    /// Whether this error ends the session.
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }

    /// Text placed in the `msg` field of an `error` frame.
    ///
    /// Persistence and internal failures are reduced to a generic reason.
    pub fn client_message(&self) -> String {
        match self.kind() {
            ErrorKind::Persistence => "storage unavailable".to_owned(),
            ErrorKind::Internal => "internal error".to_owned(),
            _ => self.to_string(),
        }
    }
}
