//! # relay-core
//!
//! Types shared by every relay crate.
//!
//! - Branded identifiers ([`ids`]) and the [`Identity`](identity::Identity) newtype
//! - Persisted message shapes ([`messages`])
//! - Wire frames exchanged with clients ([`protocol`])
//! - The error taxonomy ([`errors`])
//! - Collaborator boundaries: [`credentials::CredentialStore`] and [`log::MessageLog`]

#![deny(unsafe_code)]

pub mod credentials;
pub mod errors;
pub mod identity;
pub mod ids;
pub mod log;
pub mod messages;
pub mod protocol;

pub use errors::{CredentialError, ErrorKind, LogError, RelayError};
pub use identity::{Identity, MessageId};
