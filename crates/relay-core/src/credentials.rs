//! Credential store boundary.

use async_trait::async_trait;

use crate::errors::CredentialError;
use crate::identity::Identity;

/// Opaque bearer token issued on login.
pub type BearerToken = String;

/// Verifies identity/password pairs and issues and validates bearer tokens.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Create a new identity.
    async fn register(&self, identity: &Identity, secret: &str) -> Result<(), CredentialError>;

    /// Check a password and issue a bearer token for the identity.
    async fn login(&self, identity: &Identity, secret: &str) -> Result<BearerToken, CredentialError>;

    /// Resolve a bearer token to the identity embedded in it.
    async fn validate_token(&self, token: &str) -> Result<Identity, CredentialError>;
}
