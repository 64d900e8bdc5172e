//! Credential store: bcrypt password hashes in `SQLite` and HS256 bearer tokens.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::errors::ErrorKind as JwtErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument, warn};

use relay_core::credentials::{BearerToken, CredentialStore};
use relay_core::{CredentialError, Identity};
use relay_settings::RelaySettings;
use relay_store::{StoreError, UserRepo};

use crate::metrics::{AUTH_ATTEMPTS_TOTAL, TOKEN_REJECTIONS_TOTAL};

/// Token and password hashing parameters.
#[derive(Clone, Debug)]
pub struct AuthConfig {
    /// HMAC secret. A random per-process secret is used when `None`.
    pub jwt_secret: Option<String>,
    /// Token lifetime.
    pub token_ttl: Duration,
    /// bcrypt work factor.
    pub bcrypt_cost: u32,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            token_ttl: Duration::from_secs(24 * 60 * 60),
            bcrypt_cost: bcrypt::DEFAULT_COST,
        }
    }
}

impl From<&RelaySettings> for AuthConfig {
    fn from(s: &RelaySettings) -> Self {
        Self {
            jwt_secret: s.auth.jwt_secret.clone(),
            token_ttl: Duration::from_secs(s.auth.token_ttl_secs),
            bcrypt_cost: s.auth.bcrypt_cost,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    username: String,
    iat: i64,
    exp: i64,
}

/// Signs and verifies HS256 bearer tokens carrying a `username` claim.
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl: Duration,
}

impl TokenIssuer {
    /// Create an issuer from a raw secret.
    pub fn new(secret: &[u8], ttl: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
            ttl,
        }
    }

    /// Create an issuer from config, generating a secret if none is set.
    pub fn from_config(config: &AuthConfig) -> Self {
        match config.jwt_secret.as_deref() {
            Some(secret) if !secret.is_empty() => Self::new(secret.as_bytes(), config.token_ttl),
            _ => {
                warn!("no JWT secret configured; tokens will not survive a restart");
                let secret: [u8; 32] = rand::random();
                Self::new(&secret, config.token_ttl)
            }
        }
    }

    /// Issue a token for `identity`.
    pub fn issue(&self, identity: &Identity) -> Result<BearerToken, CredentialError> {
        let now = Utc::now().timestamp();
        let ttl = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX / 2);
        let claims = Claims {
            username: identity.as_str().to_owned(),
            iat: now,
            exp: now.saturating_add(ttl),
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding).map_err(|e| {
            error!(error = %e, "token signing failed");
            CredentialError::Unavailable
        })
    }

    /// Verify a token and return the identity it names.
    pub fn validate(&self, token: &str) -> Result<Identity, CredentialError> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding, &self.validation)
            .map_err(|e| match e.kind() {
                JwtErrorKind::ExpiredSignature => CredentialError::TokenExpired,
                _ => CredentialError::InvalidToken,
            })?;
        if data.claims.username.is_empty() {
            return Err(CredentialError::InvalidToken);
        }
        Ok(Identity::from(data.claims.username))
    }
}

/// [`CredentialStore`] over the `users` table.
pub struct SqliteCredentialStore {
    users: UserRepo,
    tokens: Arc<TokenIssuer>,
    bcrypt_cost: u32,
}

impl SqliteCredentialStore {
    /// Build a store.
    pub fn new(users: UserRepo, tokens: Arc<TokenIssuer>, bcrypt_cost: u32) -> Self {
        Self {
            users,
            tokens,
            bcrypt_cost,
        }
    }
}

#[async_trait]
impl CredentialStore for SqliteCredentialStore {
    #[instrument(skip(self, secret), fields(username = %identity))]
    async fn register(&self, identity: &Identity, secret: &str) -> Result<(), CredentialError> {
        if identity.is_empty() || secret.is_empty() {
            return Err(CredentialError::MissingFields);
        }

        let secret = secret.to_owned();
        let cost = self.bcrypt_cost;
        let hash = tokio::task::spawn_blocking(move || bcrypt::hash(secret, cost))
            .await
            .map_err(|e| {
                error!(error = %e, "password hashing task failed");
                CredentialError::Unavailable
            })?
            .map_err(|e| {
                error!(error = %e, "password hashing failed");
                CredentialError::Unavailable
            })?;

        match self.users.create(identity, &hash) {
            Ok(_) => {
                counter!(AUTH_ATTEMPTS_TOTAL, "action" => "register", "outcome" => "ok").increment(1);
                debug!("user registered");
                Ok(())
            }
            Err(StoreError::Conflict(_)) => {
                counter!(AUTH_ATTEMPTS_TOTAL, "action" => "register", "outcome" => "conflict")
                    .increment(1);
                Err(CredentialError::UsernameTaken)
            }
            Err(e) => {
                error!(error = %e, "user insert failed");
                Err(CredentialError::Unavailable)
            }
        }
    }

    #[instrument(skip(self, secret), fields(username = %identity))]
    async fn login(&self, identity: &Identity, secret: &str) -> Result<BearerToken, CredentialError> {
        if identity.is_empty() || secret.is_empty() {
            return Err(CredentialError::MissingFields);
        }

        let user = match self.users.get(identity) {
            Ok(user) => user,
            Err(StoreError::NotFound(_)) => {
                counter!(AUTH_ATTEMPTS_TOTAL, "action" => "login", "outcome" => "rejected")
                    .increment(1);
                return Err(CredentialError::InvalidCredentials);
            }
            Err(e) => {
                error!(error = %e, "user lookup failed");
                return Err(CredentialError::Unavailable);
            }
        };

        let secret = secret.to_owned();
        let hash = user.password_hash;
        let matches = tokio::task::spawn_blocking(move || bcrypt::verify(secret, &hash))
            .await
            .map_err(|e| {
                error!(error = %e, "password verification task failed");
                CredentialError::Unavailable
            })?
            .map_err(|e| {
                error!(error = %e, "stored password hash is unreadable");
                CredentialError::Unavailable
            })?;

        if !matches {
            counter!(AUTH_ATTEMPTS_TOTAL, "action" => "login", "outcome" => "rejected").increment(1);
            return Err(CredentialError::InvalidCredentials);
        }

        counter!(AUTH_ATTEMPTS_TOTAL, "action" => "login", "outcome" => "ok").increment(1);
        self.tokens.issue(identity)
    }

    async fn validate_token(&self, token: &str) -> Result<Identity, CredentialError> {
        self.tokens.validate(token).inspect_err(|e| {
            counter!(TOKEN_REJECTIONS_TOTAL, "reason" => e.to_string()).increment(1);
        })
    }
}
