//! User accounts.

use chrono::{DateTime, Utc};
use tracing::instrument;

use relay_core::Identity;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// A stored account.
#[derive(Clone, Debug)]
pub struct UserRow {
    /// Unique username.
    pub username: Identity,
    /// bcrypt hash of the password.
    pub password_hash: String,
    /// Registration time.
    pub created_at: DateTime<Utc>,
}

/// Repository over the `users` table.
#[derive(Clone)]
pub struct UserRepo {
    db: Database,
}

impl UserRepo {
    /// Wrap a database handle.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a user. Returns `Conflict` if the username exists.
    #[instrument(skip(self, password_hash), fields(username = %username))]
    pub fn create(&self, username: &Identity, password_hash: &str) -> Result<UserRow, StoreError> {
        let now = Utc::now();
        self.db.with_conn(|conn| {
            let _ = conn.execute(
                "INSERT INTO users (username, password_hash, created_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![
                    username.as_str(),
                    password_hash,
                    row_helpers::format_timestamp(now),
                ],
            )?;
            Ok(UserRow {
                username: username.clone(),
                password_hash: password_hash.to_owned(),
                created_at: now,
            })
        })
    }

    /// Look up a user by name.
    #[instrument(skip(self), fields(username = %username))]
    pub fn get(&self, username: &Identity) -> Result<UserRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT username, password_hash, created_at FROM users WHERE username = ?1",
            )?;
            let mut rows = stmt.query([username.as_str()])?;
            let Some(row) = rows.next()? else {
                return Err(StoreError::NotFound(format!("user {username}")));
            };
            let name: String = row_helpers::get(row, 0, "users", "username")?;
            let created_at: String = row_helpers::get(row, 2, "users", "created_at")?;
            Ok(UserRow {
                username: Identity::from(name),
                password_hash: row_helpers::get(row, 1, "users", "password_hash")?,
                created_at: row_helpers::parse_timestamp(&created_at, "users", "created_at")?,
            })
        })
    }

    /// Number of registered users.
    pub fn count(&self) -> Result<u64, StoreError> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
            Ok(u64::try_from(n).unwrap_or_default())
        })
    }
}
