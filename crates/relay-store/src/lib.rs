//! # relay-store
//!
//! `SQLite` persistence for the relay: users, the message log with its
//! conversation summaries, and upload metadata.

#![deny(unsafe_code)]

pub mod database;
pub mod error;
pub mod files;
pub mod messages;
pub mod row_helpers;
pub mod schema;
pub mod users;

pub use database::Database;
pub use error::StoreError;
pub use files::{FileRecord, FileRepo};
pub use messages::MessageRepo;
pub use users::{UserRepo, UserRow};
