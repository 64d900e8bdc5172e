//! Upload metadata.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::instrument;

use relay_core::Identity;
use relay_core::ids::FileId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Metadata for one stored upload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    /// Generated identifier.
    pub id: FileId,
    /// Identity that uploaded the file.
    pub uploader: Identity,
    /// File name supplied by the client.
    pub original_name: String,
    /// Name on disk under the upload directory.
    pub stored_name: String,
    /// MIME type supplied by the client.
    pub content_type: String,
    /// Size in bytes.
    pub size_bytes: u64,
    /// Upload time.
    pub created_at: DateTime<Utc>,
}

/// Repository over the `files` table.
#[derive(Clone)]
pub struct FileRepo {
    db: Database,
}

impl FileRepo {
    /// Wrap a database handle.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Record an upload.
    #[instrument(skip(self, record), fields(file_id = %record.id, uploader = %record.uploader))]
    pub fn insert(&self, record: &FileRecord) -> Result<(), StoreError> {
        let size = i64::try_from(record.size_bytes)
            .map_err(|_| StoreError::Conflict(format!("file too large: {}", record.size_bytes)))?;
        self.db.with_conn(|conn| {
            let _ = conn.execute(
                "INSERT INTO files (id, uploader, original_name, stored_name, content_type, size_bytes, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    record.id.as_str(),
                    record.uploader.as_str(),
                    record.original_name,
                    record.stored_name,
                    record.content_type,
                    size,
                    row_helpers::format_timestamp(record.created_at),
                ],
            )?;
            Ok(())
        })
    }

    /// Fetch upload metadata by id.
    pub fn get(&self, id: &FileId) -> Result<FileRecord, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, uploader, original_name, stored_name, content_type, size_bytes, created_at
                 FROM files WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            let Some(row) = rows.next()? else {
                return Err(StoreError::NotFound(format!("file {id}")));
            };
            let raw_id: String = row_helpers::get(row, 0, "files", "id")?;
            let uploader: String = row_helpers::get(row, 1, "files", "uploader")?;
            let size: i64 = row_helpers::get(row, 5, "files", "size_bytes")?;
            let created_at: String = row_helpers::get(row, 6, "files", "created_at")?;
            Ok(FileRecord {
                id: FileId::from_raw(raw_id),
                uploader: Identity::from(uploader),
                original_name: row_helpers::get(row, 2, "files", "original_name")?,
                stored_name: row_helpers::get(row, 3, "files", "stored_name")?,
                content_type: row_helpers::get(row, 4, "files", "content_type")?,
                size_bytes: u64::try_from(size).map_err(|e| StoreError::CorruptRow {
                    table: "files",
                    column: "size_bytes",
                    detail: e.to_string(),
                })?,
                created_at: row_helpers::parse_timestamp(&created_at, "files", "created_at")?,
            })
        })
    }
}
