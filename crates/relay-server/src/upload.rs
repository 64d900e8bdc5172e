//! `POST /upload` and static serving of stored uploads.
//!
//! Binary content never travels over the WebSocket: clients upload here,
//! then send the returned URL as a message's content.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::multipart::{Field, MultipartError, MultipartRejection};
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use chrono::Utc;
use metrics::counter;
use relay_core::CredentialError;
use relay_core::credentials::CredentialStore;
use relay_core::ids::FileId;
use relay_store::{FileRecord, FileRepo, StoreError};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tower_http::services::ServeDir;
use tracing::{error, info, instrument, warn};

use crate::metrics::{UPLOADS_TOTAL, UPLOAD_BYTES_TOTAL};

/// Longest file extension kept on stored names.
const MAX_EXTENSION_LEN: usize = 16;

/// Handler state for the upload routes.
#[derive(Clone)]
pub struct UploadState {
    /// Token validation.
    pub credentials: Arc<dyn CredentialStore>,
    /// Upload metadata.
    pub files: FileRepo,
    /// Directory files are written to.
    pub upload_dir: PathBuf,
}

/// Response body of a successful upload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    /// Generated file id.
    pub id: FileId,
    /// Path the file is served from.
    pub url: String,
    /// Name supplied by the client.
    pub filename: String,
    /// MIME type supplied by the client.
    pub content_type: String,
    /// Stored size.
    pub size_bytes: u64,
}

impl From<&FileRecord> for UploadResponse {
    fn from(record: &FileRecord) -> Self {
        Self {
            id: record.id.clone(),
            url: format!("/uploads/{}", record.stored_name),
            filename: record.original_name.clone(),
            content_type: record.content_type.clone(),
            size_bytes: record.size_bytes,
        }
    }
}

/// Why an upload was refused.
#[derive(Debug, Error)]
pub enum UploadError {
    /// No `Authorization: Bearer` header.
    #[error("missing bearer token")]
    MissingToken,
    /// Token rejected.
    #[error(transparent)]
    Credential(#[from] CredentialError),
    /// Request was not a readable multipart form.
    #[error(transparent)]
    Rejected(#[from] MultipartRejection),
    /// Form body failed mid-read (includes exceeding the size limit).
    #[error(transparent)]
    Form(#[from] MultipartError),
    /// Form had no `file` field.
    #[error("missing file field")]
    MissingFile,
    /// Writing the file failed.
    #[error("failed to store file: {0}")]
    Io(#[from] std::io::Error),
    /// Recording metadata failed.
    #[error("failed to record file: {0}")]
    Store(#[from] StoreError),
}

impl UploadError {
    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingToken
            | Self::Credential(CredentialError::InvalidToken | CredentialError::TokenExpired) => {
                StatusCode::UNAUTHORIZED
            }
            Self::Credential(_) | Self::Io(_) | Self::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::Rejected(r) => r.status(),
            Self::Form(e) => e.status(),
            Self::MissingFile => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        let status = self.status();
        let msg = if status.is_server_error() {
            error!(error = %self, "upload failed");
            "storage unavailable".to_owned()
        } else {
            warn!(error = %self, %status, "upload rejected");
            self.to_string()
        };
        (status, Json(json!({ "error": msg }))).into_response()
    }
}

/// Routes for uploading and fetching files.
pub fn router(state: UploadState, max_upload_bytes: usize) -> Router {
    let serve = ServeDir::new(&state.upload_dir);
    Router::new()
        .route("/upload", post(upload_handler))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(state)
        .nest_service("/uploads", serve)
}

/// POST /upload
#[instrument(skip_all)]
async fn upload_handler(
    State(state): State<UploadState>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<UploadResponse>, UploadError> {
    let token = bearer_token(&headers).ok_or(UploadError::MissingToken)?;
    let uploader = state.credentials.validate_token(token).await?;
    let mut multipart = multipart?;

    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some("file") {
            continue;
        }

        let original_name = field
            .file_name()
            .and_then(|n| Path::new(n).file_name())
            .and_then(|n| n.to_str())
            .unwrap_or("upload")
            .to_owned();
        let content_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_owned();
        let id = FileId::new();
        let stored_name = stored_name(&id, &original_name);

        tokio::fs::create_dir_all(&state.upload_dir).await?;
        let path = state.upload_dir.join(&stored_name);
        let size_bytes = match write_field(field, &path).await {
            Ok(n) => n,
            Err(e) => {
                let _ = tokio::fs::remove_file(&path).await;
                return Err(e);
            }
        };

        let record = FileRecord {
            id,
            uploader,
            original_name,
            stored_name,
            content_type,
            size_bytes,
            created_at: Utc::now(),
        };
        if let Err(e) = state.files.insert(&record) {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(e.into());
        }

        counter!(UPLOADS_TOTAL).increment(1);
        counter!(UPLOAD_BYTES_TOTAL).increment(size_bytes);
        info!(
            file_id = %record.id,
            uploader = %record.uploader,
            size_bytes,
            "file uploaded"
        );
        return Ok(Json(UploadResponse::from(&record)));
    }

    Err(UploadError::MissingFile)
}

/// Stream one form field to `path`, returning the byte count.
async fn write_field(mut field: Field<'_>, path: &Path) -> Result<u64, UploadError> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut size = 0u64;
    while let Some(chunk) = field.chunk().await? {
        file.write_all(&chunk).await?;
        size += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(size)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then_some(token)
}

/// `<id>` plus the original extension when it is short and alphanumeric.
fn stored_name(id: &FileId, original_name: &str) -> String {
    let ext = Path::new(original_name)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| {
            !e.is_empty()
                && e.len() <= MAX_EXTENSION_LEN
                && e.chars().all(|c| c.is_ascii_alphanumeric())
        });
    match ext {
        Some(ext) => format!("{id}.{}", ext.to_ascii_lowercase()),
        None => id.to_string(),
    }
}
