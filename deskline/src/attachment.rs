//! Attachment pipeline: destination → upload → announce.
//!
//! Each attachment runs as its own task. The three steps are strictly
//! ordered; the first failure stops the pipeline and is returned to the
//! engine, which marks the optimistic message failed.

use std::future::Future;
use std::path::Path;

use serde::{Deserialize, Serialize};

use deskline_proto::conversation::ConversationId;
use deskline_proto::event::{Command, SendMessage};
use deskline_proto::message::{MessageType, TempId};

use crate::api::ApiError;
use crate::connection::{Connection, ConnectionError};

/// A file picked by the user, read into memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingFile {
    pub file_name: String,
    /// Declared media type, e.g. `image/png`.
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl OutgoingFile {
    pub fn new(file_name: impl Into<String>, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            mime_type: mime_type.into(),
            bytes,
        }
    }

    /// Read a file from disk, guessing its media type from the extension.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the file cannot be read.
    pub async fn read(path: &Path) -> std::io::Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map_or_else(|| "attachment".to_string(), |n| n.to_string_lossy().into_owned());
        let mime_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .to_string();
        Ok(Self::new(file_name, mime_type, bytes))
    }

    /// Size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// Message type for a declared media type.
#[must_use]
pub fn classify(mime_type: &str) -> MessageType {
    let top = mime_type
        .split('/')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match top.as_str() {
        "image" => MessageType::Image,
        "video" => MessageType::Video,
        "audio" => MessageType::Audio,
        _ => MessageType::File,
    }
}

/// Where to upload a file and where it will be served from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadTarget {
    pub upload_url: String,
    pub file_url: String,
}

/// Storage-authorization collaborator.
pub trait UploadService: Send + Sync + 'static {
    /// Ask for an upload destination for a file.
    fn request_destination(
        &self,
        file_name: &str,
        mime_type: &str,
    ) -> impl Future<Output = Result<UploadTarget, ApiError>> + Send;

    /// Upload the file bytes to `target`.
    fn upload(
        &self,
        target: &UploadTarget,
        bytes: Vec<u8>,
        mime_type: &str,
    ) -> impl Future<Output = Result<(), ApiError>> + Send;
}

/// Errors that stop the attachment pipeline.
#[derive(Debug, thiserror::Error)]
pub enum AttachmentError {
    #[error("could not prepare upload: {}", .0.user_message())]
    Destination(#[source] ApiError),

    #[error("upload failed: {}", .0.user_message())]
    Upload(#[source] ApiError),

    #[error("could not send attachment: {0}")]
    Announce(#[from] ConnectionError),
}

/// One attachment send, as handed to the pipeline task.
#[derive(Debug, Clone)]
pub struct AttachmentJob {
    pub temp_id: TempId,
    pub conversation_id: ConversationId,
    pub message_type: MessageType,
    pub file: OutgoingFile,
}

/// Run destination → upload → announce for one attachment.
///
/// Returns the public file URL once `sendMessage` has been queued.
///
/// # Errors
///
/// Returns the [`AttachmentError`] of the first step that failed.
pub async fn run_pipeline<U: UploadService>(
    uploads: &U,
    connection: &Connection,
    job: AttachmentJob,
) -> Result<String, AttachmentError> {
    let AttachmentJob {
        temp_id,
        conversation_id,
        message_type,
        file,
    } = job;
    let size = file.size();

    let target = uploads
        .request_destination(&file.file_name, &file.mime_type)
        .await
        .map_err(AttachmentError::Destination)?;
    tracing::debug!(temp = %temp_id, upload_url = %target.upload_url, "upload destination ready");

    uploads
        .upload(&target, file.bytes, &file.mime_type)
        .await
        .map_err(AttachmentError::Upload)?;

    connection.emit(Command::SendMessage(SendMessage {
        conversation_id,
        message_type,
        temp_message_id: temp_id,
        content: None,
        file_url: Some(target.file_url.clone()),
        file_name: Some(file.file_name),
        file_type: Some(file.mime_type),
        file_size: Some(size),
    }))?;
    tracing::info!(temp = %temp_id, conversation = %conversation_id, size, "attachment announced");

    Ok(target.file_url)
}
