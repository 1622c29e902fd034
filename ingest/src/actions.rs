//! Operator actions on individual files.

use crate::errors::Result;
use crate::lifecycle::MoveOutcome;
use crate::processing::{FileOutcome, Processor};
use crate::types::{FileName, FileStatus};
use serde::Serialize;

pub const NOT_FOUND: &str = "Not found";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FileStatusResponse {
    /// A status name, or "Not found".
    pub file_status: String,
}

impl FileStatusResponse {
    fn status(status: FileStatus) -> Self {
        FileStatusResponse {
            file_status: status.to_string(),
        }
    }

    fn not_found() -> Self {
        FileStatusResponse {
            file_status: NOT_FOUND.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ReprocessResponse {
    pub observations_processed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

pub async fn get_file_status(processor: &Processor, file_name: &str) -> Result<FileStatusResponse> {
    Ok(match processor.lifecycle().status(file_name).await? {
        Some(status) => FileStatusResponse::status(status),
        None => FileStatusResponse::not_found(),
    })
}

/// Moves the file from whatever state it is in to `status` and tags its blob.
pub async fn set_file_status(
    processor: &Processor,
    file_name: &str,
    status: FileStatus,
) -> Result<FileStatusResponse> {
    let lifecycle = processor.lifecycle();
    let Some(current) = lifecycle.status(file_name).await? else {
        tracing::warn!(file_name, "File not found in any group, skipping status change");
        return Ok(FileStatusResponse::not_found());
    };

    if lifecycle.admin_move(file_name, current, status).await? == MoveOutcome::NotFound {
        // Moved by someone else between the lookup and the move.
        return Ok(FileStatusResponse::not_found());
    }

    if let Ok(name) = file_name.parse::<FileName>() {
        lifecycle
            .patch_status(name.integration_id(), file_name, status)
            .await?;
    }
    Ok(FileStatusResponse::status(status))
}

/// Runs the processing pipeline again for a file that was put back to pending.
///
/// Files that are unknown, in progress or already processed (their blobs are
/// gone) are refused with a message.
pub async fn reprocess_file(processor: &Processor, file_name: &str) -> Result<ReprocessResponse> {
    let refused = |message: String| -> Result<ReprocessResponse> {
        tracing::warn!(file_name, "{message}");
        Ok(ReprocessResponse {
            observations_processed: 0,
            message: Some(message),
        })
    };

    match processor.lifecycle().status(file_name).await? {
        None => refused(format!("File '{file_name}' not found. Skipping reprocessing.")),
        Some(FileStatus::InProgress) => refused(format!(
            "File '{file_name}' processing is already in progress. Skipping reprocessing."
        )),
        Some(FileStatus::Processed) => refused(format!(
            "File '{file_name}' was already processed and deleted."
        )),
        Some(FileStatus::Pending) => match processor.process_file(file_name).await? {
            FileOutcome::Processed { observations } => Ok(ReprocessResponse {
                observations_processed: observations,
                message: None,
            }),
            FileOutcome::Skipped => refused(format!(
                "File '{file_name}' was claimed by another worker. Skipping reprocessing."
            )),
        },
    }
}
