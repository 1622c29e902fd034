//! The pending → in_progress → processed state machine over data file names.
//!
//! Each state is backed by one set in the [`GroupStore`]. All transitions are
//! single `move_member` calls, so a file is a member of at most one set at any
//! time and at most one worker can claim a pending file.

use crate::blob_store::{BlobStore, BlobStoreError, Metadata};
use crate::group_store::{GroupStore, GroupStoreError};
use crate::metrics_defs::{FILES_CLAIMED, FILES_CLAIM_SKIPPED, FILES_FINALIZED};
use crate::types::{FileName, FileStatus};
use shared::counter;
use std::sync::Arc;

pub const PENDING_SET: &str = "ats_pending_files";
pub const IN_PROGRESS_SET: &str = "ats_in_progress_files";
pub const PROCESSED_SET: &str = "ats_processed_files";

pub const fn set_name(status: FileStatus) -> &'static str {
    match status {
        FileStatus::Pending => PENDING_SET,
        FileStatus::InProgress => IN_PROGRESS_SET,
        FileStatus::Processed => PROCESSED_SET,
    }
}

#[derive(thiserror::Error, Debug)]
pub enum LifecycleError {
    #[error(transparent)]
    GroupStore(#[from] GroupStoreError),

    #[error(transparent)]
    BlobStore(#[from] BlobStoreError),

    #[error("invalid file name: {0}")]
    InvalidFileName(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    /// Not pending: another worker holds it, or it was already processed.
    AlreadyClaimed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MoveOutcome {
    Moved,
    /// The file was not in the expected source state. Nothing was changed.
    NotFound,
}

#[derive(Clone)]
pub struct Lifecycle {
    groups: Arc<dyn GroupStore>,
    blobs: Arc<dyn BlobStore>,
}

impl Lifecycle {
    pub fn new(groups: Arc<dyn GroupStore>, blobs: Arc<dyn BlobStore>) -> Self {
        Lifecycle { groups, blobs }
    }

    pub async fn register_pending(&self, file_name: &str) -> Result<(), LifecycleError> {
        self.groups.add(PENDING_SET, file_name).await?;
        Ok(())
    }

    pub async fn claim(&self, file_name: &str) -> Result<ClaimOutcome, LifecycleError> {
        let moved = self
            .groups
            .move_member(PENDING_SET, IN_PROGRESS_SET, file_name)
            .await?;

        if moved == 1 {
            counter!(FILES_CLAIMED).increment(1);
            Ok(ClaimOutcome::Claimed)
        } else {
            tracing::info!(file_name, "File is not pending, skipping");
            counter!(FILES_CLAIM_SKIPPED).increment(1);
            Ok(ClaimOutcome::AlreadyClaimed)
        }
    }

    /// Moves the file to processed and removes both companion blobs.
    ///
    /// The blobs are tagged `processed` before deletion. A companion that no
    /// longer exists is not an error.
    pub async fn finalize(&self, file_name: &str) -> Result<MoveOutcome, LifecycleError> {
        let name: FileName = file_name
            .parse()
            .map_err(|_| LifecycleError::InvalidFileName(file_name.to_string()))?;

        let moved = self
            .groups
            .move_member(IN_PROGRESS_SET, PROCESSED_SET, file_name)
            .await?;
        if moved == 0 {
            tracing::warn!(file_name, "File was not in progress, not finalizing");
            return Ok(MoveOutcome::NotFound);
        }

        let integration_id = name.integration_id();
        for blob in [name.to_string(), name.companion().to_string()] {
            self.patch_status(integration_id, &blob, FileStatus::Processed)
                .await?;
            match self.blobs.delete(integration_id, &blob).await {
                Err(e) if e.is_not_found() => {
                    tracing::debug!(file_name = %blob, "Blob already deleted");
                }
                other => other?,
            }
        }

        counter!(FILES_FINALIZED).increment(1);
        tracing::info!(file_name, "File processed");
        Ok(MoveOutcome::Moved)
    }

    /// Looks the file up in pending, in_progress and processed, in that order.
    pub async fn status(&self, file_name: &str) -> Result<Option<FileStatus>, LifecycleError> {
        for status in FileStatus::ALL {
            if self.groups.is_member(set_name(status), file_name).await? {
                return Ok(Some(status));
            }
        }
        Ok(None)
    }

    /// Operator override. Only moves the file if it currently is in `from`.
    pub async fn admin_move(
        &self,
        file_name: &str,
        from: FileStatus,
        to: FileStatus,
    ) -> Result<MoveOutcome, LifecycleError> {
        let moved = self
            .groups
            .move_member(set_name(from), set_name(to), file_name)
            .await?;
        if moved == 0 {
            return Ok(MoveOutcome::NotFound);
        }
        tracing::info!(file_name, %from, %to, "File status changed");
        Ok(MoveOutcome::Moved)
    }

    /// Pending data files belonging to `integration_id`.
    pub async fn pending_for(&self, integration_id: &str) -> Result<Vec<String>, LifecycleError> {
        let mut files: Vec<String> = self
            .groups
            .members(PENDING_SET)
            .await?
            .into_iter()
            .filter(|member| {
                member
                    .parse::<FileName>()
                    .is_ok_and(|name| name.integration_id() == integration_id)
            })
            .collect();
        files.sort();
        Ok(files)
    }

    /// Updates the `status` metadata of a blob. A missing blob is logged and ignored.
    pub async fn patch_status(
        &self,
        integration_id: &str,
        blob: &str,
        status: FileStatus,
    ) -> Result<(), LifecycleError> {
        let patch = Metadata::from([("status".to_string(), status.to_string())]);
        match self.blobs.patch_metadata(integration_id, blob, patch).await {
            Err(e) if e.is_not_found() => {
                tracing::warn!(file_name = blob, "Blob not found, metadata not updated");
                Ok(())
            }
            other => Ok(other?),
        }
    }
}
