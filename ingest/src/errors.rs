use crate::blob_store::BlobStoreError;
use crate::group_store::GroupStoreError;
use crate::lifecycle::LifecycleError;
use crate::parse::BadPayload;
use crate::sender::SenderError;
use crate::vendor::VendorError;
use thiserror::Error;

/// Result type alias for ingest operations
pub type Result<T, E = IngestError> = std::result::Result<T, E>;

/// Errors that abort a retrieval or the processing of one file.
///
/// Collaborator errors have already been retried when they were transient;
/// `is_transient` tells whether the last failure was of that kind.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    BadPayload(#[from] BadPayload),

    #[error("blob store error: {0}")]
    BlobStore(#[from] BlobStoreError),

    #[error("group store error: {0}")]
    GroupStore(#[from] GroupStoreError),

    #[error("vendor error: {0}")]
    Vendor(#[from] VendorError),

    #[error("sender error: {0}")]
    Sender(#[from] SenderError),

    #[error("invalid file name: {0}")]
    InvalidFileName(String),

    #[error("unknown integration: {0}")]
    UnknownIntegration(String),
}

impl IngestError {
    pub fn is_transient(&self) -> bool {
        match self {
            IngestError::BlobStore(e) => e.is_transient(),
            IngestError::GroupStore(e) => e.is_transient(),
            IngestError::Vendor(e) => e.is_transient(),
            IngestError::Sender(e) => e.is_transient(),
            _ => false,
        }
    }
}

impl From<LifecycleError> for IngestError {
    fn from(err: LifecycleError) -> Self {
        match err {
            LifecycleError::GroupStore(e) => IngestError::GroupStore(e),
            LifecycleError::BlobStore(e) => IngestError::BlobStore(e),
            LifecycleError::InvalidFileName(name) => IngestError::InvalidFileName(name),
        }
    }
}
