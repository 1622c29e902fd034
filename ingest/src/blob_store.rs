//! Durable storage for raw vendor payloads.
//!
//! Blobs are scoped per integration: the object key is `{integration_id}/{file_name}`.
//! Every blob carries a small string metadata map (integration id, account
//! username and lifecycle status) so the state of a file is visible in the
//! storage console as well.

use async_trait::async_trait;
use bytes::Bytes;
use google_cloud_auth::credentials::{CacheableResource, Credentials};
use http::{Extensions, HeaderMap};
use parking_lot::RwLock;
use reqwest::{Method, StatusCode, Url};
use serde::Deserialize;
use shared::retry::{RetryPolicy, retry};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};

pub type Metadata = BTreeMap<String, String>;

const GCS_BASE_URL: &str = "https://storage.googleapis.com";

#[derive(thiserror::Error, Debug)]
pub enum BlobStoreError {
    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("storage returned {status} for {key}")]
    Status { status: u16, key: String },

    #[error("invalid metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("invalid storage URL: {0}")]
    InvalidUrl(String),

    #[error("could not load storage credentials: {0}")]
    CredentialsConfig(#[from] google_cloud_auth::build_errors::Error),

    #[error("invalid service account key {path}: {reason}")]
    ServiceAccountKey { path: String, reason: String },

    #[error("could not obtain storage credentials: {0}")]
    Credentials(#[from] google_cloud_auth::errors::CredentialsError),
}

impl BlobStoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, BlobStoreError::NotFound(_))
    }

    pub fn is_transient(&self) -> bool {
        match self {
            BlobStoreError::Http(e) => e.is_connect() || e.is_timeout(),
            BlobStoreError::Status { status, .. } => *status == 429 || *status >= 500,
            BlobStoreError::Credentials(e) => e.is_transient(),
            BlobStoreError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}

pub fn object_key(integration_id: &str, name: &str) -> String {
    format!("{integration_id}/{name}")
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(
        &self,
        integration_id: &str,
        name: &str,
        contents: Bytes,
        metadata: Metadata,
    ) -> Result<(), BlobStoreError>;

    async fn get(&self, integration_id: &str, name: &str) -> Result<Bytes, BlobStoreError>;

    async fn delete(&self, integration_id: &str, name: &str) -> Result<(), BlobStoreError>;

    /// Merges `metadata` into the blob's existing metadata.
    async fn patch_metadata(
        &self,
        integration_id: &str,
        name: &str,
        metadata: Metadata,
    ) -> Result<(), BlobStoreError>;

    async fn metadata(&self, integration_id: &str, name: &str) -> Result<Metadata, BlobStoreError>;
}

/// Process-local store. Used by tests and single-process development setups.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, (Bytes, Metadata)>>,
}

impl MemoryBlobStore {
    pub fn contains(&self, integration_id: &str, name: &str) -> bool {
        self.blobs
            .read()
            .contains_key(&object_key(integration_id, name))
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(
        &self,
        integration_id: &str,
        name: &str,
        contents: Bytes,
        metadata: Metadata,
    ) -> Result<(), BlobStoreError> {
        self.blobs
            .write()
            .insert(object_key(integration_id, name), (contents, metadata));
        Ok(())
    }

    async fn get(&self, integration_id: &str, name: &str) -> Result<Bytes, BlobStoreError> {
        let key = object_key(integration_id, name);
        self.blobs
            .read()
            .get(&key)
            .map(|(contents, _)| contents.clone())
            .ok_or(BlobStoreError::NotFound(key))
    }

    async fn delete(&self, integration_id: &str, name: &str) -> Result<(), BlobStoreError> {
        let key = object_key(integration_id, name);
        self.blobs
            .write()
            .remove(&key)
            .map(|_| ())
            .ok_or(BlobStoreError::NotFound(key))
    }

    async fn patch_metadata(
        &self,
        integration_id: &str,
        name: &str,
        metadata: Metadata,
    ) -> Result<(), BlobStoreError> {
        let key = object_key(integration_id, name);
        let mut blobs = self.blobs.write();
        let (_, existing) = blobs.get_mut(&key).ok_or(BlobStoreError::NotFound(key))?;
        existing.extend(metadata);
        Ok(())
    }

    async fn metadata(&self, integration_id: &str, name: &str) -> Result<Metadata, BlobStoreError> {
        let key = object_key(integration_id, name);
        self.blobs
            .read()
            .get(&key)
            .map(|(_, metadata)| metadata.clone())
            .ok_or(BlobStoreError::NotFound(key))
    }
}

/// Stores blobs below `base_dir/{integration_id}/`, with metadata in a
/// `{name}.meta.json` sidecar next to each blob.
pub struct FilesystemBlobStore {
    base_dir: PathBuf,
}

impl FilesystemBlobStore {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        FilesystemBlobStore {
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }

    fn blob_path(&self, integration_id: &str, name: &str) -> PathBuf {
        self.base_dir.join(integration_id).join(name)
    }

    fn metadata_path(&self, integration_id: &str, name: &str) -> PathBuf {
        self.base_dir
            .join(integration_id)
            .join(format!("{name}.meta.json"))
    }

    async fn write_metadata(
        &self,
        integration_id: &str,
        name: &str,
        metadata: &Metadata,
    ) -> Result<(), BlobStoreError> {
        let encoded = serde_json::to_vec(metadata)?;
        tokio::fs::write(self.metadata_path(integration_id, name), encoded).await?;
        Ok(())
    }
}

fn not_found_as(key: String) -> impl FnOnce(io::Error) -> BlobStoreError {
    move |e| match e.kind() {
        io::ErrorKind::NotFound => BlobStoreError::NotFound(key),
        _ => BlobStoreError::Io(e),
    }
}

#[async_trait]
impl BlobStore for FilesystemBlobStore {
    async fn put(
        &self,
        integration_id: &str,
        name: &str,
        contents: Bytes,
        metadata: Metadata,
    ) -> Result<(), BlobStoreError> {
        tokio::fs::create_dir_all(self.base_dir.join(integration_id)).await?;
        tokio::fs::write(self.blob_path(integration_id, name), &contents).await?;
        self.write_metadata(integration_id, name, &metadata).await
    }

    async fn get(&self, integration_id: &str, name: &str) -> Result<Bytes, BlobStoreError> {
        tokio::fs::read(self.blob_path(integration_id, name))
            .await
            .map(Bytes::from)
            .map_err(not_found_as(object_key(integration_id, name)))
    }

    async fn delete(&self, integration_id: &str, name: &str) -> Result<(), BlobStoreError> {
        tokio::fs::remove_file(self.blob_path(integration_id, name))
            .await
            .map_err(not_found_as(object_key(integration_id, name)))?;
        match tokio::fs::remove_file(self.metadata_path(integration_id, name)).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    async fn patch_metadata(
        &self,
        integration_id: &str,
        name: &str,
        metadata: Metadata,
    ) -> Result<(), BlobStoreError> {
        let mut existing = self.metadata(integration_id, name).await?;
        existing.extend(metadata);
        self.write_metadata(integration_id, name, &existing).await
    }

    async fn metadata(&self, integration_id: &str, name: &str) -> Result<Metadata, BlobStoreError> {
        let key = object_key(integration_id, name);
        if !tokio::fs::try_exists(self.blob_path(integration_id, name)).await? {
            return Err(BlobStoreError::NotFound(key));
        }
        match tokio::fs::read(self.metadata_path(integration_id, name)).await {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Metadata::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Deserialize)]
struct ObjectResource {
    #[serde(default)]
    metadata: Metadata,
}

/// Google Cloud Storage through its JSON API.
pub struct GcsBlobStore {
    client: reqwest::Client,
    base_url: Url,
    bucket: String,
    credentials: Credentials,
    retry_policy: RetryPolicy,
}

impl GcsBlobStore {
    pub fn new(
        bucket: &str,
        credentials: Credentials,
        retry_policy: RetryPolicy,
    ) -> Result<Self, BlobStoreError> {
        let base_url = Url::parse(GCS_BASE_URL)
            .map_err(|_| BlobStoreError::InvalidUrl(GCS_BASE_URL.to_string()))?;
        Ok(Self::with_base_url(
            base_url,
            bucket,
            credentials,
            retry_policy,
        ))
    }

    pub fn with_base_url(
        base_url: Url,
        bucket: &str,
        credentials: Credentials,
        retry_policy: RetryPolicy,
    ) -> Self {
        GcsBlobStore {
            client: reqwest::Client::new(),
            base_url,
            bucket: bucket.to_string(),
            credentials,
            retry_policy,
        }
    }

    fn object_url(&self, key: &str, upload: bool) -> Result<Url, BlobStoreError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| BlobStoreError::InvalidUrl(self.base_url.to_string()))?;
            segments.pop_if_empty();
            if upload {
                segments.push("upload");
            }
            segments.extend(["storage", "v1", "b", self.bucket.as_str(), "o"]);
            if !upload {
                // Pushed as a single segment: the '/' in the key is percent-encoded.
                segments.push(key);
            }
        }
        Ok(url)
    }

    /// Authorization headers for the next request. The credentials cache and
    /// refresh the underlying token.
    async fn auth_headers(&self) -> Result<HeaderMap, BlobStoreError> {
        match self.credentials.headers(Extensions::new()).await? {
            CacheableResource::New { data, .. } => Ok(data),
            // Only returned when the request carried an entity tag.
            CacheableResource::NotModified => Ok(HeaderMap::new()),
        }
    }

    async fn send(
        &self,
        key: &str,
        build: impl Fn(&reqwest::Client) -> Result<reqwest::RequestBuilder, BlobStoreError>,
    ) -> Result<reqwest::Response, BlobStoreError> {
        retry(&self.retry_policy, BlobStoreError::is_transient, || async {
            let request = build(&self.client)?.headers(self.auth_headers().await?);
            let response = request.send().await?;
            match response.status() {
                status if status.is_success() => Ok(response),
                StatusCode::NOT_FOUND => Err(BlobStoreError::NotFound(key.to_string())),
                status => Err(BlobStoreError::Status {
                    status: status.as_u16(),
                    key: key.to_string(),
                }),
            }
        })
        .await
    }
}

#[async_trait]
impl BlobStore for GcsBlobStore {
    async fn put(
        &self,
        integration_id: &str,
        name: &str,
        contents: Bytes,
        metadata: Metadata,
    ) -> Result<(), BlobStoreError> {
        let key = object_key(integration_id, name);
        let url = self.object_url(&key, true)?;
        self.send(&key, |client| {
            Ok(client
                .request(Method::POST, url.clone())
                .query(&[("uploadType", "media"), ("name", key.as_str())])
                .header("Content-Type", "application/xml")
                .body(contents.clone()))
        })
        .await?;

        if !metadata.is_empty() {
            self.patch_metadata(integration_id, name, metadata).await?;
        }
        Ok(())
    }

    async fn get(&self, integration_id: &str, name: &str) -> Result<Bytes, BlobStoreError> {
        let key = object_key(integration_id, name);
        let url = self.object_url(&key, false)?;
        let response = self
            .send(&key, |client| {
                Ok(client.get(url.clone()).query(&[("alt", "media")]))
            })
            .await?;
        Ok(response.bytes().await?)
    }

    async fn delete(&self, integration_id: &str, name: &str) -> Result<(), BlobStoreError> {
        let key = object_key(integration_id, name);
        let url = self.object_url(&key, false)?;
        self.send(&key, |client| Ok(client.delete(url.clone())))
            .await?;
        Ok(())
    }

    async fn patch_metadata(
        &self,
        integration_id: &str,
        name: &str,
        metadata: Metadata,
    ) -> Result<(), BlobStoreError> {
        let key = object_key(integration_id, name);
        let url = self.object_url(&key, false)?;
        let body = serde_json::json!({ "metadata": metadata });
        self.send(&key, |client| {
            Ok(client.request(Method::PATCH, url.clone()).json(&body))
        })
        .await?;
        Ok(())
    }

    async fn metadata(&self, integration_id: &str, name: &str) -> Result<Metadata, BlobStoreError> {
        let key = object_key(integration_id, name);
        let url = self.object_url(&key, false)?;
        let response = self
            .send(&key, |client| Ok(client.get(url.clone())))
            .await?;
        let object: ObjectResource = response.json().await?;
        Ok(object.metadata)
    }
}
