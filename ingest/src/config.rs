use crate::blob_store::{
    BlobStore, BlobStoreError, FilesystemBlobStore, GcsBlobStore, MemoryBlobStore,
};
use google_cloud_auth::credentials::{self, Credentials, anonymous, service_account};
use crate::group_store::{GroupStore, GroupStoreError, MemoryGroupStore, RedisGroupStore};
use serde::Deserialize;
use shared::retry::RetryPolicy;
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("listener port must not be 0")]
    InvalidPort,
    #[error("sender batch_size must be at least 1")]
    InvalidBatchSize,
    #[error("at least one integration must be configured")]
    NoIntegrations,
    #[error("integration id must not be empty")]
    EmptyIntegrationId,
    #[error("integration id {0:?} must not contain '_'")]
    InvalidIntegrationId(String),
    #[error("duplicate integration id {0:?}")]
    DuplicateIntegrationId(String),
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum BlobStoreConfig {
    Filesystem {
        base_dir: String,
    },
    Gcs {
        bucket: String,
        base_url: Option<Url>,
        #[serde(default)]
        credentials: GcsCredentials,
    },
    Memory,
}

#[derive(Clone, Deserialize, Debug, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
#[serde(tag = "type")]
pub enum GcsCredentials {
    /// Application Default Credentials: `GOOGLE_APPLICATION_CREDENTIALS`, the
    /// gcloud user login or the metadata server.
    #[default]
    Default,
    ServiceAccountKey { path: PathBuf },
    /// No Authorization header; for emulators.
    Anonymous,
}

impl GcsCredentials {
    fn build(&self) -> Result<Credentials, BlobStoreError> {
        match self {
            GcsCredentials::Default => Ok(credentials::Builder::default().build()?),
            GcsCredentials::ServiceAccountKey { path } => {
                let invalid = |reason: String| BlobStoreError::ServiceAccountKey {
                    path: path.display().to_string(),
                    reason,
                };
                let raw = std::fs::read(path).map_err(|e| invalid(e.to_string()))?;
                let key: serde_json::Value =
                    serde_json::from_slice(&raw).map_err(|e| invalid(e.to_string()))?;
                Ok(service_account::Builder::new(key).build()?)
            }
            GcsCredentials::Anonymous => Ok(anonymous::Builder::new().build()),
        }
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum GroupStoreConfig {
    Redis {
        url: String,
        key_prefix: Option<String>,
    },
    Memory,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

impl Default for Listener {
    fn default() -> Self {
        Listener {
            host: "127.0.0.1".into(),
            port: 3000,
        }
    }
}

#[derive(Clone, Deserialize, PartialEq)]
pub struct SenderConfig {
    pub url: Url,
    pub api_key: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_sender_timeout")]
    pub timeout_secs: u64,
}

impl fmt::Debug for SenderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SenderConfig")
            .field("url", &self.url.as_str())
            .field("batch_size", &self.batch_size)
            .field("timeout_secs", &self.timeout_secs)
            .finish_non_exhaustive()
    }
}

fn default_batch_size() -> usize {
    200
}

fn default_sender_timeout() -> u64 {
    60
}

#[derive(Clone, Copy, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub attempts: u32,
    pub wait_initial_ms: u64,
    pub wait_max_ms: u64,
    pub wait_jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            attempts: 5,
            wait_initial_ms: 1000,
            wait_max_ms: 30_000,
            wait_jitter_ms: 3000,
        }
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(config: RetryConfig) -> Self {
        RetryPolicy {
            attempts: config.attempts,
            wait_initial: Duration::from_millis(config.wait_initial_ms),
            wait_max: Duration::from_millis(config.wait_max_ms),
            wait_jitter: Duration::from_millis(config.wait_jitter_ms),
        }
    }
}

#[derive(Clone, Copy, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct ScheduleConfig {
    pub pull_interval_secs: u64,
    pub process_interval_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        ScheduleConfig {
            pull_interval_secs: 3600,
            process_interval_secs: 600,
        }
    }
}

/// One vendor account.
#[derive(Clone, Deserialize, PartialEq)]
pub struct IntegrationConfig {
    pub id: String,
    pub username: String,
    pub password: String,
    pub data_endpoint: Url,
    pub transmissions_endpoint: Url,
    #[serde(default = "default_vendor_timeout")]
    pub timeout_secs: u64,
}

impl fmt::Debug for IntegrationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntegrationConfig")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("data_endpoint", &self.data_endpoint.as_str())
            .field("transmissions_endpoint", &self.transmissions_endpoint.as_str())
            .field("timeout_secs", &self.timeout_secs)
            .finish_non_exhaustive()
    }
}

fn default_vendor_timeout() -> u64 {
    120
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub listener: Listener,
    pub blob_store: BlobStoreConfig,
    pub group_store: GroupStoreConfig,
    pub sender: SenderConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    pub integrations: Vec<IntegrationConfig>,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listener.port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if self.sender.batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize);
        }
        if self.integrations.is_empty() {
            return Err(ConfigError::NoIntegrations);
        }

        let mut seen = HashSet::new();
        for integration in &self.integrations {
            let id = integration.id.as_str();
            if id.is_empty() {
                return Err(ConfigError::EmptyIntegrationId);
            }
            // The id is a segment of `{timestamp}_{id}_{kind}.xml`.
            if id.contains('_') {
                return Err(ConfigError::InvalidIntegrationId(id.to_string()));
            }
            if !seen.insert(id) {
                return Err(ConfigError::DuplicateIntegrationId(id.to_string()));
            }
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.into()
    }

    pub fn build_blob_store(&self) -> Result<Arc<dyn BlobStore>, BlobStoreError> {
        let store: Arc<dyn BlobStore> = match &self.blob_store {
            BlobStoreConfig::Filesystem { base_dir } => {
                Arc::new(FilesystemBlobStore::new(base_dir))
            }
            BlobStoreConfig::Gcs {
                bucket,
                base_url,
                credentials,
            } => {
                let credentials = credentials.build()?;
                let store = match base_url {
                    Some(base_url) => GcsBlobStore::with_base_url(
                        base_url.clone(),
                        bucket,
                        credentials,
                        self.retry_policy(),
                    ),
                    None => GcsBlobStore::new(bucket, credentials, self.retry_policy())?,
                };
                Arc::new(store)
            }
            BlobStoreConfig::Memory => Arc::new(MemoryBlobStore::default()),
        };
        Ok(store)
    }

    pub fn build_group_store(&self) -> Result<Arc<dyn GroupStore>, GroupStoreError> {
        let store: Arc<dyn GroupStore> = match &self.group_store {
            GroupStoreConfig::Redis { url, key_prefix } => Arc::new(RedisGroupStore::new(
                url,
                key_prefix.as_deref(),
                self.retry_policy(),
            )?),
            GroupStoreConfig::Memory => Arc::new(MemoryGroupStore::default()),
        };
        Ok(store)
    }
}
