pub mod actions;
pub mod activity;
pub mod api;
pub mod blob_store;
pub mod config;
pub mod errors;
pub mod group_store;
pub mod lifecycle;
pub mod metrics_defs;
pub mod parse;
pub mod processing;
pub mod retrieval;
pub mod sender;
pub mod transform;
pub mod types;
pub mod vendor;

#[cfg(test)]
mod testutils;

use activity::ActivityLog;
use blob_store::{BlobStore, BlobStoreError};
use config::{Config, ConfigError};
use errors::{IngestError, Result};
use group_store::{GroupStore, GroupStoreError};
use lifecycle::Lifecycle;
use processing::Processor;
use retrieval::RetrievedFiles;
use sender::{HttpObservationSender, ObservationSender, SenderError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use types::FileName;
use vendor::VendorClient;

#[derive(thiserror::Error, Debug)]
pub enum SetupError {
    #[error("invalid config: {0}")]
    Config(#[from] ConfigError),
    #[error("could not create blob store: {0}")]
    BlobStore(#[from] BlobStoreError),
    #[error("could not create group store: {0}")]
    GroupStore(#[from] GroupStoreError),
    #[error("could not create sender: {0}")]
    Sender(#[from] SenderError),
    #[error("could not create vendor client: {0}")]
    Vendor(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything the pull and process actions need, built once from the config.
pub struct Services {
    config: Config,
    blobs: Arc<dyn BlobStore>,
    lifecycle: Lifecycle,
    processor: Processor,
    activity: ActivityLog,
    vendors: HashMap<String, VendorClient>,
}

impl Services {
    pub fn from_config(config: Config) -> Result<Self, SetupError> {
        config.validate()?;
        let blobs = config.build_blob_store()?;
        let groups = config.build_group_store()?;
        let sender = Arc::new(HttpObservationSender::new(
            &config.sender,
            config.retry_policy(),
        )?);
        Self::from_parts(config, blobs, groups, sender)
    }

    /// Wires the given stores and sender together. Vendor clients still come from `config`.
    pub fn from_parts(
        config: Config,
        blobs: Arc<dyn BlobStore>,
        groups: Arc<dyn GroupStore>,
        sender: Arc<dyn ObservationSender>,
    ) -> Result<Self, SetupError> {
        let activity = ActivityLog::default();
        let lifecycle = Lifecycle::new(groups, blobs.clone());
        let processor = Processor::new(
            lifecycle.clone(),
            blobs.clone(),
            sender,
            activity.clone(),
            config.sender.batch_size,
        );

        let mut vendors = HashMap::new();
        for integration in &config.integrations {
            vendors.insert(
                integration.id.clone(),
                VendorClient::new(integration, config.retry_policy())?,
            );
        }

        Ok(Services {
            config,
            blobs,
            lifecycle,
            processor,
            activity,
            vendors,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn processor(&self) -> &Processor {
        &self.processor
    }

    pub fn activity(&self) -> &ActivityLog {
        &self.activity
    }

    pub fn has_integration(&self, integration_id: &str) -> bool {
        self.vendors.contains_key(integration_id)
    }

    fn check_integration(&self, integration_id: &str) -> Result<()> {
        if self.has_integration(integration_id) {
            Ok(())
        } else {
            Err(IngestError::UnknownIntegration(integration_id.to_string()))
        }
    }

    pub async fn pull(&self, integration_id: &str) -> Result<RetrievedFiles> {
        let vendor = self
            .vendors
            .get(integration_id)
            .ok_or_else(|| IngestError::UnknownIntegration(integration_id.to_string()))?;
        retrieval::retrieve(
            integration_id,
            vendor,
            self.blobs.as_ref(),
            &self.lifecycle,
            &self.activity,
        )
        .await
    }

    pub async fn process(&self, integration_id: &str) -> Result<usize> {
        self.check_integration(integration_id)?;
        self.processor.drain_pending(integration_id).await
    }

    pub async fn reprocess(
        &self,
        integration_id: &str,
        file_name: &str,
    ) -> Result<actions::ReprocessResponse> {
        self.check_integration(integration_id)?;
        match file_name.parse::<FileName>() {
            Ok(name) if name.integration_id() == integration_id => {}
            _ => return Err(IngestError::InvalidFileName(file_name.to_string())),
        }
        actions::reprocess_file(&self.processor, file_name).await
    }
}

/// Runs the admin API and the pull and process schedules of every integration.
pub async fn run(config: Config) -> Result<(), SetupError> {
    let listener = config.listener.clone();
    let schedule = config.schedule;
    let services = Arc::new(Services::from_config(config)?);

    let mut tasks = JoinSet::new();
    for integration_id in services.vendors.keys() {
        let (pull_services, pull_id) = (services.clone(), integration_id.clone());
        tasks.spawn(every(schedule.pull_interval_secs, move || {
            let (services, integration_id) = (pull_services.clone(), pull_id.clone());
            async move {
                if let Err(e) = services.pull(&integration_id).await {
                    tracing::error!(%integration_id, error = %e, "Pull failed");
                }
            }
        }));

        let (process_services, process_id) = (services.clone(), integration_id.clone());
        tasks.spawn(every(schedule.process_interval_secs, move || {
            let (services, integration_id) = (process_services.clone(), process_id.clone());
            async move {
                if let Err(e) = services.process(&integration_id).await {
                    tracing::error!(%integration_id, error = %e, "Processing failed");
                }
            }
        }));
    }

    tracing::info!(host = %listener.host, port = listener.port, "Starting admin API");
    let result = api::serve(listener, services).await;
    tasks.abort_all();
    result.map_err(SetupError::Io)
}

async fn every<F, Fut>(interval_secs: u64, mut job: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        job().await;
    }
}
