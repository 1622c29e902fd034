//! Draining of pending data points files.
//!
//! Every file goes through claim → download → parse → transform → send →
//! finalize on its own. Workers in other processes may drain the same
//! integration concurrently; the claim is the only coordination between them.

use crate::activity::ActivityLog;
use crate::blob_store::BlobStore;
use crate::errors::{IngestError, Result};
use crate::lifecycle::{ClaimOutcome, Lifecycle};
use crate::metrics_defs::{FILE_PROCESSING_DURATION, FILES_FAILED, OBSERVATIONS_SENT};
use crate::parse::{parse_data_points, parse_transmissions};
use crate::sender::ObservationSender;
use crate::transform::{batches, normalize, select_gmt_offsets};
use crate::types::{FileKind, FileName};
use shared::{counter, histogram};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

const ACTION: &str = "process";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileOutcome {
    Processed { observations: usize },
    /// Claimed by another worker, or no longer pending.
    Skipped,
}

impl FileOutcome {
    pub fn observations(&self) -> usize {
        match self {
            FileOutcome::Processed { observations } => *observations,
            FileOutcome::Skipped => 0,
        }
    }
}

#[derive(Clone)]
pub struct Processor {
    lifecycle: Lifecycle,
    blobs: Arc<dyn BlobStore>,
    sender: Arc<dyn ObservationSender>,
    activity: ActivityLog,
    batch_size: usize,
}

impl Processor {
    pub fn new(
        lifecycle: Lifecycle,
        blobs: Arc<dyn BlobStore>,
        sender: Arc<dyn ObservationSender>,
        activity: ActivityLog,
        batch_size: usize,
    ) -> Self {
        Processor {
            lifecycle,
            blobs,
            sender,
            activity,
            batch_size,
        }
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Processes every pending file of `integration_id` and returns the number
    /// of observations sent.
    ///
    /// A failing file is recorded as an error in the activity log and left in
    /// progress; the remaining files are still processed. The integration is
    /// marked healthy again when no file failed.
    pub async fn drain_pending(&self, integration_id: &str) -> Result<usize> {
        let files = self.lifecycle.pending_for(integration_id).await?;
        tracing::info!(integration_id, count = files.len(), "Processing pending files");

        let mut observations = 0;
        let mut failed = 0;
        for file_name in &files {
            match self.process_file(file_name).await {
                Ok(outcome) => observations += outcome.observations(),
                Err(e) => {
                    failed += 1;
                    self.activity.error(
                        integration_id,
                        ACTION,
                        format!(
                            "Error processing data file {file_name} for integration {integration_id} (skipped): {e}"
                        ),
                    );
                }
            }
        }

        if failed == 0 {
            self.activity.mark_healthy(integration_id);
        }
        tracing::info!(integration_id, observations, failed, "Pending files processed");
        Ok(observations)
    }

    /// Claims and processes one data points file.
    ///
    /// Returns [`FileOutcome::Skipped`] without doing anything when the file
    /// cannot be claimed. Any error after the claim leaves the file in progress.
    pub async fn process_file(&self, file_name: &str) -> Result<FileOutcome> {
        let name: FileName = file_name
            .parse()
            .map_err(|_| IngestError::InvalidFileName(file_name.to_string()))?;
        if name.kind() != FileKind::DataPoints {
            return Err(IngestError::InvalidFileName(file_name.to_string()));
        }

        if self.lifecycle.claim(file_name).await? == ClaimOutcome::AlreadyClaimed {
            return Ok(FileOutcome::Skipped);
        }

        let start = Instant::now();
        let result = self.process_claimed(&name).await;
        histogram!(FILE_PROCESSING_DURATION).record(start.elapsed().as_secs_f64());

        match result {
            Ok(observations) => Ok(FileOutcome::Processed { observations }),
            Err(e) => {
                counter!(FILES_FAILED).increment(1);
                tracing::error!(file_name, error = %e, "Failed to process file");
                Err(e)
            }
        }
    }

    async fn process_claimed(&self, name: &FileName) -> Result<usize> {
        let integration_id = name.integration_id();
        let file_name = name.to_string();

        tracing::info!(integration_id, file_name = %file_name, "Downloading data file");
        let data_xml = self.blobs.get(integration_id, &file_name).await?;
        let offsets = self.gmt_offsets(name).await;

        let data_points = match parse_data_points(&data_xml) {
            Ok(data_points) => data_points,
            Err(e) => {
                self.activity.error(
                    integration_id,
                    ACTION,
                    format!("Error parsing '{file_name}': {e}. Integration ID: {integration_id}."),
                );
                return Err(e.into());
            }
        };
        if data_points.is_empty() {
            tracing::warn!(integration_id, file_name = %file_name, "No data points were extracted");
        }

        let mut sent = 0;
        for (serial_num, points) in &data_points {
            let offset = offsets.get(serial_num).copied().unwrap_or(0);
            let observations = normalize(serial_num, points, offset);
            if observations.is_empty() {
                tracing::warn!(
                    integration_id,
                    device = %serial_num,
                    "No observations after transformation"
                );
                continue;
            }

            for (i, batch) in batches(&observations, self.batch_size).enumerate() {
                tracing::info!(
                    integration_id,
                    device = %serial_num,
                    batch = i,
                    count = batch.len(),
                    "Sending observations"
                );
                self.sender.send(integration_id, batch).await?;
                counter!(OBSERVATIONS_SENT).increment(batch.len() as u64);
                sent += batch.len();
            }
        }

        self.lifecycle.finalize(&file_name).await?;
        Ok(sent)
    }

    /// Offsets derived from the companion transmissions file. Any failure to
    /// read it is a warning and every device falls back to UTC.
    async fn gmt_offsets(&self, name: &FileName) -> HashMap<String, i32> {
        let integration_id = name.integration_id();
        let companion = name.companion().to_string();

        let raw = match self.blobs.get(integration_id, &companion).await {
            Ok(raw) => raw,
            Err(e) => {
                self.activity.warning(
                    integration_id,
                    ACTION,
                    format!("Error downloading transmissions file {companion}: {e}. Defaulting to UTC."),
                );
                return HashMap::new();
            }
        };

        match parse_transmissions(&raw) {
            Ok(transmissions) => select_gmt_offsets(&transmissions, integration_id, &self.activity),
            Err(e) => {
                self.activity.warning(
                    integration_id,
                    ACTION,
                    format!("Error parsing '{companion}': {e}. Defaulting to UTC."),
                );
                HashMap::new()
            }
        }
    }
}
