use crate::activity::ActivityLog;
use crate::blob_store::{BlobStore, Metadata};
use crate::errors::Result;
use crate::lifecycle::Lifecycle;
use crate::metrics_defs::FILES_RETRIEVED;
use crate::types::{FileKind, FileName, FileStatus};
use crate::vendor::VendorClient;
use bytes::Bytes;
use chrono::Utc;
use shared::counter;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetrievedFiles {
    pub data_points: FileName,
    pub transmissions: FileName,
}

/// Pulls both payloads of an integration, stores them as companion blobs and
/// registers the data points file as pending.
///
/// Either fetch failing aborts the run before anything is stored. The
/// transmissions blob is uploaded first and is not rolled back if the data
/// points upload fails.
pub async fn retrieve(
    integration_id: &str,
    vendor: &VendorClient,
    blobs: &dyn BlobStore,
    lifecycle: &Lifecycle,
    activity: &ActivityLog,
) -> Result<RetrievedFiles> {
    let data_points = FileName::new(Utc::now(), integration_id, FileKind::DataPoints);
    let transmissions = data_points.companion();

    let (data_xml, transmissions_xml) =
        match tokio::try_join!(vendor.fetch_data_points(), vendor.fetch_transmissions()) {
            Ok(payloads) => payloads,
            Err(e) => {
                activity.error(
                    integration_id,
                    "pull",
                    format!("Error pulling observations: {e}"),
                );
                return Err(e.into());
            }
        };

    let metadata = Metadata::from([
        ("integration_id".to_string(), integration_id.to_string()),
        ("account_username".to_string(), vendor.username().to_string()),
        ("status".to_string(), FileStatus::Pending.to_string()),
    ]);

    for (name, contents) in [(&transmissions, transmissions_xml), (&data_points, data_xml)] {
        tracing::info!(integration_id, file_name = %name, "Uploading file");
        blobs
            .put(
                integration_id,
                &name.to_string(),
                Bytes::from(contents),
                metadata.clone(),
            )
            .await?;
    }

    lifecycle.register_pending(&data_points.to_string()).await?;
    counter!(FILES_RETRIEVED).increment(1);
    activity.mark_healthy(integration_id);
    tracing::info!(integration_id, file_name = %data_points, "Observations pulled");

    Ok(RetrievedFiles {
        data_points,
        transmissions,
    })
}
