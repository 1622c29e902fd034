use crate::config::SenderConfig;
use crate::types::NormalizedObservation;
use async_trait::async_trait;
use reqwest::Url;
use shared::retry::{RetryPolicy, retry};
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum SenderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("observations rejected with {status}: {body}")]
    Rejected { status: u16, body: String },
}

impl SenderError {
    pub fn is_transient(&self) -> bool {
        match self {
            SenderError::Http(e) => e.is_connect() || e.is_timeout(),
            SenderError::Rejected { status, .. } => *status == 429 || *status >= 500,
        }
    }
}

/// Delivers batches of observations to the tracking platform.
#[async_trait]
pub trait ObservationSender: Send + Sync {
    async fn send(
        &self,
        integration_id: &str,
        batch: &[NormalizedObservation],
    ) -> Result<(), SenderError>;
}

pub struct HttpObservationSender {
    client: reqwest::Client,
    url: Url,
    api_key: String,
    retry_policy: RetryPolicy,
}

impl HttpObservationSender {
    pub fn new(config: &SenderConfig, retry_policy: RetryPolicy) -> Result<Self, SenderError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(HttpObservationSender {
            client,
            url: config.url.clone(),
            api_key: config.api_key.clone(),
            retry_policy,
        })
    }
}

#[async_trait]
impl ObservationSender for HttpObservationSender {
    async fn send(
        &self,
        integration_id: &str,
        batch: &[NormalizedObservation],
    ) -> Result<(), SenderError> {
        retry(&self.retry_policy, SenderError::is_transient, || async {
            let response = self
                .client
                .post(self.url.clone())
                .bearer_auth(&self.api_key)
                .json(batch)
                .send()
                .await?;

            let status = response.status();
            if status.is_success() {
                return Ok(());
            }
            let body = response.text().await.unwrap_or_default();
            Err(SenderError::Rejected {
                status: status.as_u16(),
                body,
            })
        })
        .await?;

        tracing::debug!(integration_id, count = batch.len(), "Observations sent");
        Ok(())
    }
}
