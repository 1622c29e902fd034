use crate::config::IntegrationConfig;
use reqwest::{StatusCode, Url};
use shared::retry::{RetryPolicy, retry};
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum VendorError {
    #[error("request to {endpoint} failed: {source}")]
    Http {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{endpoint} returned {status}")]
    Status { endpoint: String, status: StatusCode },
}

impl VendorError {
    pub fn is_transient(&self) -> bool {
        match self {
            VendorError::Http { source, .. } => source.is_connect() || source.is_timeout(),
            VendorError::Status { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
        }
    }
}

/// Client for the two XML endpoints of one vendor account.
///
/// Responses are returned undecoded: they are stored verbatim and only parsed
/// during processing.
pub struct VendorClient {
    client: reqwest::Client,
    integration_id: String,
    username: String,
    password: String,
    data_endpoint: Url,
    transmissions_endpoint: Url,
    retry_policy: RetryPolicy,
}

impl VendorClient {
    pub fn new(
        integration: &IntegrationConfig,
        retry_policy: RetryPolicy,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(integration.timeout_secs))
            .build()?;

        Ok(VendorClient {
            client,
            integration_id: integration.id.clone(),
            username: integration.username.clone(),
            password: integration.password.clone(),
            data_endpoint: integration.data_endpoint.clone(),
            transmissions_endpoint: integration.transmissions_endpoint.clone(),
            retry_policy,
        })
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub async fn fetch_data_points(&self) -> Result<String, VendorError> {
        tracing::info!(integration_id = %self.integration_id, "Getting data points");
        self.fetch(&self.data_endpoint).await
    }

    pub async fn fetch_transmissions(&self) -> Result<String, VendorError> {
        tracing::info!(integration_id = %self.integration_id, "Getting transmissions");
        self.fetch(&self.transmissions_endpoint).await
    }

    async fn fetch(&self, endpoint: &Url) -> Result<String, VendorError> {
        let http_error = |source| VendorError::Http {
            endpoint: endpoint.to_string(),
            source,
        };

        retry(&self.retry_policy, VendorError::is_transient, || async {
            let response = self
                .client
                .get(endpoint.clone())
                .basic_auth(&self.username, Some(&self.password))
                .send()
                .await
                .map_err(http_error)?;

            let status = response.status();
            if !status.is_success() {
                return Err(VendorError::Status {
                    endpoint: endpoint.to_string(),
                    status,
                });
            }
            response.text().await.map_err(http_error)
        })
        .await
    }
}
