use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error};
use url::Url;

use super::types::RemoteSpool;

const USER_AGENT: &str = concat!("spoolkeeper/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("Inventory service unreachable: {0}")]
    Unreachable(String),

    #[error("Inventory service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid inventory response: {0}")]
    Decode(String),

    #[error("Invalid inventory URL: {0}")]
    Url(String),
}

impl InventoryError {
    /// Whether the service could not be reached at all (as opposed to answering with an error).
    pub fn is_unreachable(&self) -> bool {
        matches!(self, InventoryError::Unreachable(_))
    }
}

/// Operations of the remote spool inventory.
#[async_trait]
pub trait InventoryService: Send + Sync {
    async fn list_spools(&self) -> Result<Vec<RemoteSpool>, InventoryError>;

    async fn get_spool(&self, id: i64) -> Result<RemoteSpool, InventoryError>;

    /// Report consumed grams; the service subtracts them from the spool.
    async fn use_weight(&self, id: i64, grams: f64) -> Result<(), InventoryError>;

    /// Overwrite the spool's remaining weight with a measurement.
    async fn set_remaining(&self, id: i64, grams: f64) -> Result<(), InventoryError>;

    /// Set one custom field. `value` is stored JSON-encoded.
    async fn set_extra(&self, id: i64, field: &str, value: &str) -> Result<(), InventoryError>;
}

/// Spoolman REST client (`/api/v1/spool`).
pub struct SpoolmanClient {
    client: reqwest::Client,
    base: Url,
}

impl SpoolmanClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, InventoryError> {
        let trimmed = base_url.trim().trim_end_matches('/');
        let base = Url::parse(&format!("{}/", trimmed))
            .map_err(|e| InventoryError::Url(format!("'{}': {}", base_url, e)))?;
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| InventoryError::Unreachable(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client, base })
    }

    fn url(&self, path: &str) -> Result<Url, InventoryError> {
        self.base
            .join(path)
            .map_err(|e| InventoryError::Url(format!("'{}': {}", path, e)))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, InventoryError> {
        let response = request
            .send()
            .await
            .map_err(|e| InventoryError::Unreachable(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read body>".to_string());
            let truncated = if body.len() > 512 {
                format!("{}...", body.chars().take(512).collect::<String>())
            } else {
                body
            };
            error!("Inventory request failed with {}: {}", status, truncated);
            return Err(InventoryError::Status {
                status: status.as_u16(),
                body: truncated,
            });
        }
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, InventoryError> {
        let url = self.url(path)?;
        debug!("GET {}", url);
        let response = self.send(self.client.get(url)).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| InventoryError::Decode(e.to_string()))
    }
}

#[async_trait]
impl InventoryService for SpoolmanClient {
    async fn list_spools(&self) -> Result<Vec<RemoteSpool>, InventoryError> {
        self.get_json("api/v1/spool").await
    }

    async fn get_spool(&self, id: i64) -> Result<RemoteSpool, InventoryError> {
        self.get_json(&format!("api/v1/spool/{}", id)).await
    }

    async fn use_weight(&self, id: i64, grams: f64) -> Result<(), InventoryError> {
        let url = self.url(&format!("api/v1/spool/{}/use", id))?;
        self.send(self.client.put(url).json(&json!({ "use_weight": grams })))
            .await?;
        Ok(())
    }

    async fn set_remaining(&self, id: i64, grams: f64) -> Result<(), InventoryError> {
        let url = self.url(&format!("api/v1/spool/{}", id))?;
        self.send(self.client.patch(url).json(&json!({ "remaining_weight": grams })))
            .await?;
        Ok(())
    }

    async fn set_extra(&self, id: i64, field: &str, value: &str) -> Result<(), InventoryError> {
        let url = self.url(&format!("api/v1/spool/{}", id))?;
        let encoded = serde_json::to_string(value).map_err(|e| InventoryError::Decode(e.to_string()))?;
        self.send(self.client.patch(url).json(&json!({ "extra": { field: encoded } })))
            .await?;
        Ok(())
    }
}
