//! Metadata fetcher for probing remote images with HEAD requests

use crate::error::{EdgeError, Result};
use crate::models::RemoteMetadata;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

/// MetadataFetcher issues body-less HEAD requests against the origin
#[derive(Clone)]
pub struct MetadataFetcher {
    client: Client,
}

impl MetadataFetcher {
    /// Create a new MetadataFetcher with default settings
    pub fn new() -> Result<Self> {
        Self::with_connect_timeout(Duration::from_secs(10))
    }

    /// Create a new MetadataFetcher with a custom connect timeout
    pub fn with_connect_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| EdgeError::Http(format!("Failed to create HTTP client: {}", e)))?;

        Ok(MetadataFetcher { client })
    }

    /// Share an existing client (connection pool) with the fetcher
    pub fn with_client(client: Client) -> Self {
        MetadataFetcher { client }
    }

    /// Probe a remote resource
    ///
    /// Any HTTP response counts as a successful probe; the Content-Length is
    /// only reported for 2xx responses so that error pages never validate a
    /// cached file. Transport failures are returned as
    /// `EdgeError::RemoteUnavailable`.
    pub async fn fetch_metadata(&self, url: &str) -> Result<RemoteMetadata> {
        debug!("Fetching metadata for url={}", url);

        let response = self.client.head(url).send().await.map_err(|e| {
            warn!("HEAD request failed for url={}: {}", url, e);
            EdgeError::RemoteUnavailable(format!("HEAD request failed: {}", e))
        })?;

        let status = response.status();
        let content_length = if status.is_success() {
            response
                .headers()
                .get(http::header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
        } else {
            None
        };

        debug!(
            "Received HEAD response for url={}: status={}, content_length={:?}",
            url, status, content_length
        );

        Ok(RemoteMetadata {
            status: status.as_u16(),
            content_length,
        })
    }
}
