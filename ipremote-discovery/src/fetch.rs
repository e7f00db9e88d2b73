//! Device description retrieval

use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use tracing::{debug, warn};

use crate::config::DiscoveryConfig;
use crate::description::DeviceDescription;
use crate::error::{DiscoveryError, Result};

/// Retrieves the description a sighting's `Location` points at.
pub trait DescriptionFetcher: Send + Sync {
    /// Fetch and parse the description at `location`.
    ///
    /// Transport failures are errors. Content that cannot be interpreted
    /// yields the empty description.
    fn fetch(&self, location: &str) -> Result<DeviceDescription>;
}

/// [`DescriptionFetcher`] over plain HTTP
pub struct HttpDescriptionFetcher {
    http_client: reqwest::blocking::Client,
    config: DiscoveryConfig,
}

impl HttpDescriptionFetcher {
    /// Create a fetcher with the given request timeout and default content types
    pub fn new(timeout: Duration) -> Result<Self> {
        Self::from_config(&DiscoveryConfig {
            http_timeout: timeout,
            ..Default::default()
        })
    }

    pub fn from_config(config: &DiscoveryConfig) -> Result<Self> {
        let http_client = reqwest::blocking::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(|e| {
                DiscoveryError::NetworkError(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            http_client,
            config: config.clone(),
        })
    }
}

impl DescriptionFetcher for HttpDescriptionFetcher {
    fn fetch(&self, location: &str) -> Result<DeviceDescription> {
        let response = self.http_client.get(location).send().map_err(|e| {
            DiscoveryError::NetworkError(format!("Failed to fetch device description: {}", e))
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DiscoveryError::NetworkError(format!(
                "HTTP {} from {}",
                status, location
            )));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        if let Some(content_type) = &content_type {
            if !self.config.accepts_content_type(content_type) {
                warn!(
                    "Unexpected content type {} for {}; using empty description",
                    content_type, location
                );
                return Ok(DeviceDescription::default());
            }
        }

        let xml = response.text().map_err(|e| {
            DiscoveryError::NetworkError(format!("Failed to read response body: {}", e))
        })?;

        match DeviceDescription::from_xml(&xml) {
            Ok(description) => {
                debug!("Fetched description of {} from {}", description.udn, location);
                Ok(description)
            }
            Err(e) => {
                warn!("Unreadable description at {}: {}", location, e);
                Ok(DeviceDescription::default())
            }
        }
    }
}
