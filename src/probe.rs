//! API document probing
//!
//! A [`SpecProbe`] fetches the documentation document served at a candidate
//! `host:port` location. A [`DocumentProcessor`] turns a fetched document into
//! the entry stored in the discovered specs map.

use crate::{KubedoxError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tracing::{debug, error, info};

/// Document fetched from a candidate location
#[derive(Debug, Clone, PartialEq)]
pub struct ProbedDocument {
    pub url: String,
    pub body: Bytes,
}

#[async_trait]
pub trait SpecProbe: Send + Sync {
    /// Fetch the document at `location` (`host:port`). Any failure excludes
    /// the location and yields `None`; probes are never retried.
    async fn probe(&self, location: &str) -> Option<ProbedDocument>;
}

/// Plain HTTP probe with a bounded timeout
pub struct HttpProbe {
    client: reqwest::Client,
    spec_path: String,
}

impl HttpProbe {
    pub fn new(timeout: Duration, spec_path: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| KubedoxError::ConfigError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self::with_client(client, spec_path))
    }

    pub fn with_client(client: reqwest::Client, spec_path: &str) -> Self {
        Self {
            client,
            spec_path: spec_path.trim_start_matches('/').to_string(),
        }
    }

    pub fn url_for(&self, location: &str) -> String {
        format!("http://{}/{}", location, self.spec_path)
    }
}

#[async_trait]
impl SpecProbe for HttpProbe {
    async fn probe(&self, location: &str) -> Option<ProbedDocument> {
        let url = self.url_for(location);
        info!("Probing API location: {}", url);

        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                error!("Request to {} failed: {}", url, e);
                return None;
            }
        };

        if response.status() != reqwest::StatusCode::OK {
            error!("Response from {} with code: {}", url, response.status());
            return None;
        }

        match response.bytes().await {
            Ok(body) => Some(ProbedDocument { url, body }),
            Err(e) => {
                error!("Failed to read body from {}: {}", url, e);
                None
            }
        }
    }
}

/// Transforms a fetched document into a `(path, bytes)` entry of the specs map
pub trait DocumentProcessor: Send + Sync {
    fn process(&self, hostname: &str, document: &ProbedDocument) -> Result<(String, Bytes)>;
}

/// Keeps documents unchanged after checking they parse as JSON
#[derive(Debug, Clone, Default)]
pub struct PassthroughProcessor {
    spec_dir: String,
}

impl PassthroughProcessor {
    pub fn new(spec_dir: &str) -> Self {
        Self {
            spec_dir: spec_dir.trim_end_matches('/').to_string(),
        }
    }

    pub fn path_for(&self, hostname: &str) -> String {
        format!("{}/{}", self.spec_dir, hostname)
    }
}

impl DocumentProcessor for PassthroughProcessor {
    fn process(&self, hostname: &str, document: &ProbedDocument) -> Result<(String, Bytes)> {
        serde_json::from_slice::<serde_json::Value>(&document.body).map_err(|e| {
            KubedoxError::InvalidDocument {
                hostname: hostname.to_string(),
                reason: e.to_string(),
            }
        })?;

        let path = self.path_for(hostname);
        debug!("Loaded API document {} from {}", path, document.url);
        Ok((path, document.body.clone()))
    }
}
