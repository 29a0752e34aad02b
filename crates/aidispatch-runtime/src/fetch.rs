//! Fetches job input media referenced by `source_url`.

use std::time::Duration;

use bytes::Bytes;
use reqwest::Client;
use tracing::debug;

use aidispatch_core::{Error, Result};

#[derive(Clone)]
pub struct MediaFetcher {
    client: Client,
    timeout: Duration,
}

impl MediaFetcher {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// Download `url` in full. Every failure is scoped to the job.
    pub async fn fetch(&self, url: &str) -> Result<Bytes> {
        let mut req = self.client.get(url);
        if self.timeout > Duration::ZERO {
            req = req.timeout(self.timeout);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Fetch(format!("timed out fetching {} after {:?}", url, self.timeout))
            } else {
                Error::Fetch(format!("failed to fetch {}: {}", url, e))
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Fetch(format!(
                "failed to fetch {}: status {}",
                url, status
            )));
        }

        let data = resp
            .bytes()
            .await
            .map_err(|e| Error::Fetch(format!("failed to read {}: {}", url, e)))?;
        if data.is_empty() {
            return Err(Error::Fetch(format!("empty response from {}", url)));
        }
        debug!("Fetched {} bytes from {}", data.len(), url);
        Ok(data)
    }
}
