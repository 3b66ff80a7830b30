//! IPFS slot: fetch a page and pin it through a local IPFS daemon.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::multipart;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::archiver::SlotArchiver;
use crate::config::Config;
use crate::constants::HTTP_TIMEOUT_SECS;
use crate::reduxer::capture::fetch_html;

/// Response of `/api/v0/add`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AddResponse {
    hash: String,
}

#[derive(Debug, Clone)]
pub struct IpfsClient {
    http: reqwest::Client,
    api_url: String,
    gateway_url: String,
}

impl IpfsClient {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .user_agent(&config.user_agent)
            .build()
            .context("Failed to create IPFS HTTP client")?;

        let mut gateway_url = config.ipfs_gateway_url.clone();
        if !gateway_url.ends_with('/') {
            gateway_url.push('/');
        }

        Ok(Self {
            http,
            api_url: config.ipfs_api_url.trim_end_matches('/').to_string(),
            gateway_url,
        })
    }

    /// Pin bytes and return the CID.
    ///
    /// # Errors
    ///
    /// Returns an error if the daemon rejects the content.
    pub async fn pin_bytes(&self, data: &[u8], filename: &str) -> Result<String> {
        let part = multipart::Part::bytes(data.to_vec()).file_name(filename.to_string());
        let form = multipart::Form::new().part("file", part);

        let url = format!("{}/api/v0/add?pin=true", self.api_url);
        debug!(url = %url, filename = %filename, size = data.len(), "Pinning bytes to IPFS");

        let response = self
            .http
            .post(&url)
            .multipart(form)
            .send()
            .await
            .context("Failed to send request to IPFS daemon")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            anyhow::bail!("IPFS add failed: {status} - {body}");
        }

        let add_response: AddResponse = response
            .json()
            .await
            .context("Failed to parse IPFS add response")?;

        info!(cid = %add_response.hash, filename = %filename, "Pinned bytes to IPFS");
        Ok(add_response.hash)
    }

    #[must_use]
    pub fn gateway_url(&self, cid: &str) -> String {
        format!("{}{cid}", self.gateway_url)
    }
}

#[async_trait]
impl SlotArchiver for IpfsClient {
    async fn wayback(&self, _token: &CancellationToken, url: &Url) -> Result<String> {
        let html = fetch_html(&self.http, url).await?;
        let cid = self.pin_bytes(html.as_bytes(), "index.html").await?;
        Ok(self.gateway_url(&cid))
    }
}
