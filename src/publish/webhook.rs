//! Chat sink: Discord and Slack compatible incoming webhooks.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{render, Publisher};
use crate::archiver::Collect;
use crate::config::Config;
use crate::reduxer::Bundles;

/// Discord refuses longer message contents.
const MAX_MESSAGE_CHARS: usize = 2000;

#[derive(Debug)]
pub struct ChatWebhook {
    http: Client,
    url: String,
}

impl ChatWebhook {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create webhook HTTP client")?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }
}

/// Chat publisher when `CHAT_WEBHOOK_URL` is set.
///
/// # Errors
///
/// Returns an error if the client cannot be built.
pub fn setup(config: &Config) -> Result<Option<Arc<dyn Publisher>>> {
    let Some(url) = &config.chat_webhook_url else {
        return Ok(None);
    };
    Ok(Some(Arc::new(ChatWebhook::new(url.clone())?)))
}

#[async_trait]
impl Publisher for ChatWebhook {
    async fn publish(&self, _token: &CancellationToken, bundles: &Bundles, cols: &[Collect]) -> Result<()> {
        let message = render::truncate(&render::markdown(cols, bundles), MAX_MESSAGE_CHARS);

        // Discord reads `content`, Slack reads `text`
        let response = self
            .http
            .post(&self.url)
            .json(&json!({ "content": message, "text": message }))
            .send()
            .await
            .context("Failed to post to chat webhook")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Chat webhook returned HTTP {status}: {body}");
        }

        debug!(status = %status, "Posted to chat webhook");
        Ok(())
    }
}
