//! Telegraph slot: republish the readable text of a page on telegra.ph.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::archiver::SlotArchiver;
use crate::config::Config;
use crate::constants::HTTP_TIMEOUT_SECS;
use crate::reduxer::capture::{extract_article, fetch_html};

/// Telegraph rejects titles longer than this.
const MAX_TITLE_CHARS: usize = 256;

/// Envelope of every Telegraph API response.
#[derive(Debug, Deserialize)]
struct Reply<T> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Account {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct Page {
    url: String,
}

#[derive(Debug)]
pub struct TelegraphClient {
    http: Client,
    endpoint: String,
    author: String,
    /// Created on first use when not configured.
    access_token: Mutex<Option<String>>,
}

impl TelegraphClient {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .user_agent(&config.user_agent)
            .build()
            .context("Failed to create Telegraph HTTP client")?;

        Ok(Self {
            http,
            endpoint: config.telegraph_endpoint.trim_end_matches('/').to_string(),
            author: config.telegraph_author.clone(),
            access_token: Mutex::new(config.telegraph_access_token.clone()),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, body: serde_json::Value) -> Result<T> {
        let response = self
            .http
            .post(format!("{}/{method}", self.endpoint))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Failed to call Telegraph {method}"))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Telegraph {method} returned HTTP {status}");
        }

        let reply: Reply<T> = response
            .json()
            .await
            .with_context(|| format!("Failed to parse Telegraph {method} response"))?;

        match reply {
            Reply {
                ok: true,
                result: Some(result),
                ..
            } => Ok(result),
            Reply { error, .. } => anyhow::bail!(
                "Telegraph {method} failed: {}",
                error.as_deref().unwrap_or("unknown error")
            ),
        }
    }

    async fn access_token(&self) -> Result<String> {
        let mut token = self.access_token.lock().await;
        if let Some(token) = token.as_ref() {
            return Ok(token.clone());
        }

        let account: Account = self
            .call(
                "createAccount",
                json!({ "short_name": "wayback", "author_name": self.author }),
            )
            .await?;
        info!("Created Telegraph account");

        *token = Some(account.access_token.clone());
        Ok(account.access_token)
    }

    /// Publish a page and return its URL.
    ///
    /// # Errors
    ///
    /// Returns an error if Telegraph rejects the page.
    pub async fn create_page(&self, title: &str, src: &Url, paragraphs: &[String]) -> Result<String> {
        let access_token = self.access_token().await?;

        let mut content = vec![json!({
            "tag": "p",
            "children": [{ "tag": "a", "attrs": { "href": src.as_str() }, "children": [src.as_str()] }],
        })];
        content.extend(paragraphs.iter().map(|p| json!({ "tag": "p", "children": [p] })));

        let page: Page = self
            .call(
                "createPage",
                json!({
                    "access_token": access_token,
                    "title": truncate(title, MAX_TITLE_CHARS),
                    "author_name": self.author,
                    "author_url": src.as_str(),
                    "content": content,
                }),
            )
            .await?;

        Ok(page.url)
    }
}

#[async_trait]
impl SlotArchiver for TelegraphClient {
    async fn wayback(&self, _token: &CancellationToken, url: &Url) -> Result<String> {
        let html = fetch_html(&self.http, url).await?;
        let article = extract_article(&html);
        if article.is_empty() {
            anyhow::bail!("no readable text found");
        }

        let title = article.title.clone().unwrap_or_else(|| url.to_string());
        debug!(url = %url, paragraphs = article.paragraphs.len(), "Publishing to Telegraph");

        let page = self.create_page(&title, url, &article.paragraphs).await?;
        info!(url = %url, page = %page, "Telegraph page created");
        Ok(page)
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
