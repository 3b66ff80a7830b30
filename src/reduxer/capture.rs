//! Fetching the raw material of a bundle.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use scraper::{Html, Selector};
use url::Url;

use super::screenshot::{ScreenshotConfig, ScreenshotService};
use crate::constants::{HTTP_TIMEOUT_SECS, MAX_HTML_BYTES};

/// Source of the assets captured for one URL.
#[async_trait]
pub trait Capturer: Send + Sync {
    async fn html(&self, url: &Url) -> Result<String>;

    /// PNG screenshot of the rendered page.
    async fn screenshot(&self, url: &Url) -> Result<Vec<u8>>;

    async fn pdf(&self, url: &Url) -> Result<Vec<u8>>;

    /// Release whatever the capturer started, such as a browser process.
    async fn shutdown(&self) {}
}

/// Fetches HTML over HTTP and renders through headless Chromium.
#[derive(Debug)]
pub struct BrowserCapturer {
    client: Client,
    browser: ScreenshotService,
}

impl BrowserCapturer {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(user_agent: &str, screenshot: ScreenshotConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .context("Failed to build capture HTTP client")?;

        Ok(Self {
            client,
            browser: ScreenshotService::new(screenshot),
        })
    }
}

#[async_trait]
impl Capturer for BrowserCapturer {
    async fn html(&self, url: &Url) -> Result<String> {
        fetch_html(&self.client, url).await
    }

    async fn screenshot(&self, url: &Url) -> Result<Vec<u8>> {
        self.browser.capture(url.as_str()).await
    }

    async fn pdf(&self, url: &Url) -> Result<Vec<u8>> {
        self.browser.pdf(url.as_str()).await
    }

    async fn shutdown(&self) {
        self.browser.shutdown().await;
    }
}

/// GET `url` and return its body as text.
///
/// # Errors
///
/// Returns an error on transport failure, a non-2xx status, or a body larger
/// than [`MAX_HTML_BYTES`].
pub async fn fetch_html(client: &Client, url: &Url) -> Result<String> {
    fetch_html_capped(client, url, MAX_HTML_BYTES).await
}

/// [`fetch_html`] with a body limit of `max` bytes. Gives up as soon as the
/// declared length or the bytes read so far pass the limit.
///
/// # Errors
///
/// See [`fetch_html`].
pub async fn fetch_html_capped(client: &Client, url: &Url, max: usize) -> Result<String> {
    let mut response = client
        .get(url.as_str())
        .send()
        .await
        .with_context(|| format!("Failed to fetch {url}"))?;

    let status = response.status();
    if !status.is_success() {
        anyhow::bail!("Fetching {url} returned HTTP {status}");
    }

    if let Some(length) = response.content_length() {
        if length > max as u64 {
            anyhow::bail!("Page body too large: {length} bytes");
        }
    }

    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await.context("Failed to read page body")? {
        if body.len() + chunk.len() > max {
            anyhow::bail!("Page body too large: over {max} bytes");
        }
        body.extend_from_slice(&chunk);
    }

    Ok(String::from_utf8_lossy(&body).into_owned())
}

/// Readable content of a page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Article {
    pub title: Option<String>,
    pub paragraphs: Vec<String>,
}

impl Article {
    /// Paragraphs joined by blank lines.
    #[must_use]
    pub fn text(&self) -> String {
        self.paragraphs.join("\n\n")
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.paragraphs.is_empty()
    }
}

/// Pull the title and body paragraphs out of an HTML document.
///
/// Paragraphs inside `<article>` or `<main>` win over the rest of the page.
#[must_use]
pub fn extract_article(html: &str) -> Article {
    let document = Html::parse_document(html);

    let title = first_text(&document, r#"meta[property="og:title"]"#, Some("content"))
        .or_else(|| first_text(&document, "title", None))
        .or_else(|| first_text(&document, "h1", None));

    let mut body = paragraphs(&document, "article p, main p");
    if body.is_empty() {
        body = paragraphs(&document, "p");
    }

    Article {
        title,
        paragraphs: body,
    }
}

fn first_text(document: &Html, selector: &str, attr: Option<&str>) -> Option<String> {
    let selector = Selector::parse(selector).ok()?;
    document
        .select(&selector)
        .filter_map(|el| match attr {
            Some(attr) => el.value().attr(attr).map(str::to_string),
            None => Some(el.text().collect::<String>()),
        })
        .map(|s| collapse_whitespace(&s))
        .find(|s| !s.is_empty())
}

fn paragraphs(document: &Html, selector: &str) -> Vec<String> {
    let Ok(selector) = Selector::parse(selector) else {
        return Vec::new();
    };
    document
        .select(&selector)
        .map(|el| collapse_whitespace(&el.text().collect::<String>()))
        .filter(|s| !s.is_empty())
        .collect()
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
