//! Internet Archive slot: the Wayback Machine save API.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::archiver::SlotArchiver;
use crate::config::Config;
use crate::constants::HTTP_TIMEOUT_SECS;
use crate::throttle::Throttle;

/// Rate-limited Wayback Machine client.
#[derive(Debug)]
pub struct WaybackClient {
    client: Client,
    endpoint: String,
    availability_endpoint: String,
    throttle: Throttle,
}

impl WaybackClient {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .user_agent(&config.user_agent)
            .build()
            .context("Failed to create Wayback HTTP client")?;

        Ok(Self {
            client,
            endpoint: config.wayback_endpoint.trim_end_matches('/').to_string(),
            availability_endpoint: config
                .wayback_availability_endpoint
                .trim_end_matches('/')
                .to_string(),
            throttle: Throttle::per_minute(config.wayback_rate_limit_per_min),
        })
    }

    /// Ask the Wayback Machine to save `url` and return the snapshot URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the service refuses it.
    pub async fn submit(&self, url: &str) -> Result<String> {
        debug!(url = %url, "Submitting URL to Wayback Machine");

        let save_url = format!("{}/save/{url}", self.endpoint);
        let response = self
            .client
            .get(&save_url)
            .send()
            .await
            .context("Failed to submit to Wayback Machine")?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            warn!(url = %url, "Wayback Machine rate limited");
            anyhow::bail!("Wayback Machine rate limited (HTTP 429)");
        }
        if status.as_u16() == 520 || status.as_u16() == 523 {
            warn!(url = %url, status = %status, "Target site may be blocking Wayback archival");
            anyhow::bail!("Wayback Machine could not reach the page (HTTP {status})");
        }
        if !status.is_success() {
            anyhow::bail!("Wayback Machine returned HTTP {status}");
        }

        if let Some(location) = header(&response, "content-location") {
            let snapshot = if location.starts_with("http") {
                location
            } else {
                format!("https://web.archive.org{location}")
            };
            info!(url = %url, snapshot = %snapshot, "Wayback snapshot created");
            return Ok(snapshot);
        }

        if let Some(memento) = header(&response, "link").and_then(|l| extract_memento_url(&l)) {
            info!(url = %url, snapshot = %memento, "Wayback snapshot created");
            return Ok(memento);
        }

        // Accepted, but the exact capture is not known yet
        let final_url = response.url().as_str();
        if final_url.contains("/web/") {
            return Ok(final_url.to_string());
        }
        Ok(format!("https://web.archive.org/web/*/{url}"))
    }

    /// Most recent snapshot of `url`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the availability API cannot be reached or parsed.
    pub async fn check_existing(&self, url: &str) -> Result<Option<String>> {
        let check_url = format!(
            "{}/wayback/available?url={}",
            self.availability_endpoint,
            urlencoding::encode(url)
        );

        let response = self
            .client
            .get(&check_url)
            .send()
            .await
            .context("Failed to check Wayback availability")?;

        if !response.status().is_success() {
            anyhow::bail!("Wayback availability API returned HTTP {}", response.status());
        }

        let json: serde_json::Value = response
            .json()
            .await
            .context("Failed to parse Wayback response")?;

        Ok(json
            .get("archived_snapshots")
            .and_then(|s| s.get("closest"))
            .and_then(|c| c.get("url"))
            .and_then(|u| u.as_str())
            .map(String::from))
    }
}

#[async_trait]
impl SlotArchiver for WaybackClient {
    async fn wayback(&self, token: &CancellationToken, url: &Url) -> Result<String> {
        self.throttle.acquire(token).await?;
        self.submit(url.as_str()).await
    }

    async fn playback(&self, _token: &CancellationToken, url: &Url) -> Result<Option<String>> {
        self.check_existing(url.as_str()).await
    }
}

fn header(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Memento URL from a `Link` header, e.g. `<url>; rel="memento"; ...`.
fn extract_memento_url(link_header: &str) -> Option<String> {
    link_header
        .split(',')
        .filter(|part| part.contains("rel=\"memento\"") || part.contains("rel=memento"))
        .find_map(|part| {
            let start = part.find('<')?;
            let end = part.find('>')?;
            (start < end).then(|| part[start + 1..end].to_string())
        })
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path, path_regex, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn client(server: &MockServer) -> WaybackClient {
        let config = Config {
            wayback_endpoint: server.uri(),
            wayback_availability_endpoint: server.uri(),
            ..Config::for_testing()
        };
        WaybackClient::new(&config).unwrap()
    }

    #[test]
    fn test_extract_memento_url() {
        let header = r#"<https://example.com>; rel="original", <https://web.archive.org/web/20240101000000/https://example.com>; rel="memento"; datetime="Mon, 01 Jan 2024 00:00:00 GMT""#;
        assert_eq!(
            extract_memento_url(header).as_deref(),
            Some("https://web.archive.org/web/20240101000000/https://example.com")
        );
        assert_eq!(extract_memento_url(r#"<https://example.com>; rel="original""#), None);
    }

    #[tokio::test]
    async fn test_submit_uses_content_location() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex("^/save/"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-location", "/web/20240101000000/https://example.com/"),
            )
            .mount(&server)
            .await;

        let snapshot = client(&server).submit("https://example.com/").await.unwrap();
        assert_eq!(
            snapshot,
            "https://web.archive.org/web/20240101000000/https://example.com/"
        );
    }

    #[tokio::test]
    async fn test_submit_rate_limited_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex("^/save/"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let err = client(&server).submit("https://example.com/").await.unwrap_err();
        assert!(err.to_string().contains("429"));
    }

    #[tokio::test]
    async fn test_playback_reads_closest_snapshot() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/wayback/available"))
            .and(query_param("url", "https://example.com/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "archived_snapshots": {
                    "closest": {
                        "available": true,
                        "url": "http://web.archive.org/web/2024/https://example.com/"
                    }
                }
            })))
            .mount(&server)
            .await;

        let url = Url::parse("https://example.com/").unwrap();
        let found = client(&server)
            .playback(&CancellationToken::new(), &url)
            .await
            .unwrap();
        assert_eq!(
            found.as_deref(),
            Some("http://web.archive.org/web/2024/https://example.com/")
        );
    }
}
