//! archive.today slot.

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

/// Mirror domains archive.today answers on.
const MIRRORS: [&str; 6] = [
    "archive.today",
    "archive.ph",
    "archive.is",
    "archive.li",
    "archive.vn",
    "archive.md",
];

/// Rate-limited archive.today client.
#[derive(Debug)]
pub struct ArchiveTodayClient {
    client: Client,
    endpoint: String,
    throttle: Throttle,
}

impl ArchiveTodayClient {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .context("Failed to create archive.today HTTP client")?;

        Ok(Self {
            client,
            endpoint: config.archive_today_endpoint.trim_end_matches('/').to_string(),
            throttle: Throttle::per_minute(config.archive_today_rate_limit_per_min),
        })
    }

    /// Submit `url` and return the archive URL. An existing capture is
    /// returned as is.
    ///
    /// # Errors
    ///
    /// Returns an error if the submission fails or is refused.
    pub async fn submit(&self, url: &str) -> Result<String> {
        if let Some(existing) = self.check_existing(url).await? {
            info!(url = %url, archive = %existing, "URL already archived on archive.today");
            return Ok(existing);
        }

        debug!(url = %url, "Submitting URL to archive.today");

        let response = self
            .client
            .post(format!("{}/submit/", self.endpoint))
            .form(&[("url", url)])
            .send()
            .await
            .context("Failed to submit to archive.today")?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            warn!(url = %url, "archive.today rate limited");
            anyhow::bail!("archive.today rate limited (HTTP 429)");
        }
        if !status.is_success() {
            anyhow::bail!("archive.today returned HTTP {status}");
        }

        let final_url = response.url().to_string();
        if let Some(refresh) = response
            .headers()
            .get("refresh")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split_once("url=").map(|(_, u)| u.trim().to_string()))
        {
            if is_archive_url(&refresh) {
                info!(url = %url, archive = %refresh, "archive.today snapshot created");
                return Ok(refresh);
            }
        }
        if is_archive_url(&final_url) {
            info!(url = %url, archive = %final_url, "archive.today snapshot created");
            return Ok(final_url);
        }

        let body = response.text().await.unwrap_or_default();
        if let Some(archive_url) = extract_archive_url(&body) {
            info!(url = %url, archive = %archive_url, "archive.today snapshot created");
            return Ok(archive_url);
        }

        anyhow::bail!("archive.today accepted the URL but returned no archive link")
    }

    /// Most recent archive of `url`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup request fails.
    pub async fn check_existing(&self, url: &str) -> Result<Option<String>> {
        let check_url = format!("{}/newest/{url}", self.endpoint);

        let response = self
            .client
            .get(&check_url)
            .send()
            .await
            .context("Failed to check archive.today")?;

        if !response.status().is_success() {
            return Ok(None);
        }

        let final_url = response.url().to_string();
        if is_archive_url(&final_url) {
            return Ok(Some(final_url));
        }

        let body = response.text().await.unwrap_or_default();
        Ok(extract_archive_url(&body))
    }
}

#[async_trait]
impl SlotArchiver for ArchiveTodayClient {
    async fn wayback(&self, token: &CancellationToken, url: &Url) -> Result<String> {
        self.throttle.acquire(token).await?;
        self.submit(url.as_str()).await
    }

    async fn playback(&self, _token: &CancellationToken, url: &Url) -> Result<Option<String>> {
        self.check_existing(url.as_str()).await
    }
}

/// An archive page URL such as `https://archive.ph/AbCd1`.
fn is_archive_url(url: &str) -> bool {
    const EXCLUDED_PATHS: [&str; 6] = ["submit", "search", "about", "faq", "timegate", "newest"];

    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };
    if !MIRRORS.contains(&host) {
        return false;
    }

    let first = parsed
        .path_segments()
        .and_then(|mut segments| segments.next())
        .unwrap_or("");
    !EXCLUDED_PATHS.iter().any(|p| first.eq_ignore_ascii_case(p))
        && (5..=10).contains(&first.len())
        && first.chars().all(char::is_alphanumeric)
}

/// Archive URL from the canonical link, `og:url`, or the first archive link
/// in the page.
fn extract_archive_url(body: &str) -> Option<String> {
    for marker in ["rel=\"canonical\" href=\"", "property=\"og:url\" content=\""] {
        if let Some(start) = body.find(marker) {
            let rest = &body[start + marker.len()..];
            if let Some(end) = rest.find('"') {
                let candidate = &rest[..end];
                if is_archive_url(candidate) {
                    return Some(candidate.to_string());
                }
            }
        }
    }

    for mirror in MIRRORS {
        let prefix = format!("https://{mirror}/");
        for (start, _) in body.match_indices(&prefix) {
            let rest = &body[start..];
            let end = rest
                .find(|c: char| c == '"' || c == '\'' || c == '<' || c == '>' || c.is_whitespace())
                .unwrap_or(rest.len());
            let candidate = &rest[..end];
            if is_archive_url(candidate) {
                return Some(candidate.to_string());
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn client(server: &MockServer) -> ArchiveTodayClient {
        let config = Config {
            archive_today_endpoint: server.uri(),
            ..Config::for_testing()
        };
        ArchiveTodayClient::new(&config).unwrap()
    }

    #[test]
    fn test_is_archive_url() {
        assert!(is_archive_url("https://archive.today/AbCd1"));
        assert!(is_archive_url("https://archive.ph/Xy9Zw"));
        assert!(!is_archive_url("https://archive.today/submit/"));
        assert!(!is_archive_url("https://example.com/archive.today/AbCd1"));
        assert!(!is_archive_url("https://archive.today/"));
    }

    #[test]
    fn test_extract_archive_url() {
        let html = r#"<link rel="canonical" href="https://archive.today/AbCd1">"#;
        assert_eq!(
            extract_archive_url(html).as_deref(),
            Some("https://archive.today/AbCd1")
        );

        let html = r#"<a href="https://archive.ph/submit/">x</a> <a href="https://archive.ph/Qw3rT">y</a>"#;
        assert_eq!(extract_archive_url(html).as_deref(), Some("https://archive.ph/Qw3rT"));

        assert_eq!(
            extract_archive_url(r#"<link rel="canonical" href="https://example.com">"#),
            None
        );
    }

    #[tokio::test]
    async fn test_submit_returns_existing_capture() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex("^/newest/"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"<link rel="canonical" href="https://archive.ph/Old12">"#),
            )
            .mount(&server)
            .await;

        let archived = client(&server).submit("https://example.com/").await.unwrap();
        assert_eq!(archived, "https://archive.ph/Old12");
    }

    #[tokio::test]
    async fn test_submit_reads_archive_link_from_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex("^/newest/"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/submit/"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"<input value="https://archive.ph/New34">"#),
            )
            .mount(&server)
            .await;

        let archived = client(&server).submit("https://example.com/").await.unwrap();
        assert_eq!(archived, "https://archive.ph/New34");
    }

    #[tokio::test]
    async fn test_submit_without_link_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex("^/newest/"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/submit/"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
            .mount(&server)
            .await;

        assert!(client(&server).submit("https://example.com/").await.is_err());
    }
}
