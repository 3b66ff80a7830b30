//! Best-effort artifact capture for archived sources.
//!
//! After a fan-out, every source that was archived at least once gets a
//! [`Bundle`]: raw HTML, extracted text, a screenshot and a PDF. Each asset
//! is attempted on its own and written to a content-addressed path
//! `STORAGE_DIR/YYYYMM/<sha256>.<ext>`, optionally copied to S3. A failed
//! asset is recorded on the bundle and never fails the archive call.

pub mod capture;
pub mod screenshot;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

pub use capture::{extract_article, Article, BrowserCapturer, Capturer};
pub use screenshot::{ScreenshotConfig, ScreenshotService};

use crate::config::Config;
use crate::s3::S3Client;

/// One stored file, or the reason it is missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Asset {
    pub local: Option<PathBuf>,
    pub remote: Option<String>,
    /// SHA-256 of the content, hex encoded.
    pub digest: Option<String>,
    pub error: Option<String>,
}

impl Asset {
    fn failed(reason: impl Into<String>) -> Self {
        Self {
            error: Some(reason.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_captured(&self) -> bool {
        self.local.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Artifact {
    /// Full-page PNG screenshot
    pub img: Asset,
    pub pdf: Asset,
    /// Raw HTML
    pub raw: Asset,
    /// Extracted readable text
    pub txt: Asset,
}

/// Everything captured for one source URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Bundle {
    pub src: String,
    pub title: Option<String>,
    pub text: Option<String>,
    pub artifact: Artifact,
}

/// Bundles keyed by source URL. Cheap to clone; clones share storage.
#[derive(Debug, Clone, Default)]
pub struct Bundles {
    inner: Arc<RwLock<HashMap<String, Bundle>>>,
}

impl Bundles {
    /// Insert or replace the bundle for `bundle.src`.
    pub fn store(&self, bundle: Bundle) {
        let mut map = self.inner.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        map.insert(bundle.src.clone(), bundle);
    }

    #[must_use]
    pub fn load(&self, src: &str) -> Option<Bundle> {
        let map = self.inner.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        map.get(src).cloned()
    }

    /// Remove and return every bundle.
    pub fn flush(&self) -> Vec<Bundle> {
        let mut map = self.inner.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        map.drain().map(|(_, bundle)| bundle).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Captures bundles for archived sources.
#[derive(Clone)]
pub struct Reduxer {
    storage_dir: PathBuf,
    timeout: Duration,
    capturer: Arc<dyn Capturer>,
    remote: Option<S3Client>,
}

impl fmt::Debug for Reduxer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reduxer")
            .field("storage_dir", &self.storage_dir)
            .field("timeout", &self.timeout)
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

impl Reduxer {
    /// `timeout` bounds a whole [`Reduxer::capture`] call.
    #[must_use]
    pub fn new(storage_dir: impl Into<PathBuf>, timeout: Duration, capturer: Arc<dyn Capturer>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            timeout,
            capturer,
            remote: None,
        }
    }

    /// Also upload every stored asset.
    #[must_use]
    pub fn with_remote(mut self, remote: S3Client) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Build the capture stage, or `None` when `STORAGE_DIR` is not set.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client or the S3 client cannot be built.
    pub fn from_config(config: &Config) -> Result<Option<Self>> {
        let Some(dir) = &config.storage_dir else {
            return Ok(None);
        };

        let capturer = BrowserCapturer::new(&config.user_agent, config.screenshot_config())?;
        let mut reduxer = Self::new(dir, config.reduxer_timeout, Arc::new(capturer));
        if let Some(remote) = S3Client::from_config(config)? {
            reduxer = reduxer.with_remote(remote);
        }

        info!(dir = %dir.display(), remote = reduxer.remote.is_some(), "Artifact capture enabled");
        Ok(Some(reduxer))
    }

    #[must_use]
    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    /// Capture one bundle per URL, concurrently.
    ///
    /// Returns whatever finished when `token` is cancelled or the capture
    /// timeout passes.
    pub async fn capture(&self, token: &CancellationToken, urls: &[Url]) -> Bundles {
        self.capture_within(token, urls, self.timeout).await
    }

    /// Like [`Reduxer::capture`], but never runs longer than `limit`.
    pub async fn capture_within(&self, token: &CancellationToken, urls: &[Url], limit: Duration) -> Bundles {
        let bundles = Bundles::default();
        let timeout = self.timeout.min(limit);
        if timeout.is_zero() {
            warn!(urls = urls.len(), "No time left for artifact capture");
            return bundles;
        }
        let mut tasks = JoinSet::new();

        for url in urls {
            let this = self.clone();
            let url = url.clone();
            tasks.spawn(async move { this.bundle(&url).await });
        }

        let join = async {
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(bundle) => bundles.store(bundle),
                    Err(e) => error!("Capture task failed: {e}"),
                }
            }
        };

        tokio::select! {
            biased;
            () = token.cancelled() => {
                warn!(captured = bundles.len(), "Artifact capture cancelled");
            }
            () = tokio::time::sleep(timeout) => {
                warn!(
                    captured = bundles.len(),
                    timeout_ms = timeout.as_millis(),
                    "Artifact capture timed out"
                );
            }
            () = join => {
                debug!(captured = bundles.len(), "Artifact capture finished");
            }
        }
        tasks.abort_all();

        bundles
    }

    /// Stop the capturer, closing its browser if one was launched.
    pub async fn shutdown(&self) {
        self.capturer.shutdown().await;
    }

    async fn bundle(&self, url: &Url) -> Bundle {
        debug!(url = %url, "Capturing artifacts");

        let page = async {
            let html = match self.capturer.html(url).await {
                Ok(html) => html,
                Err(e) => {
                    let reason = format!("{e:#}");
                    warn!(url = %url, "Failed to fetch page: {reason}");
                    return (None, Asset::failed(reason.clone()), Asset::failed(reason));
                }
            };

            let article = extract_article(&html);
            let raw = self.persist(url, Ok(html.into_bytes()), "html").await;
            let txt = if article.is_empty() {
                Asset::failed("no readable text")
            } else {
                self.persist(url, Ok(article.text().into_bytes()), "txt").await
            };
            (Some(article), raw, txt)
        };
        let img = async { self.persist(url, self.capturer.screenshot(url).await, "png").await };
        let pdf = async { self.persist(url, self.capturer.pdf(url).await, "pdf").await };

        let ((article, raw, txt), img, pdf) = tokio::join!(page, img, pdf);

        let (title, text) = match article {
            Some(article) => {
                let text = (!article.is_empty()).then(|| article.text());
                (article.title, text)
            }
            None => (None, None),
        };

        Bundle {
            src: url.to_string(),
            title,
            text,
            artifact: Artifact { img, pdf, raw, txt },
        }
    }

    async fn persist(&self, url: &Url, data: Result<Vec<u8>>, ext: &str) -> Asset {
        let data = match data {
            Ok(data) if data.is_empty() => return Asset::failed("empty content"),
            Ok(data) => data,
            Err(e) => {
                debug!(url = %url, ext, "Asset not captured: {e:#}");
                return Asset::failed(format!("{e:#}"));
            }
        };

        let digest = hex::encode(Sha256::digest(&data));
        let relative = format!("{}/{digest}.{ext}", Utc::now().format("%Y%m"));
        let path = self.storage_dir.join(&relative);

        if let Err(e) = write_once(&path, &data).await {
            error!(url = %url, path = %path.display(), "Failed to store asset: {e:#}");
            return Asset::failed(format!("{e:#}"));
        }

        let mut asset = Asset {
            local: Some(path),
            digest: Some(digest),
            ..Asset::default()
        };

        if let Some(remote) = &self.remote {
            let key = remote.key_for(&relative);
            let content_type = mime_guess::from_ext(ext).first_or_octet_stream();
            match remote.upload_bytes(&data, &key, content_type.as_ref()).await {
                Ok(public) => asset.remote = Some(public),
                Err(e) => warn!(url = %url, key = %key, "Failed to upload asset: {e:#}"),
            }
        }

        asset
    }
}

/// Write `data` to `path` unless an identical (same digest) file is there.
async fn write_once(path: &Path, data: &[u8]) -> Result<()> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    tokio::fs::write(path, data)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;

    #[derive(Default)]
    struct FakeCapturer {
        shut_down: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl Capturer for FakeCapturer {
        async fn html(&self, url: &Url) -> Result<String> {
            if url.host_str() == Some("slow.example") {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            if url.host_str() == Some("down.example") {
                anyhow::bail!("HTTP 503");
            }
            Ok(format!(
                "<html><head><title>Page</title></head><body><p>Hello from {url}</p></body></html>"
            ))
        }

        async fn screenshot(&self, _url: &Url) -> Result<Vec<u8>> {
            anyhow::bail!("Rendered capture is disabled")
        }

        async fn pdf(&self, _url: &Url) -> Result<Vec<u8>> {
            Ok(b"%PDF-1.4 fake".to_vec())
        }

        async fn shutdown(&self) {
            self.shut_down.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    fn reduxer(dir: &Path, timeout: Duration) -> Reduxer {
        Reduxer::new(dir, timeout, Arc::new(FakeCapturer::default()))
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_capture_records_each_asset_independently() {
        let dir = tempfile::tempdir().unwrap();
        let reduxer = reduxer(dir.path(), Duration::from_secs(5));

        let bundles = reduxer
            .capture(&CancellationToken::new(), &[url("https://a.example/")])
            .await;

        let bundle = bundles.load("https://a.example/").unwrap();
        assert_eq!(bundle.title.as_deref(), Some("Page"));
        assert_eq!(bundle.text.as_deref(), Some("Hello from https://a.example/"));
        assert!(bundle.artifact.raw.is_captured());
        assert!(bundle.artifact.txt.is_captured());
        assert!(bundle.artifact.pdf.is_captured());
        assert!(!bundle.artifact.img.is_captured());
        assert!(bundle.artifact.img.error.as_deref().unwrap().contains("disabled"));

        let raw = bundle.artifact.raw.local.unwrap();
        let month = Utc::now().format("%Y%m").to_string();
        assert!(raw.starts_with(dir.path().join(month)));
        assert_eq!(raw.extension().unwrap(), "html");
        let digest = bundle.artifact.raw.digest.unwrap();
        assert_eq!(raw.file_stem().unwrap().to_str().unwrap(), digest);
        assert!(raw.exists());
    }

    #[tokio::test]
    async fn test_identical_content_shares_a_path() {
        let dir = tempfile::tempdir().unwrap();
        let reduxer = reduxer(dir.path(), Duration::from_secs(5));

        let bundles = reduxer
            .capture(
                &CancellationToken::new(),
                &[url("https://a.example/"), url("https://b.example/")],
            )
            .await;

        let a = bundles.load("https://a.example/").unwrap();
        let b = bundles.load("https://b.example/").unwrap();
        assert_ne!(a.artifact.raw.local, b.artifact.raw.local);
        assert_eq!(a.artifact.pdf.local, b.artifact.pdf.local);
    }

    #[tokio::test]
    async fn test_fetch_failure_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let reduxer = reduxer(dir.path(), Duration::from_secs(5));

        let bundles = reduxer
            .capture(&CancellationToken::new(), &[url("https://down.example/")])
            .await;

        let bundle = bundles.load("https://down.example/").unwrap();
        assert!(bundle.title.is_none());
        assert!(bundle.artifact.raw.error.as_deref().unwrap().contains("503"));
        assert!(!bundle.artifact.txt.is_captured());
        assert!(bundle.artifact.pdf.is_captured());
    }

    #[tokio::test]
    async fn test_timeout_returns_completed_bundles() {
        let dir = tempfile::tempdir().unwrap();
        let reduxer = reduxer(dir.path(), Duration::from_millis(300));

        let bundles = reduxer
            .capture(
                &CancellationToken::new(),
                &[url("https://a.example/"), url("https://slow.example/")],
            )
            .await;

        assert_eq!(bundles.len(), 1);
        assert!(bundles.load("https://a.example/").is_some());
        assert!(bundles.load("https://slow.example/").is_none());
    }

    #[tokio::test]
    async fn test_limit_shortens_capture_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let reduxer = reduxer(dir.path(), Duration::from_secs(30));

        let started = tokio::time::Instant::now();
        let bundles = reduxer
            .capture_within(
                &CancellationToken::new(),
                &[url("https://a.example/"), url("https://slow.example/")],
                Duration::from_millis(300),
            )
            .await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(bundles.load("https://a.example/").is_some());
        assert!(bundles.load("https://slow.example/").is_none());

        let skipped = reduxer
            .capture_within(&CancellationToken::new(), &[url("https://a.example/")], Duration::ZERO)
            .await;
        assert!(skipped.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_reaches_capturer() {
        let dir = tempfile::tempdir().unwrap();
        let capturer = Arc::new(FakeCapturer::default());
        let reduxer = Reduxer::new(dir.path(), Duration::from_secs(5), capturer.clone());

        reduxer.shutdown().await;
        assert!(capturer.shut_down.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancelled_capture_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let reduxer = reduxer(dir.path(), Duration::from_secs(5));
        let token = CancellationToken::new();
        token.cancel();

        let bundles = reduxer.capture(&token, &[url("https://slow.example/")]).await;
        assert!(bundles.is_empty());
    }

    #[test]
    fn test_bundles_store_load_flush() {
        let bundles = Bundles::default();
        let shared = bundles.clone();
        shared.store(Bundle {
            src: "https://a.example/".to_string(),
            title: None,
            text: None,
            artifact: Artifact::default(),
        });

        assert_eq!(bundles.len(), 1);
        assert!(bundles.load("https://a.example/").is_some());
        assert!(bundles.load("https://b.example/").is_none());

        let flushed = bundles.flush();
        assert_eq!(flushed.len(), 1);
        assert!(shared.is_empty());
    }
}
