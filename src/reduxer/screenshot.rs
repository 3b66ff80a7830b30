//! Rendered captures (PNG screenshot and PDF) through headless Chromium.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::page::PrintToPdfParams;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use futures_util::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

pub const DEFAULT_VIEWPORT_WIDTH: u32 = 1280;

pub const DEFAULT_VIEWPORT_HEIGHT: u32 = 800;

pub const DEFAULT_PAGE_TIMEOUT_SECS: u64 = 30;

/// Time given to scripts to settle after navigation.
const RENDER_SETTLE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct ScreenshotConfig {
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub page_timeout: Duration,
    /// Path to the Chrome/Chromium executable, auto-detected when unset.
    pub chrome_path: Option<String>,
    pub enabled: bool,
}

impl Default for ScreenshotConfig {
    fn default() -> Self {
        Self {
            viewport_width: DEFAULT_VIEWPORT_WIDTH,
            viewport_height: DEFAULT_VIEWPORT_HEIGHT,
            page_timeout: Duration::from_secs(DEFAULT_PAGE_TIMEOUT_SECS),
            chrome_path: None,
            enabled: false,
        }
    }
}

/// Headless browser shared by every capture. Launched on first use.
pub struct ScreenshotService {
    config: ScreenshotConfig,
    browser: Arc<Mutex<Option<Browser>>>,
}

impl std::fmt::Debug for ScreenshotService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScreenshotService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ScreenshotService {
    #[must_use]
    pub fn new(config: ScreenshotConfig) -> Self {
        Self {
            config,
            browser: Arc::new(Mutex::new(None)),
        }
    }

    async fn ensure_browser(&self) -> Result<()> {
        let mut browser_guard = self.browser.lock().await;
        if browser_guard.is_some() {
            return Ok(());
        }

        info!("Launching headless browser");

        let mut config_builder = BrowserConfig::builder()
            .window_size(self.config.viewport_width, self.config.viewport_height)
            .request_timeout(self.config.page_timeout)
            .no_sandbox()
            .disable_default_args()
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--no-first-run")
            .arg("--disable-extensions")
            .arg("--mute-audio")
            .arg("--hide-scrollbars");

        if let Some(ref chrome_path) = self.config.chrome_path {
            config_builder = config_builder.chrome_executable(chrome_path);
        }

        let browser_config = config_builder
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build browser config: {e}"))?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .context("Failed to launch browser")?;

        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("Browser handler error: {e}");
                }
            }
        });

        *browser_guard = Some(browser);
        Ok(())
    }

    /// Open `url` in a new tab and wait for it to render.
    async fn open(&self, url: &str) -> Result<Page> {
        if !self.config.enabled {
            anyhow::bail!("Rendered capture is disabled");
        }

        self.ensure_browser().await?;

        let page = {
            let browser_guard = self.browser.lock().await;
            let browser = browser_guard.as_ref().context("Browser not initialized")?;
            browser
                .new_page(url)
                .await
                .context("Failed to create new page")?
        };

        page.wait_for_navigation()
            .await
            .context("Navigation timeout")?;
        tokio::time::sleep(RENDER_SETTLE).await;

        Ok(page)
    }

    /// Full-page PNG screenshot of `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if capture is disabled or the browser fails.
    pub async fn capture(&self, url: &str) -> Result<Vec<u8>> {
        let page = self.open(url).await?;

        let params = ScreenshotParams::builder().full_page(true).build();
        let png = page.screenshot(params).await;
        close(page).await;

        let png = png.context("Failed to capture screenshot")?;
        debug!(url = %url, size = png.len(), "Screenshot captured");
        Ok(png)
    }

    /// Print `url` to PDF.
    ///
    /// # Errors
    ///
    /// Returns an error if capture is disabled or the browser fails.
    pub async fn pdf(&self, url: &str) -> Result<Vec<u8>> {
        let page = self.open(url).await?;

        let pdf = page.pdf(PrintToPdfParams::default()).await;
        close(page).await;

        let pdf = pdf.context("Failed to print page to PDF")?;
        debug!(url = %url, size = pdf.len(), "PDF captured");
        Ok(pdf)
    }

    pub async fn shutdown(&self) {
        let mut browser_guard = self.browser.lock().await;
        if let Some(mut browser) = browser_guard.take() {
            if let Err(e) = browser.close().await {
                error!("Failed to close browser: {e}");
            } else {
                info!("Browser shut down");
            }
        }
    }
}

async fn close(page: Page) {
    if let Err(e) = page.close().await {
        warn!("Failed to close page: {e}");
    }
}
