//! Issue sink: one GitHub issue per source URL.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{render, Publisher};
use crate::archiver::Collect;
use crate::config::Config;
use crate::reduxer::Bundles;

/// GitHub caps issue titles at 256 characters.
const MAX_TITLE_CHARS: usize = 256;

#[derive(Debug, Deserialize)]
struct Issue {
    html_url: String,
}

#[derive(Debug)]
pub struct GitHubIssues {
    http: Client,
    api_url: String,
    owner: String,
    repo: String,
    token: String,
}

impl GitHubIssues {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(api_url: &str, owner: &str, repo: &str, token: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("wayback-fanout/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create GitHub HTTP client")?;

        Ok(Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            owner: owner.to_string(),
            repo: repo.to_string(),
            token: token.to_string(),
        })
    }
}

/// Issue publisher when both `GITHUB_TOKEN` and `GITHUB_REPO` are set.
///
/// # Errors
///
/// Returns an error if the client cannot be built.
pub fn setup(config: &Config) -> Result<Option<Arc<dyn Publisher>>> {
    let (Some(token), Some((owner, repo))) = (&config.github_token, config.github_repo_parts()) else {
        return Ok(None);
    };
    Ok(Some(Arc::new(GitHubIssues::new(
        &config.github_api_url,
        owner,
        repo,
        token,
    )?)))
}

#[async_trait]
impl Publisher for GitHubIssues {
    async fn publish(&self, _token: &CancellationToken, bundles: &Bundles, cols: &[Collect]) -> Result<()> {
        let title = render::truncate(&render::title(cols, bundles), MAX_TITLE_CHARS);
        let body = render::markdown(cols, bundles);

        let response = self
            .http
            .post(format!("{}/repos/{}/{}/issues", self.api_url, self.owner, self.repo))
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .json(&json!({ "title": title, "body": body }))
            .send()
            .await
            .context("Failed to create GitHub issue")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("GitHub returned HTTP {status}: {body}");
        }

        let issue: Issue = response
            .json()
            .await
            .context("Failed to parse GitHub issue response")?;
        info!(issue = %issue.html_url, "GitHub issue created");
        Ok(())
    }
}
