//! Search index sink: one Meilisearch document per source URL.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::Publisher;
use crate::archiver::{Collect, Destination, Slot};
use crate::config::Config;
use crate::reduxer::Bundles;

const PRIMARY_KEY: &str = "id";

/// Indexed record of one source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Document {
    pub id: String,
    pub source: String,
    pub title: String,
    pub ia: String,
    pub is: String,
    pub ip: String,
    pub ph: String,
    pub text: String,
    pub created_at: i64,
}

impl Document {
    /// Build the document for records of one source. Failed slots stay empty.
    #[must_use]
    pub fn from_collects(cols: &[Collect], bundles: &Bundles) -> Option<Self> {
        let src = &cols.first()?.src;
        let now = Utc::now();
        let digest = hex::encode(Sha256::digest(src.as_bytes()));

        let mut doc = Self {
            id: format!("{}-{}", now.timestamp_millis(), &digest[..12]),
            source: src.clone(),
            created_at: now.timestamp(),
            ..Self::default()
        };

        for col in cols {
            let Destination::Archived(dst) = &col.dst else {
                continue;
            };
            let field = match col.slot {
                Slot::Ia => &mut doc.ia,
                Slot::Is => &mut doc.is,
                Slot::Ip => &mut doc.ip,
                Slot::Ph => &mut doc.ph,
            };
            field.clone_from(dst);
        }

        if let Some(bundle) = bundles.load(src) {
            doc.title = bundle.title.unwrap_or_default();
            doc.text = bundle.text.unwrap_or_default();
        }

        Some(doc)
    }
}

#[derive(Debug)]
pub struct MeiliIndex {
    http: Client,
    endpoint: String,
    index: String,
    api_key: Option<String>,
    ready: OnceCell<()>,
}

impl MeiliIndex {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(endpoint: &str, index: &str, api_key: Option<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create Meilisearch HTTP client")?;

        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            index: index.to_string(),
            api_key,
            ready: OnceCell::new(),
        })
    }

    fn request(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    /// Create the index unless it exists. Runs once per client.
    async fn ensure_index(&self) -> Result<()> {
        self.ready
            .get_or_try_init(|| async {
                let url = format!("{}/indexes/{}", self.endpoint, self.index);
                let response = self
                    .request(self.http.get(&url))
                    .send()
                    .await
                    .context("Failed to look up Meilisearch index")?;

                match response.status() {
                    s if s.is_success() => {
                        debug!(index = %self.index, "Meilisearch index exists");
                        return Ok(());
                    }
                    StatusCode::NOT_FOUND => {}
                    s => anyhow::bail!("Meilisearch index lookup returned HTTP {s}"),
                }

                let response = self
                    .request(self.http.post(format!("{}/indexes", self.endpoint)))
                    .json(&json!({ "uid": self.index, "primaryKey": PRIMARY_KEY }))
                    .send()
                    .await
                    .context("Failed to create Meilisearch index")?;
                if !response.status().is_success() {
                    anyhow::bail!("Meilisearch index creation returned HTTP {}", response.status());
                }

                info!(index = %self.index, "Meilisearch index created");
                Ok(())
            })
            .await
            .map(|_| ())
    }
}

/// Search index publisher when `MEILI_ENDPOINT` is set.
///
/// # Errors
///
/// Returns an error if the client cannot be built.
pub fn setup(config: &Config) -> Result<Option<Arc<dyn Publisher>>> {
    let Some(endpoint) = &config.meili_endpoint else {
        return Ok(None);
    };
    Ok(Some(Arc::new(MeiliIndex::new(
        endpoint,
        &config.meili_index,
        config.meili_api_key.clone(),
    )?)))
}

#[async_trait]
impl Publisher for MeiliIndex {
    async fn publish(&self, _token: &CancellationToken, bundles: &Bundles, cols: &[Collect]) -> Result<()> {
        let doc = Document::from_collects(cols, bundles).context("no records to index")?;
        self.ensure_index().await?;

        let response = self
            .request(
                self.http
                    .post(format!("{}/indexes/{}/documents", self.endpoint, self.index)),
            )
            .json(&[&doc])
            .send()
            .await
            .context("Failed to push Meilisearch document")?;

        let status = response.status();
        if status != StatusCode::ACCEPTED && !status.is_success() {
            anyhow::bail!("Meilisearch document push returned HTTP {status}");
        }

        debug!(id = %doc.id, source = %doc.source, "Document queued for indexing");
        Ok(())
    }
}
