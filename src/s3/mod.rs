//! Remote copies of captured artifacts.

use anyhow::{Context, Result};
use s3::creds::Credentials;
use s3::region::Region;
use s3::Bucket;
use tracing::debug;

use crate::config::Config;

/// S3 client for artifact uploads.
#[derive(Clone)]
pub struct S3Client {
    bucket: Box<Bucket>,
    endpoint: Option<String>,
    prefix: String,
}

impl std::fmt::Debug for S3Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Client")
            .field("bucket", &self.bucket.name())
            .field("endpoint", &self.endpoint)
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl S3Client {
    /// Create a client when `S3_BUCKET` is configured.
    ///
    /// # Errors
    ///
    /// Returns an error if credentials are missing or the bucket handle
    /// cannot be created.
    pub fn from_config(config: &Config) -> Result<Option<Self>> {
        let Some(bucket_name) = config.s3_bucket.as_deref() else {
            return Ok(None);
        };

        let access_key = std::env::var("AWS_ACCESS_KEY_ID").context("AWS_ACCESS_KEY_ID not set")?;
        let secret_key =
            std::env::var("AWS_SECRET_ACCESS_KEY").context("AWS_SECRET_ACCESS_KEY not set")?;

        let credentials = Credentials::new(Some(&access_key), Some(&secret_key), None, None, None)
            .context("Failed to create S3 credentials")?;

        let region = match &config.s3_endpoint {
            Some(endpoint) => Region::Custom {
                region: config.s3_region.clone(),
                endpoint: endpoint.clone(),
            },
            None => config.s3_region.parse().unwrap_or(Region::UsEast1),
        };

        let bucket =
            Bucket::new(bucket_name, region, credentials).context("Failed to create S3 bucket")?;

        // MinIO, R2 and friends want path-style addressing
        let bucket = if config.s3_endpoint.is_some() {
            bucket.with_path_style()
        } else {
            bucket
        };

        Ok(Some(Self {
            bucket,
            endpoint: config.s3_endpoint.clone(),
            prefix: config.s3_prefix.clone(),
        }))
    }

    /// Object key for a relative artifact path.
    #[must_use]
    pub fn key_for(&self, relative: &str) -> String {
        format!("{}{}", self.prefix, relative.trim_start_matches('/'))
    }

    /// Upload bytes and return the public URL of the object.
    ///
    /// # Errors
    ///
    /// Returns an error if the upload fails.
    pub async fn upload_bytes(&self, data: &[u8], key: &str, content_type: &str) -> Result<String> {
        debug!(key = %key, content_type = %content_type, size = data.len(), "Uploading artifact to S3");

        self.bucket
            .put_object_with_content_type(key, data, content_type)
            .await
            .context("Failed to upload bytes to S3")?;

        Ok(self.public_url(key))
    }

    #[must_use]
    pub fn public_url(&self, key: &str) -> String {
        match &self.endpoint {
            Some(endpoint) => format!(
                "{}/{}/{key}",
                endpoint.trim_end_matches('/'),
                self.bucket.name()
            ),
            None => format!("https://{}.s3.amazonaws.com/{key}", self.bucket.name()),
        }
    }
}
