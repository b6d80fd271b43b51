//! Thumbnail re-hosting. Callers fall back to the source URL on any error.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);
const EPISODE_FOLDER: &str = "episodes";

#[async_trait]
pub trait ImageRehost: Send + Sync {
    /// Copies `source_url` to the image host under `identifier` and returns
    /// the hosted HTTPS URL.
    async fn rehost(&self, source_url: &str, identifier: &str) -> Result<String>;
}

/// Used when no image CDN is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughRehost;

#[async_trait]
impl ImageRehost for PassthroughRehost {
    async fn rehost(&self, source_url: &str, _identifier: &str) -> Result<String> {
        Ok(source_url.to_string())
    }
}

/// Unsigned uploads to Cloudinary through an upload preset.
#[derive(Clone)]
pub struct CloudinaryRehost {
    agent: ureq::Agent,
    upload_url: String,
    upload_preset: String,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    secure_url: Option<String>,
}

impl CloudinaryRehost {
    pub fn new(cloud_name: &str, upload_preset: impl Into<String>) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(UPLOAD_TIMEOUT).build(),
            upload_url: format!("https://api.cloudinary.com/v1_1/{cloud_name}/image/upload"),
            upload_preset: upload_preset.into(),
        }
    }

    fn upload(&self, source_url: &str, identifier: &str) -> Result<String> {
        let response = self
            .agent
            .post(&self.upload_url)
            .send_form(&[
                ("file", source_url),
                ("upload_preset", self.upload_preset.as_str()),
                ("folder", EPISODE_FOLDER),
                ("public_id", identifier),
            ])
            .map_err(|err| anyhow!("uploading {identifier} to Cloudinary: {err}"))?;
        let body: UploadResponse = response
            .into_json()
            .context("decoding Cloudinary upload response")?;
        body.secure_url
            .filter(|url| !url.is_empty())
            .ok_or_else(|| anyhow!("Cloudinary response for {identifier} has no secure_url"))
    }
}

#[async_trait]
impl ImageRehost for CloudinaryRehost {
    async fn rehost(&self, source_url: &str, identifier: &str) -> Result<String> {
        let this = self.clone();
        let source = source_url.to_string();
        let id = identifier.to_string();
        debug!(identifier, "re-hosting thumbnail");
        tokio::task::spawn_blocking(move || this.upload(&source, &id))
            .await
            .context("Cloudinary upload task panicked")?
    }
}
