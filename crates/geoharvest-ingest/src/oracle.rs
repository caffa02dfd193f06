//! Existence check against the archive's item metadata endpoint

use crate::error::Result;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

const ORACLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Answers whether a collection is already published
#[async_trait]
pub trait ArchiveOracle: Send + Sync {
    /// `false` means "not confirmed": errors never report existence
    async fn exists(&self, collection: &str) -> bool;
}

#[derive(Debug, Deserialize)]
struct ItemMetadata {
    metadata: Option<serde_json::Value>,
    #[serde(default)]
    is_dark: Option<bool>,
}

impl ItemMetadata {
    fn is_published(&self) -> bool {
        self.metadata.is_some() && self.is_dark != Some(true)
    }
}

/// Queries `{base}/metadata/{collection}`
pub struct InternetArchiveOracle {
    client: Client,
    base_url: String,
}

impl InternetArchiveOracle {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(ORACLE_TIMEOUT)
            .user_agent(format!("geoharvest/{}", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn lookup(&self, collection: &str) -> std::result::Result<bool, reqwest::Error> {
        let url = format!("{}/metadata/{}", self.base_url, collection);
        let response = self.client.get(&url).send().await?;
        if response.status() != StatusCode::OK {
            debug!(collection = %collection, status = %response.status(), "Collection not found");
            return Ok(false);
        }
        let item: ItemMetadata = response.json().await?;
        Ok(item.is_published())
    }
}

#[async_trait]
impl ArchiveOracle for InternetArchiveOracle {
    async fn exists(&self, collection: &str) -> bool {
        match self.lookup(collection).await {
            Ok(found) => found,
            Err(e) => {
                warn!(collection = %collection, error = %e, "Existence check failed, assuming absent");
                false
            },
        }
    }
}
