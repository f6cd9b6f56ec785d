//! Client for the remote plugin registry.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{PluginError, Result};

/// A plugin listed by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketplacePlugin {
    /// Registry entries are identified by their repository url
    #[serde(default)]
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author_name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Any other field the registry sends
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Deserialize)]
struct PluginPage {
    plugins: Vec<MarketplacePlugin>,
}

/// Registry HTTP client.
#[derive(Debug, Clone)]
pub struct MarketplaceClient {
    client: reqwest::Client,
    base_url: String,
}

impl MarketplaceClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    /// Search the registry, or list everything when `query` is empty.
    ///
    /// Network or decoding failures are logged and yield an empty list.
    pub async fn search(&self, query: Option<&str>) -> Vec<MarketplacePlugin> {
        match self.fetch(query.filter(|q| !q.is_empty())).await {
            Ok(mut plugins) => {
                for plugin in &mut plugins {
                    plugin.id = plugin.url.clone();
                }
                plugins
            }
            Err(e) => {
                tracing::error!("Error while calling plugins registry: {}", e);
                Vec::new()
            }
        }
    }

    async fn fetch(&self, query: Option<&str>) -> Result<Vec<MarketplacePlugin>> {
        let response = match query {
            Some(query) => {
                self.client
                    .post(self.endpoint("search"))
                    .json(&serde_json::json!({ "query": query }))
                    .send()
                    .await?
            }
            None => {
                self.client
                    .get(self.endpoint("plugins"))
                    .query(&[("page", "1"), ("page_size", "1000")])
                    .send()
                    .await?
            }
        };

        if !response.status().is_success() {
            return Err(PluginError::Marketplace(format!(
                "Registry responded with {}",
                response.status()
            )));
        }

        if query.is_some() {
            Ok(response.json::<Vec<MarketplacePlugin>>().await?)
        } else {
            Ok(response.json::<PluginPage>().await?.plugins)
        }
    }

    /// Download the archive of the plugin at `url` into `dest_dir`.
    pub async fn download(&self, url: &str, dest_dir: &Path) -> Result<PathBuf> {
        tracing::info!("Downloading {}", url);

        let response = self
            .client
            .post(self.endpoint("download"))
            .json(&serde_json::json!({ "url": url }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(PluginError::Marketplace(format!(
                "Could not download {}: {}",
                url,
                response.status()
            )));
        }
        let bytes = response.bytes().await?;

        tokio::fs::create_dir_all(dest_dir).await?;
        let path = dest_dir.join(format!("{}.zip", archive_name(url)));
        tokio::fs::write(&path, &bytes).await?;

        tracing::info!("Saved plugin as {}", path.display());
        Ok(path)
    }
}

/// Last path segment of a plugin url, safe to use as a file name.
fn archive_name(url: &str) -> String {
    let segment = url
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default();
    let cleaned: String = segment
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .collect();
    let cleaned = cleaned.trim_matches('.');
    if cleaned.is_empty() {
        "plugin".to_string()
    } else {
        cleaned.to_string()
    }
}
