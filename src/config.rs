use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::downsample::Strategy;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub categories: Vec<CategoryConfig>,
    pub monitors: Vec<MonitorConfig>,
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
    /// Falls back to `check_interval` when absent.
    #[serde(default)]
    pub cache_ttl_secs: Option<u64>,
    #[serde(default = "default_shadow_ttl")]
    pub shadow_ttl_secs: u64,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_max_records")]
    pub max_records_per_monitor: usize,
    #[serde(default = "default_cleanup_every")]
    pub cleanup_every: u32,
    #[serde(default = "default_edge_grace")]
    pub edge_grace_ms: u64,
    #[serde(default = "default_bucket_count")]
    pub bucket_count: usize,
    #[serde(default)]
    pub default_strategy: Strategy,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub user_agent: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CategoryConfig {
    pub id: String,
    pub label: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MonitorConfig {
    pub id: String,
    pub label: String,
    pub category: String,
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn default_check_interval() -> u64 { 60 }
fn default_api_port() -> u16 { 3000 }
fn default_max_concurrency() -> usize { 64 }
pub fn default_timeout() -> u64 { 10_000 }
fn default_shadow_ttl() -> u64 { 10 }
fn default_retention_days() -> u32 { 7 }
// one record per minute for a week
fn default_max_records() -> usize { 10_080 }
fn default_cleanup_every() -> u32 { 60 }
fn default_edge_grace() -> u64 { 5_000 }
fn default_bucket_count() -> usize { 90 }
fn default_method() -> String { "GET".into() }

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: AppConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.check_interval == 0 {
            bail!("check_interval must be greater than zero");
        }
        if self.cache_ttl_secs == Some(0) {
            bail!("cache_ttl_secs must be greater than zero");
        }
        if self.max_concurrency == 0 {
            bail!("max_concurrency must be greater than zero");
        }
        if self.storage.backend == StorageBackend::Sqlite && self.storage.path.is_none() {
            bail!("storage.path is required for the sqlite backend");
        }

        let mut category_ids = HashSet::new();
        for category in &self.categories {
            if !category_ids.insert(category.id.as_str()) {
                bail!("Duplicate category id '{}'", category.id);
            }
        }

        let mut monitor_ids = HashSet::new();
        for monitor in &self.monitors {
            if !is_valid_id(&monitor.id) {
                bail!("Invalid monitor id '{}'", monitor.id);
            }
            if !monitor_ids.insert(monitor.id.as_str()) {
                bail!("Duplicate monitor id '{}'", monitor.id);
            }
            if !category_ids.contains(monitor.category.as_str()) {
                bail!("Monitor '{}' references unknown category '{}'", monitor.id, monitor.category);
            }
            reqwest::Url::parse(&monitor.url)
                .with_context(|| format!("Monitor '{}' has an invalid url", monitor.id))?;
            reqwest::Method::from_bytes(monitor.method.as_bytes())
                .with_context(|| format!("Monitor '{}' has an invalid method", monitor.id))?;
        }
        Ok(())
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs.unwrap_or(self.check_interval))
    }

    pub fn monitor(&self, id: &str) -> Option<&MonitorConfig> {
        self.monitors.iter().find(|m| m.id == id)
    }
}

impl MonitorConfig {
    pub fn timeout(&self, default_ms: u64) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(default_ms))
    }
}

/// Monitor ids end up in storage keys and URLs.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> &'static str {
        r#"{
            "categories": [{"id": "core", "label": "Core"}],
            "monitors": [
                {"id": "api", "label": "API", "category": "core", "url": "https://example.com/health"}
            ]
        }"#
    }

    #[test]
    fn defaults_are_applied() {
        let config: AppConfig = serde_json::from_str(sample()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.check_interval, 60);
        assert_eq!(config.timeout_ms, 10_000);
        assert_eq!(config.cache_ttl(), Duration::from_secs(60));
        assert_eq!(config.monitors[0].method, "GET");
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.default_strategy, Strategy::Worst);
    }

    #[test]
    fn unknown_category_is_rejected() {
        let mut config: AppConfig = serde_json::from_str(sample()).unwrap();
        config.monitors[0].category = "edge".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("unknown category"));
    }

    #[test]
    fn sqlite_without_path_is_rejected() {
        let mut config: AppConfig = serde_json::from_str(sample()).unwrap();
        config.storage.backend = StorageBackend::Sqlite;
        assert!(config.validate().is_err());
        config.storage.path = Some("upwatch.db".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn duplicate_monitor_is_rejected() {
        let mut config: AppConfig = serde_json::from_str(sample()).unwrap();
        let dup = config.monitors[0].clone();
        config.monitors.push(dup);
        assert!(config.validate().is_err());
    }

    #[test]
    fn id_validation() {
        assert!(is_valid_id("api-eu_1"));
        assert!(!is_valid_id(""));
        assert!(!is_valid_id("has space"));
        assert!(!is_valid_id("history:x"));
        assert!(!is_valid_id(&"a".repeat(65)));
    }
}
