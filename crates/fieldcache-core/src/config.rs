//! Application configuration management.
//!
//! This module handles loading and saving the application configuration:
//! remote data source credentials, per-namespace cache windows, the
//! prefetch target list and the network cache worker settings.
//!
//! Configuration is stored at `~/.config/fieldcache/config.json` and can be
//! overridden from the environment (see [`Config::apply_env`]).

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "fieldcache";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Placeholder shipped in sample configs; treated the same as no key.
const API_KEY_PLACEHOLDER: &str = "YOUR_API_KEY_HERE";

/// TTL and capacity policy shared by every key in one cache namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceConfig {
    pub fresh_window_ms: u64,
    pub stale_window_ms: u64,
    pub max_entries: usize,
}

impl NamespaceConfig {
    pub const fn new(fresh_window_ms: u64, stale_window_ms: u64, max_entries: usize) -> Self {
        Self {
            fresh_window_ms,
            stale_window_ms,
            max_entries,
        }
    }

    /// Tabular data changes more often: 3 minutes fresh, 10 minutes usable.
    pub const fn tabular() -> Self {
        Self::new(180_000, 600_000, 50)
    }

    /// File listings change less often: 5 minutes fresh, 15 minutes usable.
    pub const fn hierarchical() -> Self {
        Self::new(300_000, 900_000, 100)
    }

    pub fn fresh_window(&self) -> Duration {
        Duration::milliseconds(self.fresh_window_ms as i64)
    }

    pub fn stale_window(&self) -> Duration {
        Duration::milliseconds(self.stale_window_ms as i64)
    }
}

/// Entry ceilings for the size-bounded worker buckets. The shell bucket is
/// only written at install time and is never trimmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketLimits {
    pub runtime: usize,
    pub api: usize,
    pub image: usize,
}

impl Default for BucketLimits {
    fn default() -> Self {
        Self {
            runtime: 50,
            api: 100,
            image: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Origin the application shell is served from.
    pub origin: String,
    /// Version tag appended to every bucket name.
    pub version: String,
    pub bucket_prefix: String,
    /// Host suffixes whose requests are API calls (network-first, api bucket).
    pub api_hosts: Vec<String>,
    /// Additional cross-origin host suffixes that are still intercepted.
    pub static_hosts: Vec<String>,
    /// Path of the shell document served as a last resort offline.
    pub shell_document: String,
    /// Paths pre-populated into the shell bucket at install.
    pub shell_manifest: Vec<String>,
    pub limits: BucketLimits,
    /// Activate right after install instead of waiting for `ACTIVATE_NOW`.
    pub skip_waiting: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            origin: "http://localhost:3000".to_string(),
            version: "v2".to_string(),
            bucket_prefix: APP_NAME.to_string(),
            api_hosts: vec!["googleapis.com".to_string(), "google.com".to_string()],
            static_hosts: vec!["gstatic.com".to_string()],
            shell_document: "/index.html".to_string(),
            shell_manifest: [
                "/",
                "/index.html",
                "/manifest.json",
                "/favicon.ico",
                "/favicon.png",
                "/icons/icon-192x192.png",
                "/icons/icon-512x512.png",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            limits: BucketLimits::default(),
            skip_waiting: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sheets_api_key: Option<String>,
    pub drive_api_key: Option<String>,
    pub spreadsheet_id: Option<String>,
    pub prefetch_sheets: Vec<String>,
    pub prefetch_folders: Vec<String>,
    pub tabular: NamespaceConfig,
    pub files: NamespaceConfig,
    pub persistent_quota_bytes: Option<u64>,
    pub worker: WorkerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sheets_api_key: None,
            drive_api_key: None,
            spreadsheet_id: None,
            prefetch_sheets: vec![
                "supply".to_string(),
                "contact".to_string(),
                "event".to_string(),
            ],
            prefetch_folders: Vec::new(),
            tabular: NamespaceConfig::tabular(),
            files: NamespaceConfig::hierarchical(),
            persistent_quota_bytes: None,
            worker: WorkerConfig::default(),
        }
    }
}

fn configured_key(key: &Option<String>) -> Option<&str> {
    key.as_deref()
        .map(str::trim)
        .filter(|k| !k.is_empty() && *k != API_KEY_PLACEHOLDER)
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            Ok(serde_json::from_str(&contents).context("Failed to parse config file")?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    /// Override fields from `FIELDCACHE_*` environment variables.
    pub fn apply_env(&mut self) {
        self.apply_vars(|name| std::env::var(name).ok());
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(key) = var("FIELDCACHE_SHEETS_API_KEY") {
            self.sheets_api_key = Some(key);
        }
        if let Some(key) = var("FIELDCACHE_DRIVE_API_KEY") {
            self.drive_api_key = Some(key);
        }
        if let Some(id) = var("FIELDCACHE_SPREADSHEET_ID") {
            self.spreadsheet_id = Some(id);
        }
        if let Some(origin) = var("FIELDCACHE_ORIGIN") {
            self.worker.origin = origin;
        }
    }

    /// Sheets falls back to the Drive key, both live in the same project.
    pub fn sheets_key(&self) -> Option<&str> {
        configured_key(&self.sheets_api_key).or_else(|| configured_key(&self.drive_api_key))
    }

    pub fn drive_key(&self) -> Option<&str> {
        configured_key(&self.drive_api_key)
    }
}
