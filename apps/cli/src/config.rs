//! CLI configuration.
//!
//! Configuration is stored as TOML:
//! - Linux: `~/.config/sliceup/config.toml`
//! - Windows: `%APPDATA%/sliceup/config.toml`
//!
//! Every field is optional; command-line flags override the file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use sliceup_engine::{ConcurrencyScope, DedupPolicy, EngineConfig, MergeMode, RetryPolicy};
use sliceup_http::{Endpoints, HttpConfig};

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the upload server.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,

    /// Upload into a local chunk store instead of a server.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_dir: Option<PathBuf>,

    pub engine: EngineSection,
    pub http: HttpSection,
}

/// `[engine]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub chunk_size: u64,
    pub hash_batch_size: usize,
    pub concurrency_limit: usize,
    pub concurrency_scope: ConcurrencyScope,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub merge_mode: MergeMode,
    pub merge_max_retries: u32,
    pub dedup: DedupPolicy,
    pub chunk_timeout_secs: u64,
    pub verify_chunks: bool,
}

impl Default for EngineSection {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            chunk_size: engine.chunk_size,
            hash_batch_size: engine.hash_batch_size,
            concurrency_limit: engine.concurrency_limit,
            concurrency_scope: engine.concurrency_scope,
            max_retries: engine.retry.max_retries,
            retry_base_delay_ms: engine.retry.base_delay.as_millis() as u64,
            retry_max_delay_ms: engine.retry.max_delay.as_millis() as u64,
            merge_mode: engine.merge_mode,
            merge_max_retries: engine.merge_max_retries,
            dedup: engine.dedup,
            chunk_timeout_secs: engine.chunk_timeout.as_secs(),
            verify_chunks: engine.verify_chunks,
        }
    }
}

impl EngineSection {
    pub fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            chunk_size: self.chunk_size,
            hash_batch_size: self.hash_batch_size,
            concurrency_limit: self.concurrency_limit,
            concurrency_scope: self.concurrency_scope,
            retry: RetryPolicy {
                max_retries: self.max_retries,
                base_delay: Duration::from_millis(self.retry_base_delay_ms),
                max_delay: Duration::from_millis(self.retry_max_delay_ms),
            },
            merge_mode: self.merge_mode,
            merge_max_retries: self.merge_max_retries,
            dedup: self.dedup,
            chunk_timeout: Duration::from_secs(self.chunk_timeout_secs),
            verify_chunks: self.verify_chunks,
        }
    }
}

/// `[http]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSection {
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub endpoints: Endpoints,
    /// Extra headers sent with every request, e.g. `Authorization`.
    pub headers: BTreeMap<String, String>,
}

impl Default for HttpSection {
    fn default() -> Self {
        let http = HttpConfig::new("");
        Self {
            request_timeout_secs: http.request_timeout.as_secs(),
            connect_timeout_secs: http.connect_timeout.as_secs(),
            endpoints: http.endpoints,
            headers: BTreeMap::new(),
        }
    }
}

impl HttpSection {
    pub fn to_http_config(&self, base_url: &str) -> HttpConfig {
        HttpConfig {
            base_url: base_url.to_string(),
            endpoints: self.endpoints.clone(),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            headers: self.headers.clone(),
        }
    }
}

impl Config {
    /// Loads `path`, or the default location when `path` is `None`.
    ///
    /// An explicit path must exist; a missing default file yields defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (config_path(), false),
        };

        if !explicit && !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }
}

/// Returns the platform-specific configuration file path.
pub fn config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata).join("sliceup").join("config.toml")
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home)
            .join(".config")
            .join("sliceup")
            .join("config.toml")
    }
}
