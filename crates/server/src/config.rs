//! Server configuration.
//!
//! A TOML file supplies defaults; command-line flags override it.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use cellprobe_engine::bridge::BridgeConfig;

/// Engine lifetime bound enforced by the janitor.
pub const DEFAULT_ENGINE_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Shared auth token. Generated fresh (and logged) when absent.
    pub token: Option<String>,
    /// Root for the document store and memo cache. Defaults to
    /// `<system temp>/cellprobe`.
    pub cache_dir: Option<PathBuf>,
    pub bridge: BridgeConfig,
    pub engine_timeout_secs: u64,
    /// Worker pool size. Defaults to available CPU parallelism.
    pub workers: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8000,
            token: None,
            cache_dir: None,
            bridge: BridgeConfig { command: "cellprobe-bridge".to_string(), args: Vec::new() },
            engine_timeout_secs: DEFAULT_ENGINE_TIMEOUT_SECS,
            workers: None,
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self, String> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
        toml::from_str(&contents).map_err(|e| format!("cannot parse {}: {e}", path.display()))
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("cellprobe"))
    }

    pub fn workers(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
        })
    }
}
