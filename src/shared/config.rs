use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub ports: PortConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Seconds between background reconciliation passes; 0 disables the loop.
    #[serde(default)]
    pub reconcile_interval_seconds: u64,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_host")]
    pub host: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortConfig {
    #[serde(default = "default_start_port")]
    pub start_port: u16,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u16,
    #[serde(default = "default_true")]
    pub probe_bind: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_public_host")]
    pub public_host: String,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default = "default_stop_grace_seconds")]
    pub stop_grace_seconds: u32,
    #[serde(default = "default_true")]
    pub enable_gpus: bool,
}

impl Default for LabConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            ports: PortConfig::default(),
            storage: StorageConfig::default(),
            runtime: RuntimeConfig::default(),
            reconcile_interval_seconds: 0,
            log_dir: default_log_dir(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
        }
    }
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            start_port: default_start_port(),
            max_attempts: default_max_attempts(),
            probe_bind: true,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_root: default_data_root(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            public_host: default_public_host(),
            network: None,
            stop_grace_seconds: default_stop_grace_seconds(),
            enable_gpus: true,
        }
    }
}

impl LabConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .map_err(|e| anyhow!("Failed to read config at {}: {}", path.display(), e))?;
        let mut config: LabConfig = serde_json::from_str(&data)
            .map_err(|e| anyhow!("Failed to parse config JSON at {}: {}", path.display(), e))?;

        config.runtime.public_host = config.runtime.public_host.trim().to_string();
        if config.runtime.public_host.is_empty() {
            config.runtime.public_host = default_public_host();
        }
        config.runtime.network = config
            .runtime
            .network
            .take()
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty());

        if config.ports.max_attempts == 0 {
            return Err(anyhow!(
                "ports.max_attempts must be greater than zero in {}",
                path.display()
            ));
        }

        Ok(config)
    }

    /// Loads the config from `path`, or from the default location. A missing
    /// default file yields the built-in defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
        let mut config = match path {
            Some(p) => (Self::load_from_path(p)?, Some(p.to_path_buf())),
            None => {
                let p = resolve_config_path();
                if p.exists() {
                    (Self::load_from_path(&p)?, Some(p))
                } else {
                    (Self::default(), None)
                }
            }
        };
        config.0.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("AILAB_HOST").filter(|v| !v.trim().is_empty()) {
            self.server.host = host.trim().to_string();
        }
        if let Some(port) = lookup("AILAB_PORT").and_then(|v| v.trim().parse().ok()) {
            self.server.port = port;
        }
        if let Some(root) = lookup("AILAB_DATA_ROOT").filter(|v| !v.trim().is_empty()) {
            self.storage.data_root = expand_path(root.trim().to_string());
        }
        if let Some(host) = lookup("AILAB_PUBLIC_HOST").filter(|v| !v.trim().is_empty()) {
            self.runtime.public_host = host.trim().to_string();
        }
    }
}

fn default_server_host() -> String {
    "0.0.0.0".to_string()
}

fn default_server_port() -> u16 {
    5555
}

fn default_start_port() -> u16 {
    8888
}

fn default_max_attempts() -> u16 {
    100
}

fn default_true() -> bool {
    true
}

fn default_data_root() -> PathBuf {
    PathBuf::from("/opt/ai-lab-data")
}

fn default_public_host() -> String {
    "localhost".to_string()
}

fn default_stop_grace_seconds() -> u32 {
    10
}

fn default_log_dir() -> String {
    "/var/log/ailab".to_string()
}

pub fn resolve_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("AILAB_CONFIG_PATH") {
        return expand_path(path);
    }

    default_config_path()
}

fn expand_path(input: String) -> PathBuf {
    if let Some(stripped) = input.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(input)
}

fn default_config_path() -> PathBuf {
    home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ailab")
        .join("ailab.json")
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}
