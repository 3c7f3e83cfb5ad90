use std::collections::{HashMap, HashSet};
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

pub const LABEL_MANAGED: &str = "ailab.managed";
pub const LABEL_USER: &str = "ailab.user_id";
pub const LABEL_ENV_TYPE: &str = "ailab.env_type";
pub const LABEL_PORT: &str = "ailab.port";
pub const LABEL_GPUS: &str = "ailab.gpus";
pub const LABEL_MEMORY_GB: &str = "ailab.memory_gb";
pub const LABEL_CPU_CORES: &str = "ailab.cpu_cores";
pub const LABEL_CREATED_AT: &str = "ailab.created_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown,
}

impl ContainerStatus {
    /// Parses the lowercase state string Docker reports in container listings.
    pub fn parse(state: &str) -> Self {
        match state.trim().to_ascii_lowercase().as_str() {
            "created" => ContainerStatus::Created,
            "running" => ContainerStatus::Running,
            "paused" => ContainerStatus::Paused,
            "restarting" => ContainerStatus::Restarting,
            "removing" => ContainerStatus::Removing,
            "exited" => ContainerStatus::Exited,
            "dead" => ContainerStatus::Dead,
            _ => ContainerStatus::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ContainerStatus::Created => "created",
            ContainerStatus::Running => "running",
            ContainerStatus::Paused => "paused",
            ContainerStatus::Restarting => "restarting",
            ContainerStatus::Removing => "removing",
            ContainerStatus::Exited => "exited",
            ContainerStatus::Dead => "dead",
            ContainerStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed to create and start one environment container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub labels: HashMap<String, String>,
    pub env: Vec<String>,
    pub container_port: u16,
    pub host_port: u16,
    pub memory_bytes: i64,
    pub nano_cpus: i64,
    pub gpus: u32,
    pub binds: Vec<String>,
    pub network: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub status: ContainerStatus,
    pub host_ports: Vec<u16>,
    pub labels: HashMap<String, String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl ContainerInfo {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    /// Host port from the live bindings, falling back to the creation label.
    pub fn host_port(&self) -> Option<u16> {
        self.host_ports
            .first()
            .copied()
            .or_else(|| self.label(LABEL_PORT).and_then(|p| p.parse().ok()))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ContainerStats {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
}

#[derive(Error, Debug, Clone)]
pub enum RuntimeError {
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),
    #[error("No such container: {0}")]
    NotFound(String),
    #[error("{0}")]
    Other(String),
}

/// The slice of a Docker-compatible engine the environment manager drives.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn ping(&self) -> Result<(), RuntimeError>;

    /// Creates and starts the container, returning its id. A container that
    /// was created but failed to start is removed before the error returns.
    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    async fn start(&self, id: &str) -> Result<(), RuntimeError>;

    async fn stop(&self, id: &str, grace_seconds: u32) -> Result<(), RuntimeError>;

    async fn restart(&self, id: &str, grace_seconds: u32) -> Result<(), RuntimeError>;

    async fn pause(&self, id: &str) -> Result<(), RuntimeError>;

    async fn unpause(&self, id: &str) -> Result<(), RuntimeError>;

    async fn remove(&self, id: &str, force: bool) -> Result<(), RuntimeError>;

    async fn inspect(&self, id: &str) -> Result<ContainerInfo, RuntimeError>;

    /// Containers carrying the managed label, optionally filtered by status.
    async fn list_managed(
        &self,
        status: Option<ContainerStatus>,
    ) -> Result<Vec<ContainerInfo>, RuntimeError>;

    /// Host ports currently published by any container the engine knows about.
    async fn bound_ports(&self) -> Result<HashSet<u16>, RuntimeError>;

    async fn stats(&self, id: &str) -> Result<ContainerStats, RuntimeError>;

    async fn exec(&self, id: &str, cmd: Vec<String>) -> Result<String, RuntimeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parse() {
        assert_eq!(ContainerStatus::parse("running"), ContainerStatus::Running);
        assert_eq!(ContainerStatus::parse("Paused"), ContainerStatus::Paused);
        assert_eq!(ContainerStatus::parse("weird"), ContainerStatus::Unknown);
    }

    #[test]
    fn test_host_port_falls_back_to_label() {
        let mut info = ContainerInfo {
            id: "abc".to_string(),
            name: "ai-lab-vscode".to_string(),
            status: ContainerStatus::Exited,
            host_ports: vec![],
            labels: HashMap::from([(LABEL_PORT.to_string(), "8890".to_string())]),
            created_at: None,
        };
        assert_eq!(info.host_port(), Some(8890));

        info.host_ports = vec![8891];
        assert_eq!(info.host_port(), Some(8891));

        info.host_ports.clear();
        info.labels.clear();
        assert_eq!(info.host_port(), None);
    }
}
