use async_trait::async_trait;
use serde::Serialize;
use sysinfo::System;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GpuInfo {
    pub index: u32,
    pub name: String,
    pub utilization_percent: f64,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    pub temperature_c: Option<f64>,
}

/// Host-wide resource readings used for admission checks and reporting.
#[async_trait]
pub trait HostMetrics: Send + Sync {
    async fn total_memory_gb(&self) -> f64;

    async fn available_memory_gb(&self) -> f64;

    async fn cpu_count(&self) -> usize;

    async fn cpu_usage_percent(&self) -> f64;

    /// GPU inventory; empty when the host has no NVIDIA tooling.
    async fn gpus(&self) -> Vec<GpuInfo>;
}

pub struct SystemMetrics {
    system: Mutex<System>,
}

impl SystemMetrics {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        system.refresh_cpu();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SystemMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HostMetrics for SystemMetrics {
    async fn total_memory_gb(&self) -> f64 {
        let mut system = self.system.lock().await;
        system.refresh_memory();
        system.total_memory() as f64 / BYTES_PER_GB
    }

    async fn available_memory_gb(&self) -> f64 {
        let mut system = self.system.lock().await;
        system.refresh_memory();
        system.available_memory() as f64 / BYTES_PER_GB
    }

    async fn cpu_count(&self) -> usize {
        self.system.lock().await.cpus().len()
    }

    async fn cpu_usage_percent(&self) -> f64 {
        // Usage is a delta against the previous refresh, so the first
        // reading after start-up may be zero.
        let mut system = self.system.lock().await;
        system.refresh_cpu();
        f64::from(system.global_cpu_info().cpu_usage())
    }

    async fn gpus(&self) -> Vec<GpuInfo> {
        let output = Command::new("nvidia-smi")
            .args([
                "--query-gpu=index,name,utilization.gpu,memory.used,memory.total,temperature.gpu",
                "--format=csv,noheader,nounits",
            ])
            .output()
            .await;

        match output {
            Ok(out) if out.status.success() => {
                parse_nvidia_smi(&String::from_utf8_lossy(&out.stdout))
            }
            Ok(out) => {
                warn!("nvidia-smi failed with status {}", out.status);
                Vec::new()
            }
            Err(e) => {
                debug!("nvidia-smi not available: {}", e);
                Vec::new()
            }
        }
    }
}

fn parse_number(field: &str) -> Option<f64> {
    field.trim().parse::<f64>().ok()
}

/// Parses `nvidia-smi --format=csv,noheader,nounits` rows of
/// index, name, utilization, memory used, memory total, temperature.
pub fn parse_nvidia_smi(output: &str) -> Vec<GpuInfo> {
    let mut gpus = Vec::new();

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split(',').map(|s| s.trim()).collect();
        if parts.len() < 5 {
            warn!(line = %line, "Unexpected nvidia-smi output format");
            continue;
        }
        let Ok(index) = parts[0].parse::<u32>() else {
            warn!(line = %line, "Unexpected nvidia-smi GPU index");
            continue;
        };

        gpus.push(GpuInfo {
            index,
            name: parts[1].to_string(),
            utilization_percent: parse_number(parts[2]).unwrap_or(0.0),
            memory_used_mb: parse_number(parts[3]).unwrap_or(0.0) as u64,
            memory_total_mb: parse_number(parts[4]).unwrap_or(0.0) as u64,
            temperature_c: parts.get(5).and_then(|t| parse_number(t)),
        });
    }

    gpus
}

/// Mean utilization across all GPUs, or `None` on a GPU-less host.
pub fn mean_utilization(gpus: &[GpuInfo]) -> Option<f64> {
    if gpus.is_empty() {
        return None;
    }
    Some(gpus.iter().map(|g| g.utilization_percent).sum::<f64>() / gpus.len() as f64)
}
