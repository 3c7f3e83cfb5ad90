use serde::Serialize;
use tracing::warn;

use super::runtime::{ContainerRuntime, ContainerStatus};
use crate::shared::models::EnvironmentRecord;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UserUsage {
    pub environments: usize,
    pub running: usize,
    pub paused: usize,
    pub total_memory_gb: f64,
    pub total_cpu_cores: f64,
    pub total_gpus: u32,
    /// Host-wide mean GPU utilization. Not attributable to one container.
    pub host_gpu_utilization: Option<f64>,
}

/// Sums live usage over `records`. Only running containers are sampled;
/// a container that cannot be inspected or sampled is skipped.
pub async fn aggregate(
    runtime: &dyn ContainerRuntime,
    records: &[EnvironmentRecord],
    host_gpu_utilization: Option<f64>,
) -> UserUsage {
    let mut usage = UserUsage {
        environments: records.len(),
        host_gpu_utilization,
        ..Default::default()
    };

    for record in records {
        let info = match runtime.inspect(&record.container_id).await {
            Ok(info) => info,
            Err(e) => {
                warn!("Skipping {} in usage aggregation: {}", record.container_id, e);
                continue;
            }
        };

        match info.status {
            ContainerStatus::Running => usage.running += 1,
            ContainerStatus::Paused => {
                usage.paused += 1;
                continue;
            }
            _ => continue,
        }

        match runtime.stats(&record.container_id).await {
            Ok(stats) => {
                usage.total_memory_gb += stats.memory_bytes as f64 / BYTES_PER_GB;
                usage.total_cpu_cores += stats.cpu_percent / 100.0;
                usage.total_gpus += record.gpus;
            }
            Err(e) => {
                warn!("Could not read stats for {}: {}", record.container_id, e);
            }
        }
    }

    usage
}
