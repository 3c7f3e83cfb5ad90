//! In-memory runtime and host metrics for tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use super::host_metrics::{GpuInfo, HostMetrics};
use super::runtime::{
    ContainerInfo, ContainerRuntime, ContainerSpec, ContainerStats, ContainerStatus, RuntimeError,
    LABEL_MANAGED,
};

struct FakeContainer {
    info: ContainerInfo,
    stats: ContainerStats,
}

#[derive(Default)]
struct FakeState {
    containers: HashMap<String, FakeContainer>,
    next_id: u64,
    fail_create: Option<String>,
    fail_remove: bool,
    fail_stop: bool,
    fail_stats: bool,
    external_ports: HashSet<u16>,
    execs: Vec<(String, Vec<String>)>,
    specs: Vec<ContainerSpec>,
}

impl FakeState {
    fn find(&mut self, key: &str) -> Result<&mut FakeContainer, RuntimeError> {
        self.containers
            .values_mut()
            .find(|c| c.info.id == key || c.info.name == key)
            .ok_or_else(|| RuntimeError::NotFound(key.to_string()))
    }

    fn next_id(&mut self) -> String {
        self.next_id += 1;
        format!("c{:04}", self.next_id)
    }
}

#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_container(&self, name: &str, status: ContainerStatus, port: u16) -> String {
        self.insert_labelled(name, status, port, HashMap::new())
    }

    pub fn insert_labelled(
        &self,
        name: &str,
        status: ContainerStatus,
        port: u16,
        labels: HashMap<String, String>,
    ) -> String {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id();
        state.containers.insert(
            id.clone(),
            FakeContainer {
                info: ContainerInfo {
                    id: id.clone(),
                    name: name.to_string(),
                    status,
                    host_ports: vec![port],
                    labels,
                    created_at: Some(Utc::now()),
                },
                stats: ContainerStats::default(),
            },
        );
        id
    }

    pub fn set_stats(&self, id: &str, stats: ContainerStats) {
        self.state.lock().unwrap().find(id).unwrap().stats = stats;
    }

    /// Drops the published ports, as Docker reports for a container whose
    /// bindings it no longer knows.
    pub fn clear_ports(&self, id: &str) {
        self.state.lock().unwrap().find(id).unwrap().info.host_ports.clear();
    }

    pub fn status_of(&self, id: &str) -> Option<ContainerStatus> {
        self.state.lock().unwrap().find(id).ok().map(|c| c.info.status)
    }

    pub fn vanish(&self, id: &str) {
        self.state.lock().unwrap().containers.remove(id);
    }

    pub fn fail_next_create(&self, message: &str) {
        self.state.lock().unwrap().fail_create = Some(message.to_string());
    }

    pub fn fail_remove(&self, fail: bool) {
        self.state.lock().unwrap().fail_remove = fail;
    }

    pub fn fail_stop(&self, fail: bool) {
        self.state.lock().unwrap().fail_stop = fail;
    }

    pub fn fail_stats(&self, fail: bool) {
        self.state.lock().unwrap().fail_stats = fail;
    }

    pub fn add_external_port(&self, port: u16) {
        self.state.lock().unwrap().external_ports.insert(port);
    }

    pub fn container_count(&self) -> usize {
        self.state.lock().unwrap().containers.len()
    }

    pub fn execs(&self) -> Vec<(String, Vec<String>)> {
        self.state.lock().unwrap().execs.clone()
    }

    pub fn last_spec(&self) -> Option<ContainerSpec> {
        self.state.lock().unwrap().specs.last().cloned()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let mut state = self.state.lock().unwrap();
        if let Some(message) = state.fail_create.take() {
            return Err(RuntimeError::Other(message));
        }
        let id = state.next_id();
        state.specs.push(spec.clone());
        state.containers.insert(
            id.clone(),
            FakeContainer {
                info: ContainerInfo {
                    id: id.clone(),
                    name: spec.name.clone(),
                    status: ContainerStatus::Running,
                    host_ports: vec![spec.host_port],
                    labels: spec.labels.clone(),
                    created_at: Some(Utc::now()),
                },
                stats: ContainerStats::default(),
            },
        );
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.state.lock().unwrap().find(id)?.info.status = ContainerStatus::Running;
        Ok(())
    }

    async fn stop(&self, id: &str, _grace_seconds: u32) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_stop {
            return Err(RuntimeError::Other("stop timed out".to_string()));
        }
        state.find(id)?.info.status = ContainerStatus::Exited;
        Ok(())
    }

    async fn restart(&self, id: &str, _grace_seconds: u32) -> Result<(), RuntimeError> {
        self.state.lock().unwrap().find(id)?.info.status = ContainerStatus::Running;
        Ok(())
    }

    async fn pause(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        let container = state.find(id)?;
        if container.info.status != ContainerStatus::Running {
            return Err(RuntimeError::Other(format!("Container {id} is not running")));
        }
        container.info.status = ContainerStatus::Paused;
        Ok(())
    }

    async fn unpause(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        let container = state.find(id)?;
        if container.info.status != ContainerStatus::Paused {
            return Err(RuntimeError::Other(format!("Container {id} is not paused")));
        }
        container.info.status = ContainerStatus::Running;
        Ok(())
    }

    async fn remove(&self, id: &str, force: bool) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_remove {
            return Err(RuntimeError::Other("removal of container is already in progress".to_string()));
        }
        let container = state.find(id)?;
        if !force && container.info.status == ContainerStatus::Running {
            return Err(RuntimeError::Other(format!("cannot remove running container {id}")));
        }
        let key = container.info.id.clone();
        state.containers.remove(&key);
        Ok(())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerInfo, RuntimeError> {
        Ok(self.state.lock().unwrap().find(id)?.info.clone())
    }

    async fn list_managed(
        &self,
        status: Option<ContainerStatus>,
    ) -> Result<Vec<ContainerInfo>, RuntimeError> {
        let state = self.state.lock().unwrap();
        let mut infos: Vec<ContainerInfo> = state
            .containers
            .values()
            .filter(|c| c.info.labels.get(LABEL_MANAGED).map(String::as_str) == Some("true"))
            .filter(|c| status.map_or(true, |s| c.info.status == s))
            .map(|c| c.info.clone())
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(infos)
    }

    async fn bound_ports(&self) -> Result<HashSet<u16>, RuntimeError> {
        let state = self.state.lock().unwrap();
        let mut ports = state.external_ports.clone();
        for container in state.containers.values() {
            ports.extend(container.info.host_ports.iter().copied());
        }
        Ok(ports)
    }

    async fn stats(&self, id: &str) -> Result<ContainerStats, RuntimeError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_stats {
            return Err(RuntimeError::Other("stats stream closed".to_string()));
        }
        Ok(state.find(id)?.stats)
    }

    async fn exec(&self, id: &str, cmd: Vec<String>) -> Result<String, RuntimeError> {
        let mut state = self.state.lock().unwrap();
        let container = state.find(id)?;
        if container.info.status != ContainerStatus::Running {
            return Err(RuntimeError::Other(format!("Container {id} is not running")));
        }
        let key = container.info.id.clone();
        state.execs.push((key, cmd));
        Ok("Successfully installed".to_string())
    }
}

pub struct FakeMetrics {
    pub available_memory_gb: f64,
    pub gpu_count: u32,
}

impl Default for FakeMetrics {
    fn default() -> Self {
        Self {
            available_memory_gb: 64.0,
            gpu_count: 2,
        }
    }
}

#[async_trait]
impl HostMetrics for FakeMetrics {
    async fn total_memory_gb(&self) -> f64 {
        128.0
    }

    async fn available_memory_gb(&self) -> f64 {
        self.available_memory_gb
    }

    async fn cpu_count(&self) -> usize {
        16
    }

    async fn cpu_usage_percent(&self) -> f64 {
        25.0
    }

    async fn gpus(&self) -> Vec<GpuInfo> {
        (0..self.gpu_count)
            .map(|index| GpuInfo {
                index,
                name: "NVIDIA GeForce RTX 3090".to_string(),
                utilization_percent: 10.0,
                memory_used_mb: 512,
                memory_total_mb: 24576,
                temperature_c: Some(45.0),
            })
            .collect()
    }
}
