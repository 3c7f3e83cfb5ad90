use std::collections::{BTreeSet, HashMap, HashSet};

use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
        RemoveContainerOptions, RestartContainerOptions, Stats, StatsOptions,
        StopContainerOptions,
    },
    errors::Error as BollardError,
    exec::{CreateExecOptions, StartExecResults},
    models::{
        ContainerInspectResponse, ContainerStateStatusEnum, ContainerSummary, DeviceRequest,
        HostConfig, PortBinding, PortMap, RestartPolicy, RestartPolicyNameEnum,
    },
    Docker,
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tracing::{info, warn};

use super::runtime::{
    ContainerInfo, ContainerRuntime, ContainerSpec, ContainerStats, ContainerStatus, RuntimeError,
    LABEL_MANAGED,
};

/// Docker engine adapter built on bollard.
pub struct DockerManager {
    docker: Docker,
}

impl DockerManager {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// Connects with the local defaults (unix socket or DOCKER_HOST) and
    /// verifies the daemon answers.
    pub async fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;
        let manager = Self::new(docker);
        manager.ping().await?;
        Ok(manager)
    }
}

fn map_docker_error(id: &str, err: BollardError) -> RuntimeError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::NotFound(id.to_string()),
        BollardError::DockerResponseServerError { message, .. } => RuntimeError::Other(message),
        e @ BollardError::IOError { .. } => RuntimeError::Unavailable(e.to_string()),
        other => RuntimeError::Other(other.to_string()),
    }
}

/// The start error is what the caller sees; a failed removal is only logged
/// and leaves the container for `cleanup`.
fn failed_start_error(
    name: &str,
    start: BollardError,
    cleanup: Result<(), BollardError>,
) -> RuntimeError {
    if let Err(e) = cleanup {
        warn!("Could not remove {} after it failed to start: {}", name, e);
    }
    map_docker_error(name, start)
}

fn status_from_state(status: &ContainerStateStatusEnum) -> ContainerStatus {
    match status {
        ContainerStateStatusEnum::CREATED => ContainerStatus::Created,
        ContainerStateStatusEnum::RUNNING => ContainerStatus::Running,
        ContainerStateStatusEnum::PAUSED => ContainerStatus::Paused,
        ContainerStateStatusEnum::RESTARTING => ContainerStatus::Restarting,
        ContainerStateStatusEnum::REMOVING => ContainerStatus::Removing,
        ContainerStateStatusEnum::EXITED => ContainerStatus::Exited,
        ContainerStateStatusEnum::DEAD => ContainerStatus::Dead,
        _ => ContainerStatus::Unknown,
    }
}

fn collect_host_ports(ports: &PortMap, out: &mut BTreeSet<u16>) {
    for bindings in ports.values().flatten() {
        for binding in bindings {
            if let Some(port) = binding.host_port.as_deref().and_then(|p| p.parse().ok()) {
                out.insert(port);
            }
        }
    }
}

fn info_from_inspect(resp: ContainerInspectResponse) -> ContainerInfo {
    let status = resp
        .state
        .as_ref()
        .and_then(|s| s.status.as_ref())
        .map(status_from_state)
        .unwrap_or(ContainerStatus::Unknown);

    // Stopped containers lose their network_settings ports, but keep the
    // requested bindings in host_config.
    let mut host_ports = BTreeSet::new();
    if let Some(ports) = resp.network_settings.as_ref().and_then(|n| n.ports.as_ref()) {
        collect_host_ports(ports, &mut host_ports);
    }
    if let Some(ports) = resp.host_config.as_ref().and_then(|h| h.port_bindings.as_ref()) {
        collect_host_ports(ports, &mut host_ports);
    }

    ContainerInfo {
        id: resp.id.unwrap_or_default(),
        name: resp
            .name
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_default(),
        status,
        host_ports: host_ports.into_iter().collect(),
        labels: resp.config.and_then(|c| c.labels).unwrap_or_default(),
        created_at: resp
            .created
            .and_then(|c| DateTime::parse_from_rfc3339(&c).ok())
            .map(|d| d.with_timezone(&Utc)),
    }
}

fn info_from_summary(summary: ContainerSummary) -> ContainerInfo {
    let host_ports: BTreeSet<u16> = summary
        .ports
        .unwrap_or_default()
        .iter()
        .filter_map(|p| p.public_port)
        .collect();

    ContainerInfo {
        id: summary.id.unwrap_or_default(),
        name: summary
            .names
            .and_then(|names| names.into_iter().next())
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_default(),
        status: summary
            .state
            .as_deref()
            .map(ContainerStatus::parse)
            .unwrap_or(ContainerStatus::Unknown),
        host_ports: host_ports.into_iter().collect(),
        labels: summary.labels.unwrap_or_default(),
        created_at: summary
            .created
            .and_then(|secs| DateTime::from_timestamp(secs, 0)),
    }
}

/// CPU usage in percent of one core, the way `docker stats` computes it.
fn cpu_percent(cpu_total: u64, precpu_total: u64, system: u64, presystem: u64, online: u64) -> f64 {
    let cpu_delta = cpu_total.saturating_sub(precpu_total) as f64;
    let system_delta = system.saturating_sub(presystem) as f64;
    if cpu_delta <= 0.0 || system_delta <= 0.0 {
        return 0.0;
    }
    cpu_delta / system_delta * online.max(1) as f64 * 100.0
}

fn stats_from_sample(stats: &Stats) -> ContainerStats {
    let online = stats.cpu_stats.online_cpus.unwrap_or_else(|| {
        stats
            .cpu_stats
            .cpu_usage
            .percpu_usage
            .as_ref()
            .map(|v| v.len() as u64)
            .unwrap_or(1)
    });

    ContainerStats {
        cpu_percent: cpu_percent(
            stats.cpu_stats.cpu_usage.total_usage,
            stats.precpu_stats.cpu_usage.total_usage,
            stats.cpu_stats.system_cpu_usage.unwrap_or(0),
            stats.precpu_stats.system_cpu_usage.unwrap_or(0),
            online,
        ),
        memory_bytes: stats.memory_stats.usage.unwrap_or(0),
    }
}

fn build_container_config(spec: &ContainerSpec) -> Config<String> {
    let port_key = format!("{}/tcp", spec.container_port);

    let mut port_bindings: PortMap = HashMap::new();
    port_bindings.insert(
        port_key.clone(),
        Some(vec![PortBinding {
            host_ip: Some("0.0.0.0".to_string()),
            host_port: Some(spec.host_port.to_string()),
        }]),
    );

    let mut exposed_ports = HashMap::new();
    exposed_ports.insert(port_key, HashMap::new());

    let device_requests = (spec.gpus > 0).then(|| {
        vec![DeviceRequest {
            driver: Some("nvidia".to_string()),
            count: Some(i64::from(spec.gpus)),
            capabilities: Some(vec![vec!["gpu".to_string()]]),
            ..Default::default()
        }]
    });

    let host_config = HostConfig {
        memory: (spec.memory_bytes > 0).then_some(spec.memory_bytes),
        nano_cpus: (spec.nano_cpus > 0).then_some(spec.nano_cpus),
        binds: Some(spec.binds.clone()),
        port_bindings: Some(port_bindings),
        device_requests,
        network_mode: spec.network.clone(),
        restart_policy: Some(RestartPolicy {
            name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
            maximum_retry_count: None,
        }),
        ..Default::default()
    };

    Config {
        image: Some(spec.image.clone()),
        env: Some(spec.env.clone()),
        labels: Some(spec.labels.clone()),
        exposed_ports: Some(exposed_ports),
        host_config: Some(host_config),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerRuntime for DockerManager {
    async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))
    }

    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        info!(
            "Creating container {} from image {} on host port {}",
            spec.name, spec.image, spec.host_port
        );

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    ..Default::default()
                }),
                build_container_config(spec),
            )
            .await
            .map_err(|e| map_docker_error(&spec.name, e))?;

        for warning in &created.warnings {
            warn!("Docker warning for {}: {}", spec.name, warning);
        }

        if let Err(e) = self.docker.start_container::<String>(&created.id, None).await {
            warn!("Container {} failed to start, removing it: {}", spec.name, e);
            let cleanup = self
                .docker
                .remove_container(
                    &created.id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await;
            return Err(failed_start_error(&spec.name, e, cleanup));
        }

        info!("Container {} started ({})", spec.name, created.id);
        Ok(created.id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container::<String>(id, None)
            .await
            .map_err(|e| map_docker_error(id, e))
    }

    async fn stop(&self, id: &str, grace_seconds: u32) -> Result<(), RuntimeError> {
        self.docker
            .stop_container(
                id,
                Some(StopContainerOptions {
                    t: i64::from(grace_seconds),
                }),
            )
            .await
            .map_err(|e| map_docker_error(id, e))
    }

    async fn restart(&self, id: &str, grace_seconds: u32) -> Result<(), RuntimeError> {
        self.docker
            .restart_container(
                id,
                Some(RestartContainerOptions {
                    t: grace_seconds as isize,
                }),
            )
            .await
            .map_err(|e| map_docker_error(id, e))
    }

    async fn pause(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .pause_container(id)
            .await
            .map_err(|e| map_docker_error(id, e))
    }

    async fn unpause(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .unpause_container(id)
            .await
            .map_err(|e| map_docker_error(id, e))
    }

    async fn remove(&self, id: &str, force: bool) -> Result<(), RuntimeError> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| map_docker_error(id, e))
    }

    async fn inspect(&self, id: &str) -> Result<ContainerInfo, RuntimeError> {
        self.docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map(info_from_inspect)
            .map_err(|e| map_docker_error(id, e))
    }

    async fn list_managed(
        &self,
        status: Option<ContainerStatus>,
    ) -> Result<Vec<ContainerInfo>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{LABEL_MANAGED}=true")]);
        if let Some(status) = status {
            filters.insert("status".to_string(), vec![status.as_str().to_string()]);
        }

        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| map_docker_error("containers", e))?;

        Ok(summaries.into_iter().map(info_from_summary).collect())
    }

    async fn bound_ports(&self) -> Result<HashSet<u16>, RuntimeError> {
        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await
            .map_err(|e| map_docker_error("containers", e))?;

        Ok(summaries
            .iter()
            .filter_map(|s| s.ports.as_ref())
            .flatten()
            .filter_map(|p| p.public_port)
            .collect())
    }

    async fn stats(&self, id: &str) -> Result<ContainerStats, RuntimeError> {
        let mut stream = self.docker.stats(
            id,
            Some(StatsOptions {
                stream: false,
                one_shot: false,
            }),
        );

        match stream.next().await {
            Some(Ok(sample)) => Ok(stats_from_sample(&sample)),
            Some(Err(e)) => Err(map_docker_error(id, e)),
            None => Err(RuntimeError::Other(format!("no stats returned for {id}"))),
        }
    }

    async fn exec(&self, id: &str, cmd: Vec<String>) -> Result<String, RuntimeError> {
        info!("Executing command in container {}: {}", id, cmd.join(" "));

        let exec_config = CreateExecOptions {
            cmd: Some(cmd),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(id, exec_config)
            .await
            .map_err(|e| map_docker_error(id, e))?;

        let mut output_str = String::new();
        if let StartExecResults::Attached { mut output, .. } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| map_docker_error(id, e))?
        {
            while let Some(Ok(msg)) = output.next().await {
                output_str.push_str(&msg.to_string());
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| map_docker_error(id, e))?;
        match inspect.exit_code {
            Some(code) if code != 0 => Err(RuntimeError::Other(format!(
                "command exited with code {code}: {}",
                output_str.trim()
            ))),
            _ => Ok(output_str),
        }
    }
}
