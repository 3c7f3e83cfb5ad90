use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::error::{LabError, Result};
use super::host_metrics::{mean_utilization, GpuInfo, HostMetrics};
use super::ownership::OwnershipTracker;
use super::port_allocator::PortAllocator;
use super::quota::{self, ResourceClaim};
use super::runtime::{
    ContainerInfo, ContainerRuntime, ContainerSpec, ContainerStatus, LABEL_CPU_CORES,
    LABEL_CREATED_AT, LABEL_ENV_TYPE, LABEL_GPUS, LABEL_MANAGED, LABEL_MEMORY_GB, LABEL_PORT,
    LABEL_USER,
};
use super::storage::{sanitize_user_id, WorkspaceStorage};
use super::usage::{self, UserUsage};
use crate::shared::models::{
    EnvironmentKind, EnvironmentRecord, EnvironmentState, EnvironmentType, QuotaTier, Template,
};
use crate::shared::LabConfig;

const BYTES_PER_GB: i64 = 1024 * 1024 * 1024;
const NANO_CPUS_PER_CORE: i64 = 1_000_000_000;

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub start_port: u16,
    pub max_attempts: u16,
    pub probe_bind: bool,
    pub public_host: String,
    pub network: Option<String>,
    pub stop_grace_seconds: u32,
    pub enable_gpus: bool,
}

impl From<&LabConfig> for ManagerSettings {
    fn from(config: &LabConfig) -> Self {
        Self {
            start_port: config.ports.start_port,
            max_attempts: config.ports.max_attempts,
            probe_bind: config.ports.probe_bind,
            public_host: config.runtime.public_host.clone(),
            network: config.runtime.network.clone(),
            stop_grace_seconds: config.runtime.stop_grace_seconds,
            enable_gpus: config.runtime.enable_gpus,
        }
    }
}

/// A create request as it arrives from a client; keys are parsed here so
/// the checks run in a fixed order.
#[derive(Debug, Clone, Default)]
pub struct CreateEnvironment {
    pub user_id: String,
    pub env_type: String,
    pub quota: String,
    pub gpu_count: Option<u32>,
    pub memory_gb: Option<u32>,
    pub cpu_cores: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatedEnvironment {
    pub container_id: String,
    pub name: String,
    pub port: u16,
    pub access_url: String,
    pub env_type: EnvironmentType,
    pub state: EnvironmentState,
    pub gpus: u32,
    pub memory_gb: u32,
    pub cpu_cores: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct TemplateEnvironment {
    #[serde(flatten)]
    pub environment: CreatedEnvironment,
    pub template: Template,
    pub packages_installed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeletedEnvironment {
    pub container_id: String,
    pub released_port: Option<u16>,
    pub orphaned_port: Option<u16>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub removed: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub adopted: Vec<String>,
    pub dropped: Vec<String>,
    pub released_ports: Vec<u16>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccessInfo {
    pub container_id: String,
    pub status: ContainerStatus,
    pub env_type: Option<EnvironmentType>,
    pub port: Option<u16>,
    pub access_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuntimeReport {
    pub container_id: String,
    pub tier: QuotaTier,
    pub elapsed_hours: f64,
    pub limit_hours: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceAvailability {
    pub runtime_available: bool,
    pub total_memory_gb: f64,
    pub available_memory_gb: f64,
    pub cpu_count: usize,
    pub cpu_usage_percent: f64,
    pub gpus: Vec<GpuInfo>,
    pub allocated_gpus: u32,
    pub free_gpus: u32,
    pub reserved_ports: Vec<u16>,
    pub orphaned_ports: Vec<u16>,
}

#[derive(Debug, Clone, Copy)]
enum Lifecycle {
    Start,
    Stop,
    Restart,
    Pause,
    Resume,
}

/// Creates, drives and removes user environments on the container runtime
/// while keeping ports, ownership and quotas consistent.
pub struct EnvironmentManager {
    runtime: Option<Arc<dyn ContainerRuntime>>,
    metrics: Arc<dyn HostMetrics>,
    ports: PortAllocator,
    tracker: Arc<OwnershipTracker>,
    storage: WorkspaceStorage,
    settings: ManagerSettings,
}

impl EnvironmentManager {
    pub fn new(
        runtime: Option<Arc<dyn ContainerRuntime>>,
        metrics: Arc<dyn HostMetrics>,
        storage: WorkspaceStorage,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            runtime,
            metrics,
            ports: PortAllocator::new(settings.probe_bind),
            tracker: Arc::new(OwnershipTracker::new()),
            storage,
            settings,
        }
    }

    pub fn from_config(
        config: &LabConfig,
        runtime: Option<Arc<dyn ContainerRuntime>>,
        metrics: Arc<dyn HostMetrics>,
    ) -> Self {
        Self::new(
            runtime,
            metrics,
            WorkspaceStorage::new(config.storage.data_root.clone()),
            ManagerSettings::from(config),
        )
    }

    pub fn runtime_available(&self) -> bool {
        self.runtime.is_some()
    }

    #[cfg(test)]
    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    pub fn tracker(&self) -> &OwnershipTracker {
        &self.tracker
    }

    fn runtime(&self) -> Result<&Arc<dyn ContainerRuntime>> {
        self.runtime
            .as_ref()
            .ok_or_else(|| LabError::RuntimeUnavailable("Docker client not initialized".to_string()))
    }

    fn access_url(&self, env_type: EnvironmentType, port: u16) -> String {
        format!(
            "http://{}:{}{}",
            self.settings.public_host,
            port,
            env_type.access_path()
        )
    }

    async fn host_gpu_count(&self) -> u32 {
        if !self.settings.enable_gpus {
            return 0;
        }
        self.metrics.gpus().await.len() as u32
    }

    pub async fn create(&self, request: CreateEnvironment) -> Result<CreatedEnvironment> {
        let runtime = self.runtime()?.clone();
        let env_type: EnvironmentType = request.env_type.parse()?;
        let tier: QuotaTier = request.quota.parse()?;
        let user = request.user_id.trim();
        let profile = env_type.profile();
        let limits = tier.limits();

        // Omitted memory/CPU default to the tier cap split over
        // `max_environments`, at least one.
        let share = |cap: u32| (cap / limits.max_environments.max(1)).max(1);
        let gpus = request.gpu_count.unwrap_or(profile.default_gpus);
        let memory_gb = request.memory_gb.unwrap_or_else(|| share(limits.max_memory_gb));
        let cpu_cores = request.cpu_cores.unwrap_or_else(|| share(limits.max_cpu_cores));
        let claim = ResourceClaim {
            gpus,
            memory_gb,
            cpu_cores,
        };

        let slot = self.tracker.reserve_slot(user, tier, claim)?;

        let free_gpus = self
            .host_gpu_count()
            .await
            .saturating_sub(self.tracker.allocated_gpus());
        if gpus > free_gpus {
            return Err(LabError::ResourceUnavailable(format!(
                "requested {gpus} GPUs, {free_gpus} available"
            )));
        }
        let available_memory = self.metrics.available_memory_gb().await;
        if f64::from(memory_gb) > available_memory {
            return Err(LabError::ResourceUnavailable(format!(
                "requested {memory_gb}GB memory, {available_memory:.1}GB available"
            )));
        }

        let bound = runtime.bound_ports().await?;
        let port = self
            .ports
            .allocate(self.settings.start_port, self.settings.max_attempts, &bound)?;

        let name = format!(
            "ai-lab-{}-{}-{}",
            env_type,
            sanitize_user_id(user),
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let spec = match self
            .container_spec(&name, user, env_type, tier, port, gpus, memory_gb, cpu_cores)
            .await
        {
            Ok(spec) => spec,
            Err(e) => {
                self.ports.release(port);
                return Err(e);
            }
        };

        info!(
            "Creating {} environment {} for user {} on port {} ({} GPUs, {}GB, {} cores)",
            env_type, name, user, port, gpus, memory_gb, cpu_cores
        );
        let container_id = match runtime.create_and_start(&spec).await {
            Ok(id) => id,
            Err(e) => {
                error!("Failed to create environment {}: {}", name, e);
                self.ports.release(port);
                return Err(e.into());
            }
        };

        slot.commit(EnvironmentRecord {
            container_id: container_id.clone(),
            name: name.clone(),
            user_id: user.to_string(),
            env_type,
            port,
            gpus,
            memory_gb,
            cpu_cores,
            created_at: Utc::now(),
            state: EnvironmentState::Running,
        });

        Ok(CreatedEnvironment {
            access_url: self.access_url(env_type, port),
            container_id,
            name,
            port,
            env_type,
            state: EnvironmentState::Running,
            gpus,
            memory_gb,
            cpu_cores,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn container_spec(
        &self,
        name: &str,
        user: &str,
        env_type: EnvironmentType,
        tier: QuotaTier,
        port: u16,
        gpus: u32,
        memory_gb: u32,
        cpu_cores: u32,
    ) -> Result<ContainerSpec> {
        let profile = env_type.profile();
        let user_dir = self.storage.ensure_user_dirs(user).await?;

        let labels = HashMap::from([
            (LABEL_MANAGED.to_string(), "true".to_string()),
            (LABEL_USER.to_string(), user.to_string()),
            (LABEL_ENV_TYPE.to_string(), env_type.to_string()),
            (LABEL_PORT.to_string(), port.to_string()),
            (LABEL_GPUS.to_string(), gpus.to_string()),
            (LABEL_MEMORY_GB.to_string(), memory_gb.to_string()),
            (LABEL_CPU_CORES.to_string(), cpu_cores.to_string()),
            (LABEL_CREATED_AT.to_string(), Utc::now().to_rfc3339()),
        ]);

        let mut env = vec![format!("USER_QUOTA={tier}"), format!("AILAB_USER={user}")];
        if profile.kind == EnvironmentKind::Jupyter {
            env.push("JUPYTER_ENABLE_LAB=yes".to_string());
        }

        Ok(ContainerSpec {
            name: name.to_string(),
            image: profile.image.to_string(),
            labels,
            env,
            container_port: profile.container_port,
            host_port: port,
            memory_bytes: i64::from(memory_gb) * BYTES_PER_GB,
            nano_cpus: i64::from(cpu_cores) * NANO_CPUS_PER_CORE,
            gpus,
            binds: vec![
                format!("{}:{}:rw", user_dir.display(), profile.workspace_path),
                format!("{}:{}:ro", self.storage.shared_dir().display(), profile.shared_path),
            ],
            network: self.settings.network.clone(),
        })
    }

    /// Creates an environment from a template, clamping its recommended
    /// resources to the tier, then installs the template's packages.
    pub async fn create_from_template(
        &self,
        user_id: &str,
        template: &str,
        quota: &str,
    ) -> Result<TemplateEnvironment> {
        self.runtime()?;
        let template: Template = template.parse()?;
        let tier: QuotaTier = quota.parse()?;
        let profile = template.profile();
        let limits = tier.limits();

        let environment = self
            .create(CreateEnvironment {
                user_id: user_id.to_string(),
                env_type: profile.environment_type.to_string(),
                quota: tier.to_string(),
                gpu_count: Some(profile.recommended_gpus.min(limits.max_gpus)),
                memory_gb: Some(profile.recommended_memory_gb.min(limits.max_memory_gb)),
                cpu_cores: None,
            })
            .await?;

        let packages: Vec<String> = profile.pip_packages.iter().map(|p| p.to_string()).collect();
        let packages_installed = match self.pip_install(&environment.container_id, packages).await {
            Ok(_) => true,
            Err(e) => {
                warn!(
                    "Package setup for template {} in {} failed: {}",
                    template, environment.container_id, e
                );
                false
            }
        };

        Ok(TemplateEnvironment {
            environment,
            template,
            packages_installed,
        })
    }

    /// Inspects the container and, when `user` is given, checks that they own it.
    async fn authorize(&self, container_id: &str, user: Option<&str>) -> Result<ContainerInfo> {
        let runtime = self.runtime()?;
        let info = runtime.inspect(container_id).await?;
        if let Some(user) = user {
            if !self.tracker.owns(user, &info.id) {
                return Err(LabError::AccessDenied {
                    user: user.to_string(),
                    container: container_id.to_string(),
                });
            }
        }
        Ok(info)
    }

    async fn transition(
        &self,
        container_id: &str,
        user: Option<&str>,
        action: Lifecycle,
    ) -> Result<EnvironmentState> {
        let info = self.authorize(container_id, user).await?;
        let runtime = self.runtime()?;
        let grace = self.settings.stop_grace_seconds;

        let state = match action {
            Lifecycle::Start => {
                runtime.start(&info.id).await?;
                EnvironmentState::Running
            }
            Lifecycle::Stop => {
                runtime.stop(&info.id, grace).await?;
                EnvironmentState::Stopped
            }
            Lifecycle::Restart => {
                runtime.restart(&info.id, grace).await?;
                EnvironmentState::Running
            }
            Lifecycle::Pause => {
                require_status(&info, container_id, ContainerStatus::Running)?;
                runtime.pause(&info.id).await?;
                EnvironmentState::Paused
            }
            Lifecycle::Resume => {
                require_status(&info, container_id, ContainerStatus::Paused)?;
                runtime.unpause(&info.id).await?;
                EnvironmentState::Running
            }
        };

        self.tracker.set_state(&info.id, state);
        info!("Environment {} is now {}", container_id, state);
        Ok(state)
    }

    pub async fn start(&self, container_id: &str, user: Option<&str>) -> Result<EnvironmentState> {
        self.transition(container_id, user, Lifecycle::Start).await
    }

    pub async fn stop(&self, container_id: &str, user: Option<&str>) -> Result<EnvironmentState> {
        self.transition(container_id, user, Lifecycle::Stop).await
    }

    pub async fn restart(&self, container_id: &str, user: Option<&str>) -> Result<EnvironmentState> {
        self.transition(container_id, user, Lifecycle::Restart).await
    }

    pub async fn pause(&self, container_id: &str, user: Option<&str>) -> Result<EnvironmentState> {
        self.transition(container_id, user, Lifecycle::Pause).await
    }

    pub async fn resume(&self, container_id: &str, user: Option<&str>) -> Result<EnvironmentState> {
        self.transition(container_id, user, Lifecycle::Resume).await
    }

    pub async fn delete(&self, container_id: &str, user: Option<&str>) -> Result<DeletedEnvironment> {
        let info = self.authorize(container_id, user).await?;
        let runtime = self.runtime()?;
        let discovered_port = info.host_ports.first().copied();

        if let Err(e) = runtime.stop(&info.id, self.settings.stop_grace_seconds).await {
            warn!("Stopping {} before removal failed: {}", container_id, e);
        }
        runtime.remove(&info.id, true).await?;

        let record = self
            .tracker
            .owner_of(&info.id)
            .and_then(|owner| self.tracker.untrack(&owner, &info.id));

        let mut orphaned_port = None;
        match (discovered_port, record.as_ref().map(|r| r.port)) {
            (Some(port), _) => {
                self.ports.release(port);
            }
            (None, Some(port)) => {
                warn!(
                    "Could not discover the host port of {}, keeping port {} as orphaned",
                    container_id, port
                );
                self.ports.orphan(port);
                orphaned_port = Some(port);
            }
            (None, None) => debug!("No host port known for {}", container_id),
        }

        info!("Deleted environment {}", container_id);
        Ok(DeletedEnvironment {
            container_id: info.id,
            released_port: discovered_port,
            orphaned_port,
        })
    }

    /// Removes managed containers stuck in `created`.
    pub async fn cleanup(&self) -> Result<CleanupReport> {
        let runtime = self.runtime()?;
        let stale = runtime.list_managed(Some(ContainerStatus::Created)).await?;
        let mut report = CleanupReport::default();

        for info in stale {
            match runtime.remove(&info.id, true).await {
                Ok(()) => {
                    if let Some(port) = info.host_port() {
                        self.ports.release(port);
                    }
                    if let Some(owner) = self.tracker.owner_of(&info.id) {
                        self.tracker.untrack(&owner, &info.id);
                    }
                    info!("Cleaned up stale container {}", info.name);
                    report.removed.push(info.id);
                }
                Err(e) => {
                    warn!("Failed to clean up {}: {}", info.name, e);
                    report.failed.push(info.id);
                }
            }
        }
        Ok(report)
    }

    /// Brings the tracker and port reservations in line with what the
    /// runtime reports.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let runtime = self.runtime()?;
        let listed_at = Utc::now();
        let managed = runtime.list_managed(None).await?;
        let mut report = ReconcileReport::default();

        let live: HashSet<&str> = managed.iter().map(|info| info.id.as_str()).collect();
        for info in &managed {
            if self.tracker.record(&info.id).is_some() {
                if let Some(state) = state_from_status(info.status) {
                    self.tracker.set_state(&info.id, state);
                }
                continue;
            }
            match adopted_record(info) {
                Some(record) => {
                    self.ports.reserve(record.port);
                    info!("Adopted environment {} for user {}", info.name, record.user_id);
                    report.adopted.push(record.container_id.clone());
                    self.tracker.track(record);
                }
                None => warn!("Managed container {} has incomplete labels, not adopting", info.name),
            }
        }

        for record in self.tracker.all() {
            // Registered after the listing; the runtime view is older than the record.
            if record.created_at > listed_at || live.contains(record.container_id.as_str()) {
                continue;
            }
            self.tracker.untrack(&record.user_id, &record.container_id);
            self.ports.release(record.port);
            info!("Dropped vanished environment {}", record.container_id);
            report.dropped.push(record.container_id);
        }

        let bound = runtime.bound_ports().await?;
        report.released_ports = self.ports.release_orphans(&bound);

        if !report.adopted.is_empty() || !report.dropped.is_empty() || !report.released_ports.is_empty() {
            info!(
                "Reconciled: {} adopted, {} dropped, {} ports released",
                report.adopted.len(),
                report.dropped.len(),
                report.released_ports.len()
            );
        }
        Ok(report)
    }

    pub async fn usage(&self, user: &str) -> Result<UserUsage> {
        let runtime = self.runtime()?;
        let records = self.tracker.environments(user);
        let gpus = self.metrics.gpus().await;
        Ok(usage::aggregate(runtime.as_ref(), &records, mean_utilization(&gpus)).await)
    }

    pub fn check_runtime(&self, container_id: &str, tier: Option<QuotaTier>) -> Result<RuntimeReport> {
        let record = self
            .tracker
            .record(container_id)
            .ok_or_else(|| LabError::NotFound(container_id.to_string()))?;
        let tier = tier.unwrap_or_else(|| self.tracker.tier_of(&record.user_id));
        let elapsed = quota::check_runtime(&record, tier, Utc::now())?;
        Ok(RuntimeReport {
            container_id: record.container_id,
            tier,
            elapsed_hours: elapsed.num_seconds() as f64 / 3600.0,
            limit_hours: tier.limits().max_runtime_hours,
        })
    }

    pub async fn install_packages(
        &self,
        container_id: &str,
        user: Option<&str>,
        packages: Vec<String>,
    ) -> Result<String> {
        let info = self.authorize(container_id, user).await?;
        require_status(&info, container_id, ContainerStatus::Running)?;
        self.pip_install(&info.id, packages).await
    }

    async fn pip_install(&self, container_id: &str, packages: Vec<String>) -> Result<String> {
        let packages: Vec<String> = packages
            .into_iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        if packages.is_empty() {
            return Ok(String::new());
        }

        info!("Installing {:?} in {}", packages, container_id);
        let mut cmd = vec!["pip".to_string(), "install".to_string(), "--quiet".to_string()];
        cmd.extend(packages);
        Ok(self.runtime()?.exec(container_id, cmd).await?)
    }

    pub async fn access(&self, container_id: &str) -> Result<AccessInfo> {
        let info = self.authorize(container_id, None).await?;
        let record = self.tracker.record(&info.id);

        let env_type = record
            .as_ref()
            .map(|r| r.env_type)
            .or_else(|| info.label(LABEL_ENV_TYPE).and_then(|t| t.parse().ok()));
        let port = info.host_port().or_else(|| record.as_ref().map(|r| r.port));
        let access_url = env_type.zip(port).map(|(t, p)| self.access_url(t, p));

        Ok(AccessInfo {
            container_id: info.id,
            status: info.status,
            env_type,
            port,
            access_url,
        })
    }

    pub fn list(&self, user: Option<&str>) -> Vec<EnvironmentRecord> {
        match user {
            Some(user) => self.tracker.environments(user),
            None => self.tracker.all(),
        }
    }

    pub async fn availability(&self) -> ResourceAvailability {
        let gpus = if self.settings.enable_gpus {
            self.metrics.gpus().await
        } else {
            Vec::new()
        };
        let allocated_gpus = self.tracker.allocated_gpus();
        ResourceAvailability {
            runtime_available: self.runtime_available(),
            total_memory_gb: self.metrics.total_memory_gb().await,
            available_memory_gb: self.metrics.available_memory_gb().await,
            cpu_count: self.metrics.cpu_count().await,
            cpu_usage_percent: self.metrics.cpu_usage_percent().await,
            free_gpus: (gpus.len() as u32).saturating_sub(allocated_gpus),
            gpus,
            allocated_gpus,
            reserved_ports: self.ports.reserved(),
            orphaned_ports: self.ports.orphaned(),
        }
    }

    pub async fn backup(&self, user: &str) -> Result<PathBuf> {
        self.storage.backup_user(user).await
    }
}

fn require_status(info: &ContainerInfo, container_id: &str, expected: ContainerStatus) -> Result<()> {
    if info.status != expected {
        return Err(LabError::InvalidState {
            container: container_id.to_string(),
            expected,
            actual: info.status,
        });
    }
    Ok(())
}

fn state_from_status(status: ContainerStatus) -> Option<EnvironmentState> {
    match status {
        ContainerStatus::Running | ContainerStatus::Restarting => Some(EnvironmentState::Running),
        ContainerStatus::Paused => Some(EnvironmentState::Paused),
        ContainerStatus::Exited | ContainerStatus::Dead => Some(EnvironmentState::Stopped),
        ContainerStatus::Created => Some(EnvironmentState::Creating),
        ContainerStatus::Removing | ContainerStatus::Unknown => None,
    }
}

/// Rebuilds a record from the labels written at creation.
fn adopted_record(info: &ContainerInfo) -> Option<EnvironmentRecord> {
    let user_id = info.label(LABEL_USER)?.to_string();
    let env_type: EnvironmentType = info.label(LABEL_ENV_TYPE)?.parse().ok()?;
    let port = info.host_port()?;
    let number = |key: &str| info.label(key).and_then(|v| v.parse::<u32>().ok()).unwrap_or(0);
    let created_at = info
        .label(LABEL_CREATED_AT)
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.with_timezone(&Utc))
        .or(info.created_at)
        .unwrap_or_else(Utc::now);

    Some(EnvironmentRecord {
        container_id: info.id.clone(),
        name: info.name.clone(),
        user_id,
        env_type,
        port,
        gpus: number(LABEL_GPUS),
        memory_gb: number(LABEL_MEMORY_GB),
        cpu_cores: number(LABEL_CPU_CORES),
        created_at,
        state: state_from_status(info.status).unwrap_or(EnvironmentState::Failed),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::fake::{FakeMetrics, FakeRuntime};

    struct Harness {
        manager: Arc<EnvironmentManager>,
        runtime: Arc<FakeRuntime>,
        _root: tempfile::TempDir,
    }

    fn settings() -> ManagerSettings {
        ManagerSettings {
            start_port: 8888,
            max_attempts: 100,
            probe_bind: false,
            public_host: "lab.example.org".to_string(),
            network: None,
            stop_grace_seconds: 1,
            enable_gpus: true,
        }
    }

    fn harness_with(metrics: FakeMetrics) -> Harness {
        let root = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        let manager = EnvironmentManager::new(
            Some(runtime.clone() as Arc<dyn ContainerRuntime>),
            Arc::new(metrics),
            WorkspaceStorage::new(root.path()),
            settings(),
        );
        Harness {
            manager: Arc::new(manager),
            runtime,
            _root: root,
        }
    }

    fn harness() -> Harness {
        harness_with(FakeMetrics::default())
    }

    fn request(user: &str) -> CreateEnvironment {
        CreateEnvironment {
            user_id: user.to_string(),
            env_type: "pytorch-jupyter".to_string(),
            quota: "default".to_string(),
            ..Default::default()
        }
    }

    fn managed_labels(user: &str, env_type: &str, port: u16) -> HashMap<String, String> {
        HashMap::from([
            (LABEL_MANAGED.to_string(), "true".to_string()),
            (LABEL_USER.to_string(), user.to_string()),
            (LABEL_ENV_TYPE.to_string(), env_type.to_string()),
            (LABEL_PORT.to_string(), port.to_string()),
            (LABEL_GPUS.to_string(), "1".to_string()),
        ])
    }

    #[tokio::test]
    async fn test_quota_end_to_end() {
        let h = harness();

        let first = h.manager.create(request("alice")).await.unwrap();
        let second = h.manager.create(request("alice")).await.unwrap();
        assert_ne!(first.port, second.port);
        assert_eq!(first.access_url, format!("http://lab.example.org:{}/lab", first.port));
        assert_eq!(first.state, EnvironmentState::Running);

        assert!(matches!(
            h.manager.create(request("alice")).await,
            Err(LabError::QuotaExceeded { resource: "environments", limit: 2, current: 2 })
        ));
        assert_eq!(h.manager.ports().reserved().len(), 2);

        h.manager.delete(&first.container_id, Some("alice")).await.unwrap();
        assert!(!h.manager.ports().is_reserved(first.port));
        h.manager.create(request("alice")).await.unwrap();
        assert_eq!(h.manager.list(Some("alice")).len(), 2);
    }

    #[tokio::test]
    async fn test_container_spec_carries_limits_and_mounts() {
        let h = harness();
        let mut req = request("test@ailab.com");
        req.env_type = "vscode".to_string();
        req.memory_gb = Some(4);
        req.cpu_cores = Some(1);
        let created = h.manager.create(req).await.unwrap();

        assert!(created.name.starts_with("ai-lab-vscode-test_at_ailab_com-"));
        assert_eq!(created.access_url, format!("http://lab.example.org:{}", created.port));

        let spec = h.runtime.last_spec().unwrap();
        assert_eq!(spec.container_port, 8080);
        assert_eq!(spec.memory_bytes, 4 * 1024 * 1024 * 1024);
        assert_eq!(spec.nano_cpus, 1_000_000_000);
        assert_eq!(spec.gpus, 0);
        assert!(spec.binds[0].ends_with("test_at_ailab_com:/home/coder/project:rw"));
        assert!(spec.binds[1].ends_with("shared:/home/coder/shared:ro"));
        assert_eq!(spec.labels.get(LABEL_USER).map(String::as_str), Some("test@ailab.com"));
        assert!(spec.env.contains(&"USER_QUOTA=default".to_string()));
    }

    #[tokio::test]
    async fn test_gpu_request_beyond_tier_reserves_nothing() {
        let h = harness();
        let mut req = request("alice");
        req.gpu_count = Some(4);

        assert!(matches!(
            h.manager.create(req.clone()).await,
            Err(LabError::QuotaExceeded { resource: "gpus", limit: 1, current: 4 })
        ));
        assert!(h.manager.ports().reserved().is_empty());
        assert!(h.manager.list(Some("alice")).is_empty());
        assert_eq!(h.runtime.container_count(), 0);

        // Within the enterprise cap but beyond the two host GPUs.
        req.quota = "enterprise".to_string();
        assert!(matches!(
            h.manager.create(req).await,
            Err(LabError::ResourceUnavailable(_))
        ));
        assert_eq!(h.manager.tracker().tier_of("alice"), QuotaTier::Default);

        // The failed attempts did not hold on to a quota slot.
        h.manager.create(request("alice")).await.unwrap();
        h.manager.create(request("alice")).await.unwrap();
    }

    #[tokio::test]
    async fn test_tier_caps_apply_across_environments() {
        let h = harness_with(FakeMetrics {
            gpu_count: 4,
            ..FakeMetrics::default()
        });
        let mut req = request("alice");
        req.gpu_count = Some(1);

        let first = h.manager.create(req.clone()).await.unwrap();
        assert!(matches!(
            h.manager.create(req.clone()).await,
            Err(LabError::QuotaExceeded { resource: "gpus", limit: 1, current: 2 })
        ));
        assert_eq!(h.manager.list(Some("alice")).len(), 1);
        assert_eq!(h.manager.ports().reserved(), vec![first.port]);
        assert_eq!(h.runtime.container_count(), 1);

        let mut big = request("alice");
        big.memory_gb = Some(8);
        assert!(matches!(
            h.manager.create(big).await,
            Err(LabError::QuotaExceeded { resource: "memory_gb", limit: 8, current: 12 })
        ));

        // Other users have their own allowance; deleting frees alice's.
        let mut bob = req.clone();
        bob.user_id = "bob".to_string();
        h.manager.create(bob).await.unwrap();
        h.manager.delete(&first.container_id, Some("alice")).await.unwrap();
        h.manager.create(req).await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_checks() {
        let h = harness_with(FakeMetrics {
            available_memory_gb: 12.0,
            gpu_count: 0,
        });

        let mut req = request("alice");
        req.memory_gb = Some(16);
        assert!(matches!(
            h.manager.create(req.clone()).await,
            Err(LabError::QuotaExceeded { resource: "memory_gb", .. })
        ));

        req.quota = "premium".to_string();
        assert!(matches!(
            h.manager.create(req).await,
            Err(LabError::ResourceUnavailable(_))
        ));

        let mut req = request("alice");
        req.gpu_count = Some(1);
        assert!(matches!(
            h.manager.create(req).await,
            Err(LabError::ResourceUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_validation_order() {
        let h = harness();
        let mut req = request("alice");
        req.env_type = "rstudio".to_string();
        assert!(matches!(
            h.manager.create(req.clone()).await,
            Err(LabError::InvalidEnvironmentType(t)) if t == "rstudio"
        ));

        let offline = EnvironmentManager::new(
            None,
            Arc::new(FakeMetrics::default()),
            WorkspaceStorage::new(h._root.path()),
            settings(),
        );
        assert!(matches!(offline.create(req).await, Err(LabError::RuntimeUnavailable(_))));
        assert!(matches!(
            offline.stop("c0001", None).await,
            Err(LabError::RuntimeUnavailable(_))
        ));

        let mut req = request("alice");
        req.quota = "gold".to_string();
        assert!(matches!(h.manager.create(req).await, Err(LabError::InvalidQuota(_))));
    }

    #[tokio::test]
    async fn test_delete_twice_is_not_found() {
        let h = harness();
        let created = h.manager.create(request("alice")).await.unwrap();

        let deleted = h.manager.delete(&created.container_id, None).await.unwrap();
        assert_eq!(deleted.released_port, Some(created.port));
        assert!(matches!(
            h.manager.delete(&created.container_id, None).await,
            Err(LabError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_create_releases_port() {
        let h = harness();
        h.runtime.fail_next_create("image ai-lab-jupyter not found");

        assert!(matches!(
            h.manager.create(request("alice")).await,
            Err(LabError::RuntimeOperationFailed(_))
        ));
        assert!(h.manager.ports().reserved().is_empty());
        assert!(h.manager.list(Some("alice")).is_empty());

        let created = h.manager.create(request("alice")).await.unwrap();
        assert_eq!(created.port, 8888);
    }

    #[tokio::test]
    async fn test_skips_ports_bound_by_runtime() {
        let h = harness();
        h.runtime.add_external_port(8888);
        h.runtime.add_external_port(8889);

        let created = h.manager.create(request("alice")).await.unwrap();
        assert_eq!(created.port, 8890);
    }

    #[tokio::test]
    async fn test_remove_failure_is_returned() {
        let h = harness();
        let created = h.manager.create(request("alice")).await.unwrap();
        h.runtime.fail_remove(true);

        assert!(matches!(
            h.manager.delete(&created.container_id, Some("alice")).await,
            Err(LabError::RuntimeOperationFailed(_))
        ));
        assert!(h.manager.tracker().owns("alice", &created.container_id));
        assert!(h.manager.ports().is_reserved(created.port));
    }

    #[tokio::test]
    async fn test_stop_failure_does_not_block_delete() {
        let h = harness();
        let created = h.manager.create(request("alice")).await.unwrap();
        h.runtime.fail_stop(true);

        h.manager.delete(&created.container_id, Some("alice")).await.unwrap();
        assert_eq!(h.runtime.container_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_creates_at_boundary() {
        let h = harness();
        h.manager.create(request("alice")).await.unwrap();

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let manager = h.manager.clone();
                tokio::spawn(async move { manager.create(request("alice")).await })
            })
            .collect();

        let mut succeeded = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => succeeded += 1,
                Err(LabError::QuotaExceeded { .. }) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(succeeded, 1);
        assert_eq!(h.manager.list(Some("alice")).len(), 2);
        assert_eq!(h.manager.ports().reserved().len(), 2);
    }

    #[tokio::test]
    async fn test_pause_resume_state_checks() {
        let h = harness();
        let id = h.manager.create(request("alice")).await.unwrap().container_id;

        assert!(matches!(
            h.manager.resume(&id, Some("alice")).await,
            Err(LabError::InvalidState { expected: ContainerStatus::Paused, actual: ContainerStatus::Running, .. })
        ));
        assert_eq!(h.manager.pause(&id, Some("alice")).await.unwrap(), EnvironmentState::Paused);
        assert_eq!(h.runtime.status_of(&id), Some(ContainerStatus::Paused));
        assert_eq!(h.manager.resume(&id, Some("alice")).await.unwrap(), EnvironmentState::Running);

        h.manager.stop(&id, Some("alice")).await.unwrap();
        assert_eq!(h.manager.tracker().record(&id).unwrap().state, EnvironmentState::Stopped);
        assert!(matches!(
            h.manager.pause(&id, Some("alice")).await,
            Err(LabError::InvalidState { actual: ContainerStatus::Exited, .. })
        ));
        h.manager.start(&id, Some("alice")).await.unwrap();
        h.manager.restart(&id, None).await.unwrap();
        assert_eq!(h.runtime.status_of(&id), Some(ContainerStatus::Running));
    }

    #[tokio::test]
    async fn test_access_denied_for_other_user() {
        let h = harness();
        let id = h.manager.create(request("alice")).await.unwrap().container_id;

        assert!(matches!(
            h.manager.stop(&id, Some("bob")).await,
            Err(LabError::AccessDenied { .. })
        ));
        assert!(matches!(
            h.manager.delete(&id, Some("bob")).await,
            Err(LabError::AccessDenied { .. })
        ));
        assert_eq!(h.runtime.status_of(&id), Some(ContainerStatus::Running));
        assert!(matches!(
            h.manager.stop("missing", Some("alice")).await,
            Err(LabError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_created() {
        let h = harness();
        let running = h.manager.create(request("alice")).await.unwrap();
        let stale = h.runtime.insert_labelled(
            "ai-lab-vscode-bob-deadbeef",
            ContainerStatus::Created,
            9000,
            managed_labels("bob", "vscode", 9000),
        );
        h.runtime.insert_container("unrelated", ContainerStatus::Created, 9001);
        h.manager.ports().reserve(9000);

        let report = h.manager.cleanup().await.unwrap();
        assert_eq!(report.removed, vec![stale.clone()]);
        assert!(report.failed.is_empty());
        assert!(!h.manager.ports().is_reserved(9000));
        assert_eq!(h.runtime.status_of(&stale), None);
        assert_eq!(h.runtime.status_of(&running.container_id), Some(ContainerStatus::Running));
        assert_eq!(h.runtime.container_count(), 2);
    }

    #[tokio::test]
    async fn test_orphaned_port_released_by_reconcile() {
        let h = harness();
        let created = h.manager.create(request("alice")).await.unwrap();
        h.runtime.clear_ports(&created.container_id);

        let deleted = h.manager.delete(&created.container_id, Some("alice")).await.unwrap();
        assert_eq!(deleted.released_port, None);
        assert_eq!(deleted.orphaned_port, Some(created.port));
        assert_eq!(h.manager.ports().orphaned(), vec![created.port]);
        assert!(h.manager.list(Some("alice")).is_empty());

        let report = h.manager.reconcile().await.unwrap();
        assert_eq!(report.released_ports, vec![created.port]);
        assert!(!h.manager.ports().is_reserved(created.port));
    }

    #[tokio::test]
    async fn test_reconcile_adopts_and_drops() {
        let h = harness();
        let adopted = h.runtime.insert_labelled(
            "ai-lab-pytorch-jupyter-carol-1234abcd",
            ContainerStatus::Running,
            9100,
            managed_labels("carol", "pytorch-jupyter", 9100),
        );
        h.runtime.insert_labelled(
            "ai-lab-broken",
            ContainerStatus::Running,
            9101,
            HashMap::from([(LABEL_MANAGED.to_string(), "true".to_string())]),
        );
        let vanished = h.manager.create(request("alice")).await.unwrap();
        h.runtime.vanish(&vanished.container_id);

        let report = h.manager.reconcile().await.unwrap();
        assert_eq!(report.adopted, vec![adopted.clone()]);
        assert_eq!(report.dropped, vec![vanished.container_id.clone()]);

        assert!(h.manager.tracker().owns("carol", &adopted));
        assert_eq!(h.manager.tracker().record(&adopted).unwrap().gpus, 1);
        assert!(h.manager.ports().is_reserved(9100));
        assert!(!h.manager.ports().is_reserved(vanished.port));
        assert!(h.manager.list(Some("alice")).is_empty());

        let again = h.manager.reconcile().await.unwrap();
        assert!(again.adopted.is_empty() && again.dropped.is_empty());
    }

    #[tokio::test]
    async fn test_template_clamps_and_installs() {
        let h = harness();
        let result = h
            .manager
            .create_from_template("alice", "pytorch-basic", "default")
            .await
            .unwrap();

        assert_eq!(result.template, Template::PytorchBasic);
        assert_eq!(result.environment.gpus, 1);
        assert_eq!(result.environment.memory_gb, 8);
        assert!(result.packages_installed);

        let execs = h.runtime.execs();
        assert_eq!(execs.len(), 1);
        assert_eq!(execs[0].1[..3], ["pip", "install", "--quiet"]);
        assert!(execs[0].1.contains(&"transformers".to_string()));

        assert!(matches!(
            h.manager.create_from_template("alice", "pytorch-advanced", "default").await,
            Err(LabError::InvalidTemplate(_))
        ));
    }

    #[tokio::test]
    async fn test_install_requires_running() {
        let h = harness();
        let id = h.manager.create(request("alice")).await.unwrap().container_id;
        let output = h
            .manager
            .install_packages(&id, Some("alice"), vec!["numpy".to_string()])
            .await
            .unwrap();
        assert_eq!(output, "Successfully installed");

        h.manager.stop(&id, None).await.unwrap();
        assert!(matches!(
            h.manager.install_packages(&id, Some("alice"), vec!["numpy".to_string()]).await,
            Err(LabError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_access_and_runtime_report() {
        let h = harness();
        let created = h.manager.create(request("alice")).await.unwrap();

        let access = h.manager.access(&created.container_id).await.unwrap();
        assert_eq!(access.status, ContainerStatus::Running);
        assert_eq!(access.env_type, Some(EnvironmentType::PytorchJupyter));
        assert_eq!(access.access_url.as_deref(), Some(created.access_url.as_str()));

        let report = h.manager.check_runtime(&created.container_id, None).unwrap();
        assert_eq!(report.tier, QuotaTier::Default);
        assert_eq!(report.limit_hours, 8);
        assert!(matches!(h.manager.check_runtime("missing", None), Err(LabError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_usage_and_availability() {
        let h = harness();
        let mut req = request("alice");
        req.gpu_count = Some(1);
        h.manager.create(req).await.unwrap();

        let usage = h.manager.usage("alice").await.unwrap();
        assert_eq!(usage.environments, 1);
        assert_eq!(usage.running, 1);
        assert_eq!(usage.total_gpus, 1);
        assert_eq!(usage.host_gpu_utilization, Some(10.0));

        let availability = h.manager.availability().await;
        assert!(availability.runtime_available);
        assert_eq!(availability.allocated_gpus, 1);
        assert_eq!(availability.free_gpus, 1);
        assert_eq!(availability.reserved_ports, vec![8888]);
    }
}
