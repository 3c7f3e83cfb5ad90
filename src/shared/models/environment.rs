use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{KeyKind, ParseKeyError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvironmentType {
    PytorchJupyter,
    TensorflowJupyter,
    Vscode,
    MultiGpu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentKind {
    Jupyter,
    Vscode,
}

/// Static launch parameters for one environment type.
#[derive(Debug, Serialize)]
pub struct EnvironmentProfile {
    pub key: &'static str,
    pub display_name: &'static str,
    pub image: &'static str,
    pub container_port: u16,
    pub kind: EnvironmentKind,
    pub default_gpus: u32,
    pub workspace_path: &'static str,
    pub shared_path: &'static str,
}

const PYTORCH_JUPYTER: EnvironmentProfile = EnvironmentProfile {
    key: "pytorch-jupyter",
    display_name: "PyTorch + JupyterLab",
    image: "ai-lab-jupyter",
    container_port: 8888,
    kind: EnvironmentKind::Jupyter,
    default_gpus: 0,
    workspace_path: "/home/jovyan/work",
    shared_path: "/home/jovyan/shared",
};

const TENSORFLOW_JUPYTER: EnvironmentProfile = EnvironmentProfile {
    key: "tensorflow-jupyter",
    display_name: "TensorFlow + JupyterLab",
    image: "ai-lab-jupyter",
    container_port: 8888,
    kind: EnvironmentKind::Jupyter,
    default_gpus: 0,
    workspace_path: "/home/jovyan/work",
    shared_path: "/home/jovyan/shared",
};

const VSCODE: EnvironmentProfile = EnvironmentProfile {
    key: "vscode",
    display_name: "VS Code Development",
    image: "ai-lab-vscode",
    container_port: 8080,
    kind: EnvironmentKind::Vscode,
    default_gpus: 0,
    workspace_path: "/home/coder/project",
    shared_path: "/home/coder/shared",
};

const MULTI_GPU: EnvironmentProfile = EnvironmentProfile {
    key: "multi-gpu",
    display_name: "Multi-GPU Training",
    image: "ai-lab-jupyter",
    container_port: 8888,
    kind: EnvironmentKind::Jupyter,
    default_gpus: 2,
    workspace_path: "/home/jovyan/work",
    shared_path: "/home/jovyan/shared",
};

impl EnvironmentType {
    pub const ALL: [EnvironmentType; 4] = [
        EnvironmentType::PytorchJupyter,
        EnvironmentType::TensorflowJupyter,
        EnvironmentType::Vscode,
        EnvironmentType::MultiGpu,
    ];

    pub fn profile(self) -> &'static EnvironmentProfile {
        match self {
            EnvironmentType::PytorchJupyter => &PYTORCH_JUPYTER,
            EnvironmentType::TensorflowJupyter => &TENSORFLOW_JUPYTER,
            EnvironmentType::Vscode => &VSCODE,
            EnvironmentType::MultiGpu => &MULTI_GPU,
        }
    }

    pub fn as_str(self) -> &'static str {
        self.profile().key
    }

    /// Path appended to `http://host:port` when handing out the access URL.
    pub fn access_path(self) -> &'static str {
        match self.profile().kind {
            EnvironmentKind::Jupyter => "/lab",
            EnvironmentKind::Vscode => "",
        }
    }
}

impl fmt::Display for EnvironmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnvironmentType {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim();
        EnvironmentType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(key))
            .ok_or_else(|| ParseKeyError::new(KeyKind::EnvironmentType, s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Template {
    PytorchBasic,
    TensorflowBasic,
    VscodeDev,
    MultiGpuTraining,
}

#[derive(Debug, Serialize)]
pub struct TemplateProfile {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub environment_type: EnvironmentType,
    pub recommended_gpus: u32,
    pub recommended_memory_gb: u32,
    pub pip_packages: &'static [&'static str],
}

const PYTORCH_BASIC: TemplateProfile = TemplateProfile {
    id: "pytorch-basic",
    name: "PyTorch + JupyterLab",
    description: "Pre-configured PyTorch environment with JupyterLab",
    environment_type: EnvironmentType::PytorchJupyter,
    recommended_gpus: 1,
    recommended_memory_gb: 16,
    pip_packages: &["transformers", "datasets", "tensorboard"],
};

const TENSORFLOW_BASIC: TemplateProfile = TemplateProfile {
    id: "tensorflow-basic",
    name: "TensorFlow + JupyterLab",
    description: "Pre-configured TensorFlow environment with JupyterLab",
    environment_type: EnvironmentType::TensorflowJupyter,
    recommended_gpus: 1,
    recommended_memory_gb: 16,
    pip_packages: &["tensorflow-datasets", "tensorboard"],
};

const VSCODE_DEV: TemplateProfile = TemplateProfile {
    id: "vscode-dev",
    name: "VS Code Development",
    description: "Full development environment with VS Code Server",
    environment_type: EnvironmentType::Vscode,
    recommended_gpus: 1,
    recommended_memory_gb: 8,
    pip_packages: &["black", "flake8", "pytest"],
};

const MULTI_GPU_TRAINING: TemplateProfile = TemplateProfile {
    id: "multi-gpu-training",
    name: "Multi-GPU Training",
    description: "Optimized for distributed training with multiple GPUs",
    environment_type: EnvironmentType::MultiGpu,
    recommended_gpus: 4,
    recommended_memory_gb: 32,
    pip_packages: &["accelerate", "deepspeed", "transformers"],
};

impl Template {
    pub const ALL: [Template; 4] = [
        Template::PytorchBasic,
        Template::TensorflowBasic,
        Template::VscodeDev,
        Template::MultiGpuTraining,
    ];

    pub fn profile(self) -> &'static TemplateProfile {
        match self {
            Template::PytorchBasic => &PYTORCH_BASIC,
            Template::TensorflowBasic => &TENSORFLOW_BASIC,
            Template::VscodeDev => &VSCODE_DEV,
            Template::MultiGpuTraining => &MULTI_GPU_TRAINING,
        }
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.profile().id)
    }
}

impl FromStr for Template {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim();
        Template::ALL
            .into_iter()
            .find(|t| t.profile().id.eq_ignore_ascii_case(key))
            .ok_or_else(|| ParseKeyError::new(KeyKind::Template, s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentState {
    Creating,
    Starting,
    Running,
    Paused,
    Stopping,
    Stopped,
    Deleted,
    Failed,
}

impl fmt::Display for EnvironmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EnvironmentState::Creating => "creating",
            EnvironmentState::Starting => "starting",
            EnvironmentState::Running => "running",
            EnvironmentState::Paused => "paused",
            EnvironmentState::Stopping => "stopping",
            EnvironmentState::Stopped => "stopped",
            EnvironmentState::Deleted => "deleted",
            EnvironmentState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One tracked environment, owned by exactly one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentRecord {
    pub container_id: String,
    pub name: String,
    pub user_id: String,
    pub env_type: EnvironmentType,
    pub port: u16,
    pub gpus: u32,
    pub memory_gb: u32,
    pub cpu_cores: u32,
    pub created_at: DateTime<Utc>,
    pub state: EnvironmentState,
}
