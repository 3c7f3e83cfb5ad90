use thiserror::Error;

use super::runtime::{ContainerStatus, RuntimeError};
use crate::shared::models::{KeyKind, ParseKeyError};

#[derive(Error, Debug)]
pub enum LabError {
    #[error("Docker not available: {0}")]
    RuntimeUnavailable(String),

    #[error("Environment {0} not found")]
    NotFound(String),

    #[error("User {user} does not own environment {container}")]
    AccessDenied { user: String, container: String },

    #[error("Quota exceeded for {resource}: limit {limit}, current {current}")]
    QuotaExceeded {
        resource: &'static str,
        limit: u64,
        current: u64,
    },

    #[error("Environment {container} exceeded its runtime limit of {limit_hours}h (running {elapsed_hours:.1}h)")]
    RuntimeExceeded {
        container: String,
        limit_hours: u32,
        elapsed_hours: f64,
    },

    #[error("Insufficient resources: {0}")]
    ResourceUnavailable(String),

    #[error("No free port in range {start}-{end}")]
    PortExhausted { start: u16, end: u32 },

    #[error("Invalid environment type: {0}")]
    InvalidEnvironmentType(String),

    #[error("Invalid template: {0}")]
    InvalidTemplate(String),

    #[error("Invalid quota tier: {0}")]
    InvalidQuota(String),

    #[error("Environment {container} is {actual}, expected {expected}")]
    InvalidState {
        container: String,
        expected: ContainerStatus,
        actual: ContainerStatus,
    },

    #[error("{0}")]
    RuntimeOperationFailed(String),

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LabError>;

impl From<RuntimeError> for LabError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Unavailable(msg) => LabError::RuntimeUnavailable(msg),
            RuntimeError::NotFound(id) => LabError::NotFound(id),
            RuntimeError::Other(msg) => LabError::RuntimeOperationFailed(msg),
        }
    }
}

impl From<ParseKeyError> for LabError {
    fn from(err: ParseKeyError) -> Self {
        match err.kind {
            KeyKind::EnvironmentType => LabError::InvalidEnvironmentType(err.value),
            KeyKind::Template => LabError::InvalidTemplate(err.value),
            KeyKind::QuotaTier => LabError::InvalidQuota(err.value),
        }
    }
}
