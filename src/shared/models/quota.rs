use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::{KeyKind, ParseKeyError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaTier {
    #[default]
    Default,
    Premium,
    Enterprise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaLimits {
    pub max_gpus: u32,
    pub max_memory_gb: u32,
    pub max_cpu_cores: u32,
    pub max_storage_gb: u32,
    pub max_environments: u32,
    pub max_runtime_hours: u32,
    pub priority: u8,
}

impl QuotaTier {
    pub const ALL: [QuotaTier; 3] = [QuotaTier::Default, QuotaTier::Premium, QuotaTier::Enterprise];

    pub const fn limits(self) -> QuotaLimits {
        match self {
            QuotaTier::Default => QuotaLimits {
                max_gpus: 1,
                max_memory_gb: 8,
                max_cpu_cores: 2,
                max_storage_gb: 50,
                max_environments: 2,
                max_runtime_hours: 8,
                priority: 1,
            },
            QuotaTier::Premium => QuotaLimits {
                max_gpus: 2,
                max_memory_gb: 16,
                max_cpu_cores: 4,
                max_storage_gb: 200,
                max_environments: 5,
                max_runtime_hours: 24,
                priority: 2,
            },
            QuotaTier::Enterprise => QuotaLimits {
                max_gpus: 4,
                max_memory_gb: 32,
                max_cpu_cores: 8,
                max_storage_gb: 1000,
                max_environments: 10,
                max_runtime_hours: 72,
                priority: 3,
            },
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QuotaTier::Default => "default",
            QuotaTier::Premium => "premium",
            QuotaTier::Enterprise => "enterprise",
        }
    }
}

impl fmt::Display for QuotaTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuotaTier {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim();
        QuotaTier::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(key))
            .ok_or_else(|| ParseKeyError::new(KeyKind::QuotaTier, s))
    }
}
