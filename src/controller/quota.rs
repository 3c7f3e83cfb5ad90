use std::ops::{Add, Sub};

use chrono::{DateTime, Duration, Utc};

use super::error::{LabError, Result};
use crate::shared::models::{EnvironmentRecord, QuotaTier};

/// Rejects a new environment when the user already holds `max_environments`.
pub fn check_quota(current: usize, tier: QuotaTier) -> Result<()> {
    let limit = tier.limits().max_environments;
    if current as u64 >= u64::from(limit) {
        return Err(LabError::QuotaExceeded {
            resource: "environments",
            limit: u64::from(limit),
            current: current as u64,
        });
    }
    Ok(())
}

/// Resources one environment holds against its owner's tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceClaim {
    pub gpus: u32,
    pub memory_gb: u32,
    pub cpu_cores: u32,
}

impl ResourceClaim {
    pub fn of(record: &EnvironmentRecord) -> Self {
        Self {
            gpus: record.gpus,
            memory_gb: record.memory_gb,
            cpu_cores: record.cpu_cores,
        }
    }
}

impl Add for ResourceClaim {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            gpus: self.gpus.saturating_add(other.gpus),
            memory_gb: self.memory_gb.saturating_add(other.memory_gb),
            cpu_cores: self.cpu_cores.saturating_add(other.cpu_cores),
        }
    }
}

impl Sub for ResourceClaim {
    type Output = Self;

    fn sub(self, other: Self) -> Self {
        Self {
            gpus: self.gpus.saturating_sub(other.gpus),
            memory_gb: self.memory_gb.saturating_sub(other.memory_gb),
            cpu_cores: self.cpu_cores.saturating_sub(other.cpu_cores),
        }
    }
}

/// Tier caps apply to everything a user holds: `held` plus the new request
/// may not pass the tier's GPU, memory or CPU limit.
pub fn check_resource_caps(
    held: ResourceClaim,
    requested: ResourceClaim,
    tier: QuotaTier,
) -> Result<()> {
    let limits = tier.limits();
    let total = held + requested;
    let checks = [
        ("gpus", total.gpus, limits.max_gpus),
        ("memory_gb", total.memory_gb, limits.max_memory_gb),
        ("cpu_cores", total.cpu_cores, limits.max_cpu_cores),
    ];
    for (resource, current, limit) in checks {
        if current > limit {
            return Err(LabError::QuotaExceeded {
                resource,
                limit: u64::from(limit),
                current: u64::from(current),
            });
        }
    }
    Ok(())
}

/// Advisory runtime check. Returns the elapsed time when still within limits.
pub fn check_runtime(record: &EnvironmentRecord, tier: QuotaTier, now: DateTime<Utc>) -> Result<Duration> {
    let elapsed = now.signed_duration_since(record.created_at);
    let limit_hours = tier.limits().max_runtime_hours;
    if elapsed > Duration::hours(i64::from(limit_hours)) {
        return Err(LabError::RuntimeExceeded {
            container: record.container_id.clone(),
            limit_hours,
            elapsed_hours: elapsed.num_seconds() as f64 / 3600.0,
        });
    }
    Ok(elapsed)
}
