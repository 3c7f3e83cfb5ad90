use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info};

use super::error::Result;
use super::quota::{self, ResourceClaim};
use crate::shared::models::{EnvironmentRecord, EnvironmentState, QuotaTier};

#[derive(Default)]
struct TrackerState {
    records: HashMap<String, EnvironmentRecord>,
    by_user: HashMap<String, BTreeSet<String>>,
    /// Creations that passed the quota check but have not registered yet.
    pending: HashMap<String, PendingCreates>,
    tiers: HashMap<String, QuotaTier>,
}

#[derive(Debug, Clone, Copy, Default)]
struct PendingCreates {
    count: usize,
    claim: ResourceClaim,
}

impl TrackerState {
    fn live_count(&self, user: &str) -> usize {
        self.by_user.get(user).map_or(0, BTreeSet::len)
    }

    fn pending_for(&self, user: &str) -> PendingCreates {
        self.pending.get(user).copied().unwrap_or_default()
    }

    /// Resources held by the user's tracked environments and pending creates.
    fn held(&self, user: &str) -> ResourceClaim {
        let tracked = self
            .by_user
            .get(user)
            .into_iter()
            .flatten()
            .filter_map(|id| self.records.get(id))
            .fold(ResourceClaim::default(), |sum, r| sum + ResourceClaim::of(r));
        tracked + self.pending_for(user).claim
    }

    fn release_pending(&mut self, user: &str, claim: ResourceClaim) {
        if let Some(pending) = self.pending.get_mut(user) {
            pending.count = pending.count.saturating_sub(1);
            pending.claim = pending.claim - claim;
            if pending.count == 0 {
                self.pending.remove(user);
            }
        }
    }

    fn insert(&mut self, record: EnvironmentRecord) {
        self.by_user
            .entry(record.user_id.clone())
            .or_default()
            .insert(record.container_id.clone());
        self.records.insert(record.container_id.clone(), record);
    }
}

/// Which user owns which environment container, plus each user's tier.
#[derive(Default)]
pub struct OwnershipTracker {
    state: Mutex<TrackerState>,
}

impl OwnershipTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Checks the environment count and the user's GPU/memory/CPU totals
    /// against the tier, then holds a slot for one creation, all in the same
    /// critical section. Concurrent creations for one user therefore cannot
    /// both pass the checks at the boundary.
    pub fn reserve_slot(
        self: &Arc<Self>,
        user: &str,
        tier: QuotaTier,
        claim: ResourceClaim,
    ) -> Result<QuotaSlot> {
        let mut state = self.lock();
        let current = state.live_count(user) + state.pending_for(user).count;
        quota::check_quota(current, tier)?;
        quota::check_resource_caps(state.held(user), claim, tier)?;

        let pending = state.pending.entry(user.to_string()).or_default();
        pending.count += 1;
        pending.claim = pending.claim + claim;
        debug!("Reserved quota slot for {} ({}/{})", user, current + 1, tier.limits().max_environments);

        Ok(QuotaSlot {
            tracker: Arc::clone(self),
            user: user.to_string(),
            tier,
            claim,
            committed: false,
        })
    }

    pub fn track(&self, record: EnvironmentRecord) {
        info!("Tracking environment {} for user {}", record.container_id, record.user_id);
        self.lock().insert(record);
    }

    /// Removes the matching record. A missing record is treated as already gone.
    pub fn untrack(&self, user: &str, container_id: &str) -> Option<EnvironmentRecord> {
        let mut state = self.lock();
        let owned = state
            .records
            .get(container_id)
            .is_some_and(|r| r.user_id == user);
        if !owned {
            debug!("No record of {} owning {}, nothing to untrack", user, container_id);
            return None;
        }

        let record = state.records.remove(container_id);
        if let Some(ids) = state.by_user.get_mut(user) {
            ids.remove(container_id);
            if ids.is_empty() {
                state.by_user.remove(user);
            }
        }
        info!("Untracked environment {} for user {}", container_id, user);
        record
    }

    pub fn owns(&self, user: &str, container_id: &str) -> bool {
        self.lock()
            .by_user
            .get(user)
            .is_some_and(|ids| ids.contains(container_id))
    }

    pub fn owner_of(&self, container_id: &str) -> Option<String> {
        self.lock().records.get(container_id).map(|r| r.user_id.clone())
    }

    pub fn record(&self, container_id: &str) -> Option<EnvironmentRecord> {
        self.lock().records.get(container_id).cloned()
    }

    pub fn environments(&self, user: &str) -> Vec<EnvironmentRecord> {
        let state = self.lock();
        state
            .by_user
            .get(user)
            .map(|ids| ids.iter().filter_map(|id| state.records.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    pub fn all(&self) -> Vec<EnvironmentRecord> {
        let mut records: Vec<_> = self.lock().records.values().cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        records
    }

    pub fn set_state(&self, container_id: &str, new_state: EnvironmentState) {
        if let Some(record) = self.lock().records.get_mut(container_id) {
            record.state = new_state;
        }
    }

    /// GPUs handed to tracked environments that are not stopped.
    pub fn allocated_gpus(&self) -> u32 {
        self.lock()
            .records
            .values()
            .filter(|r| {
                !matches!(
                    r.state,
                    EnvironmentState::Stopped | EnvironmentState::Deleted | EnvironmentState::Failed
                )
            })
            .map(|r| r.gpus)
            .sum()
    }

    pub fn tier_of(&self, user: &str) -> QuotaTier {
        self.lock().tiers.get(user).copied().unwrap_or_default()
    }
}

/// A held place in a user's environment quota. Commit it with the new
/// record once the container is up; dropping it gives the place back.
pub struct QuotaSlot {
    tracker: Arc<OwnershipTracker>,
    user: String,
    tier: QuotaTier,
    claim: ResourceClaim,
    committed: bool,
}

impl QuotaSlot {
    /// Tracks the record and records the request's tier as the user's tier.
    pub fn commit(mut self, record: EnvironmentRecord) {
        let mut state = self.tracker.lock();
        state.release_pending(&self.user, self.claim);
        state.tiers.insert(self.user.clone(), self.tier);
        info!("Tracking environment {} for user {}", record.container_id, record.user_id);
        state.insert(record);
        self.committed = true;
    }
}

impl Drop for QuotaSlot {
    fn drop(&mut self) {
        if !self.committed {
            self.tracker.lock().release_pending(&self.user, self.claim);
            debug!("Released unused quota slot for {}", self.user);
        }
    }
}
