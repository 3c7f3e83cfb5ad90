use std::collections::{BTreeSet, HashSet};
use std::net::TcpListener;
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, info, warn};

use super::error::{LabError, Result};

#[derive(Default)]
struct PortState {
    reserved: BTreeSet<u16>,
    orphaned: BTreeSet<u16>,
}

/// In-process reservations of host TCP ports handed out to environments.
///
/// The reservation set is the allocator's own view; `allocate` also skips
/// ports the runtime reports as published and, when `probe_bind` is set,
/// ports the OS refuses to bind. The scan and the insert happen under one
/// lock, so concurrent allocations never return the same port.
pub struct PortAllocator {
    state: Mutex<PortState>,
    probe_bind: bool,
}

impl PortAllocator {
    pub fn new(probe_bind: bool) -> Self {
        Self {
            state: Mutex::new(PortState::default()),
            probe_bind,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PortState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn allocate(
        &self,
        start_port: u16,
        max_attempts: u16,
        runtime_ports: &HashSet<u16>,
    ) -> Result<u16> {
        let end = (u32::from(start_port) + u32::from(max_attempts)).min(u32::from(u16::MAX) + 1);
        let mut state = self.lock();

        for candidate in u32::from(start_port)..end {
            let port = candidate as u16;
            if state.reserved.contains(&port) || runtime_ports.contains(&port) {
                continue;
            }
            if self.probe_bind && !port_is_free(port) {
                debug!("Port {} is bound outside the tracker, skipping", port);
                continue;
            }
            state.reserved.insert(port);
            info!("Reserved host port {}", port);
            return Ok(port);
        }

        warn!("No free port in range {}-{}", start_port, end.saturating_sub(1));
        Err(LabError::PortExhausted {
            start: start_port,
            end: end.saturating_sub(1),
        })
    }

    /// Marks an already-bound port as reserved. Returns false if it was
    /// reserved before.
    pub fn reserve(&self, port: u16) -> bool {
        self.lock().reserved.insert(port)
    }

    /// Drops a reservation. Releasing an unreserved port is a no-op.
    pub fn release(&self, port: u16) -> bool {
        let mut state = self.lock();
        state.orphaned.remove(&port);
        let released = state.reserved.remove(&port);
        if released {
            info!("Released host port {}", port);
        }
        released
    }

    /// Keeps `port` reserved but remembers that no environment owns it any
    /// more, so a later reconciliation pass can free it.
    pub fn orphan(&self, port: u16) {
        let mut state = self.lock();
        state.reserved.insert(port);
        if state.orphaned.insert(port) {
            warn!("Host port {} is orphaned until the next reconciliation", port);
        }
    }

    /// Releases every orphaned port that nothing in `bound` still publishes.
    pub fn release_orphans(&self, bound: &HashSet<u16>) -> Vec<u16> {
        let mut state = self.lock();
        let freed: Vec<u16> = state
            .orphaned
            .iter()
            .copied()
            .filter(|p| !bound.contains(p))
            .collect();
        for port in &freed {
            state.orphaned.remove(port);
            state.reserved.remove(port);
        }
        if !freed.is_empty() {
            info!("Released orphaned host ports {:?}", freed);
        }
        freed
    }

    #[cfg(test)]
    pub fn is_reserved(&self, port: u16) -> bool {
        self.lock().reserved.contains(&port)
    }

    pub fn reserved(&self) -> Vec<u16> {
        self.lock().reserved.iter().copied().collect()
    }

    pub fn orphaned(&self) -> Vec<u16> {
        self.lock().orphaned.iter().copied().collect()
    }
}

fn port_is_free(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_sequential_allocations_are_distinct() {
        let allocator = PortAllocator::new(false);
        let none = HashSet::new();

        let ports: Vec<u16> = (0..5)
            .map(|_| allocator.allocate(9000, 10, &none).unwrap())
            .collect();
        assert_eq!(ports, vec![9000, 9001, 9002, 9003, 9004]);

        let unique: HashSet<u16> = ports.iter().copied().collect();
        assert_eq!(unique.len(), ports.len());
    }

    #[test]
    fn test_release_allows_reuse() {
        let allocator = PortAllocator::new(false);
        let none = HashSet::new();

        let first = allocator.allocate(9100, 3, &none).unwrap();
        assert!(allocator.release(first));
        assert!(!allocator.release(first));
        assert_eq!(allocator.allocate(9100, 3, &none).unwrap(), first);
    }

    #[test]
    fn test_skips_runtime_ports_and_exhausts() {
        let allocator = PortAllocator::new(false);
        let runtime_ports = HashSet::from([9200, 9201]);

        assert_eq!(allocator.allocate(9200, 3, &runtime_ports).unwrap(), 9202);
        let err = allocator.allocate(9200, 3, &runtime_ports).unwrap_err();
        assert!(matches!(err, LabError::PortExhausted { start: 9200, end: 9202 }));
    }

    #[test]
    fn test_range_clamped_at_top_of_port_space() {
        let allocator = PortAllocator::new(false);
        let none = HashSet::new();

        assert_eq!(allocator.allocate(65535, 10, &none).unwrap(), 65535);
        assert!(allocator.allocate(65535, 10, &none).is_err());
    }

    #[test]
    fn test_bind_check_skips_os_bound_port() {
        let listener = TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let taken = listener.local_addr().unwrap().port();

        let allocator = PortAllocator::new(true);
        let port = allocator.allocate(taken, 1, &HashSet::new());
        assert!(port.is_err());
    }

    #[test]
    fn test_orphans_released_only_when_unbound() {
        let allocator = PortAllocator::new(false);
        allocator.orphan(9300);
        allocator.orphan(9301);
        assert!(allocator.is_reserved(9300));

        let freed = allocator.release_orphans(&HashSet::from([9301]));
        assert_eq!(freed, vec![9300]);
        assert!(!allocator.is_reserved(9300));
        assert!(allocator.is_reserved(9301));
        assert_eq!(allocator.orphaned(), vec![9301]);
    }

    #[test]
    fn test_concurrent_allocations_never_collide() {
        let allocator = Arc::new(PortAllocator::new(false));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let allocator = allocator.clone();
                std::thread::spawn(move || {
                    (0..10)
                        .map(|_| allocator.allocate(9400, 200, &HashSet::new()).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            for port in handle.join().unwrap() {
                assert!(all.insert(port), "port {port} handed out twice");
            }
        }
        assert_eq!(all.len(), 80);
    }
}
