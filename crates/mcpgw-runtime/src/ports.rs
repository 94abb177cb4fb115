//! Deterministic loopback port pool for stdio adapters.
//!
//! Each stdio backend gets exactly one port from a fixed range. Allocation
//! probes the OS first (bind a loopback listener and drop it), which narrows
//! but does not close the race window; the port is only guaranteed bindable
//! once the adapter actually binds it.

use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::task::AbortHandle;
use tracing::debug;

use mcpgw_core::{AllocatorError, EventBus, GatewayEvent, now_ms};

/// Snapshot of one allocation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortAllocation {
    pub port: u16,
    pub name: String,
    pub allocated_at: u64,
    pub reserved: bool,
}

/// Range summary for the admin surface.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RangeInfo {
    pub start: u16,
    pub end: u16,
    pub total: usize,
    pub allocated: usize,
    pub available: usize,
}

struct AllocationEntry {
    info: PortAllocation,
    /// Single-shot reservation timer; cancelled on release.
    timer: Option<AbortHandle>,
}

#[derive(Default)]
struct AllocatorState {
    by_port: HashMap<u16, AllocationEntry>,
    by_name: HashMap<String, u16>,
}

/// Check if a port is free by attempting to bind it on loopback.
/// The listener is dropped immediately, which releases the port.
pub fn is_port_available(port: u16) -> bool {
    match TcpListener::bind(("127.0.0.1", port)) {
        Ok(listener) => listener.local_addr().is_ok(),
        Err(_) => false,
    }
}

/// Port pool with `port -> allocation` and `name -> port` kept in lockstep.
pub struct PortAllocator {
    start: u16,
    end: u16,
    reservation_timeout: Duration,
    state: Arc<Mutex<AllocatorState>>,
    events: EventBus,
}

impl PortAllocator {
    /// Build an allocator over `[start, end]` inclusive.
    pub fn new(
        start: u16,
        end: u16,
        reservation_timeout: Duration,
        events: EventBus,
    ) -> Result<Self, AllocatorError> {
        if start == 0 || end == 0 || start >= end {
            return Err(AllocatorError::InvalidPortRange { start, end });
        }
        Ok(Self {
            start,
            end,
            reservation_timeout,
            state: Arc::new(Mutex::new(AllocatorState::default())),
            events,
        })
    }

    /// Reserve a port for `name`.
    ///
    /// Idempotent: a name that already holds a port gets the same port back.
    /// A `preferred` port is honored when it lies in the range, is not held
    /// by another name, and passes the OS probe; otherwise the range is
    /// scanned first-fit.
    pub fn allocate(&self, name: &str, preferred: Option<u16>) -> Result<u16, AllocatorError> {
        let mut state = self.state.lock().unwrap();

        if let Some(port) = state.by_name.get(name) {
            return Ok(*port);
        }

        let port = self.pick_port(&state, preferred)?;
        state.by_port.insert(
            port,
            AllocationEntry {
                info: PortAllocation {
                    port,
                    name: name.to_string(),
                    allocated_at: now_ms(),
                    reserved: false,
                },
                timer: None,
            },
        );
        state.by_name.insert(name.to_string(), port);
        drop(state);

        debug!(name = %name, port = %port, "Allocated port");
        self.events.emit(GatewayEvent::PortAllocated {
            name: name.to_string(),
            port,
            timestamp: now_ms(),
        });
        Ok(port)
    }

    fn pick_port(
        &self,
        state: &AllocatorState,
        preferred: Option<u16>,
    ) -> Result<u16, AllocatorError> {
        if let Some(port) = preferred
            && (self.start..=self.end).contains(&port)
            && !state.by_port.contains_key(&port)
            && is_port_available(port)
        {
            return Ok(port);
        }
        for port in self.start..=self.end {
            if state.by_port.contains_key(&port) {
                continue;
            }
            if is_port_available(port) {
                return Ok(port);
            }
            debug!(port = %port, "Port unavailable on system, skipping");
        }
        Err(AllocatorError::NoPortsAvailable {
            start: self.start,
            end: self.end,
        })
    }

    /// Flag an allocated port as reserved and arm the reservation timer.
    ///
    /// When the timer fires, only the flag is cleared; the allocation
    /// itself stays. Re-reserving re-arms the timer.
    pub fn reserve_port(&self, name: &str, port: Option<u16>) -> Result<u16, AllocatorError> {
        let mut state = self.state.lock().unwrap();

        let port = match port {
            Some(p) => p,
            None => *state
                .by_name
                .get(name)
                .ok_or_else(|| AllocatorError::NotAllocated(name.to_string()))?,
        };

        let entry = state
            .by_port
            .get_mut(&port)
            .ok_or_else(|| AllocatorError::NotAllocated(name.to_string()))?;
        if entry.info.name != name {
            return Err(AllocatorError::WrongOwner {
                port,
                name: name.to_string(),
                owner: entry.info.name.clone(),
            });
        }

        entry.info.reserved = true;
        if let Some(timer) = entry.timer.take() {
            timer.abort();
        }

        let shared = Arc::clone(&self.state);
        let timeout = self.reservation_timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let mut state = shared.lock().unwrap();
            if let Some(entry) = state.by_port.get_mut(&port) {
                entry.info.reserved = false;
                entry.timer = None;
            }
        });
        entry.timer = Some(handle.abort_handle());

        Ok(port)
    }

    /// Drop the mapping for `name`. Returns true iff a mapping existed.
    pub fn release_port(&self, name: &str) -> bool {
        let released = {
            let mut state = self.state.lock().unwrap();
            let Some(port) = state.by_name.remove(name) else {
                return false;
            };
            if let Some(entry) = state.by_port.remove(&port)
                && let Some(timer) = entry.timer
            {
                timer.abort();
            }
            port
        };

        self.events.emit(GatewayEvent::PortReleased {
            name: name.to_string(),
            port: released,
            timestamp: now_ms(),
        });
        true
    }

    pub fn port_for_name(&self, name: &str) -> Option<u16> {
        self.state.lock().unwrap().by_name.get(name).copied()
    }

    pub fn name_for_port(&self, port: u16) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .by_port
            .get(&port)
            .map(|e| e.info.name.clone())
    }

    /// Snapshot of every allocation, ordered by port.
    pub fn allocations(&self) -> Vec<PortAllocation> {
        let state = self.state.lock().unwrap();
        let mut all: Vec<_> = state.by_port.values().map(|e| e.info.clone()).collect();
        all.sort_by_key(|a| a.port);
        all
    }

    pub fn reserved_ports(&self) -> Vec<u16> {
        let state = self.state.lock().unwrap();
        let mut ports: Vec<_> = state
            .by_port
            .values()
            .filter(|e| e.info.reserved)
            .map(|e| e.info.port)
            .collect();
        ports.sort_unstable();
        ports
    }

    pub fn range_info(&self) -> RangeInfo {
        let state = self.state.lock().unwrap();
        let total = usize::from(self.end - self.start) + 1;
        let allocated = state.by_port.len();
        RangeInfo {
            start: self.start,
            end: self.end,
            total,
            allocated,
            available: total.saturating_sub(allocated),
        }
    }

    /// Up to `k` ports that are unallocated and pass the OS probe right now.
    pub fn next_available_ports(&self, k: usize) -> Vec<u16> {
        let state = self.state.lock().unwrap();
        (self.start..=self.end)
            .filter(|port| !state.by_port.contains_key(port) && is_port_available(*port))
            .take(k)
            .collect()
    }

    /// Cancel every reservation timer and clear both maps.
    pub fn cleanup(&self) {
        let mut state = self.state.lock().unwrap();
        for entry in state.by_port.values_mut() {
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
        }
        state.by_port.clear();
        state.by_name.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(start: u16, end: u16) -> PortAllocator {
        PortAllocator::new(start, end, Duration::from_secs(60), EventBus::new()).unwrap()
    }

    #[test]
    fn construction_rejects_bad_ranges() {
        assert!(matches!(
            PortAllocator::new(0, 10, Duration::from_secs(1), EventBus::new()),
            Err(AllocatorError::InvalidPortRange { .. })
        ));
        assert!(matches!(
            PortAllocator::new(4000, 4000, Duration::from_secs(1), EventBus::new()),
            Err(AllocatorError::InvalidPortRange { .. })
        ));
        assert!(matches!(
            PortAllocator::new(4001, 4000, Duration::from_secs(1), EventBus::new()),
            Err(AllocatorError::InvalidPortRange { .. })
        ));
    }

    #[tokio::test]
    async fn allocate_is_idempotent_per_name() {
        let alloc = allocator(47311, 47320);
        let first = alloc.allocate("mem", None).unwrap();
        let second = alloc.allocate("mem", None).unwrap();
        assert_eq!(first, second);
        assert_eq!(alloc.allocations().len(), 1);
    }

    #[tokio::test]
    async fn mappings_stay_in_lockstep() {
        let alloc = allocator(47321, 47330);
        let port = alloc.allocate("mem", None).unwrap();
        assert_eq!(alloc.port_for_name("mem"), Some(port));
        assert_eq!(alloc.name_for_port(port), Some("mem".to_string()));

        assert!(alloc.release_port("mem"));
        assert_eq!(alloc.port_for_name("mem"), None);
        assert_eq!(alloc.name_for_port(port), None);
        assert!(!alloc.release_port("mem"));
    }

    #[tokio::test]
    async fn exhausted_range_fails() {
        let alloc = allocator(47331, 47332);
        alloc.allocate("a", None).unwrap();
        alloc.allocate("b", None).unwrap();
        assert!(matches!(
            alloc.allocate("c", None),
            Err(AllocatorError::NoPortsAvailable { .. })
        ));
    }

    #[tokio::test]
    async fn preferred_port_is_honored_when_free() {
        let alloc = allocator(47341, 47350);
        let port = alloc.allocate("mem", Some(47345)).unwrap();
        assert_eq!(port, 47345);

        // Out-of-range preference falls back to the scan.
        let other = alloc.allocate("other", Some(9)).unwrap();
        assert_eq!(other, 47341);
    }

    #[tokio::test]
    async fn os_held_port_is_skipped() {
        let listener = TcpListener::bind(("127.0.0.1", 47351)).unwrap();
        let alloc = allocator(47351, 47360);
        let port = alloc.allocate("mem", Some(47351)).unwrap();
        assert_ne!(port, 47351);
        drop(listener);
    }

    #[tokio::test]
    async fn reserve_requires_matching_owner() {
        let alloc = allocator(47361, 47370);
        let port = alloc.allocate("mem", None).unwrap();
        alloc.allocate("other", None).unwrap();

        assert!(matches!(
            alloc.reserve_port("ghost", None),
            Err(AllocatorError::NotAllocated(_))
        ));
        assert!(matches!(
            alloc.reserve_port("other", Some(port)),
            Err(AllocatorError::WrongOwner { .. })
        ));
        assert_eq!(alloc.reserve_port("mem", None).unwrap(), port);
        assert_eq!(alloc.reserved_ports(), vec![port]);
    }

    #[tokio::test(start_paused = true)]
    async fn reservation_expiry_clears_flag_but_keeps_allocation() {
        let alloc = PortAllocator::new(
            47371,
            47380,
            Duration::from_secs(60),
            EventBus::new(),
        )
        .unwrap();
        let port = alloc.allocate("mem", None).unwrap();
        alloc.reserve_port("mem", None).unwrap();
        assert_eq!(alloc.reserved_ports(), vec![port]);

        tokio::time::sleep(Duration::from_secs(61)).await;

        assert!(alloc.reserved_ports().is_empty());
        assert_eq!(alloc.port_for_name("mem"), Some(port));
    }

    #[tokio::test]
    async fn range_info_counts() {
        let alloc = allocator(47381, 47384);
        alloc.allocate("a", None).unwrap();
        let info = alloc.range_info();
        assert_eq!(
            info,
            RangeInfo {
                start: 47381,
                end: 47384,
                total: 4,
                allocated: 1,
                available: 3,
            }
        );
        assert_eq!(alloc.next_available_ports(2).len(), 2);
    }

    #[tokio::test]
    async fn cleanup_empties_both_maps() {
        let alloc = allocator(47385, 47390);
        alloc.allocate("a", None).unwrap();
        alloc.allocate("b", None).unwrap();
        alloc.cleanup();
        assert!(alloc.allocations().is_empty());
        assert_eq!(alloc.port_for_name("a"), None);
    }
}
