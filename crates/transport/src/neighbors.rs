//! Direct radio-range neighbors, as seen by the router.

use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use tokio::time::Instant;

use crate::framing::Address;

pub trait NeighborProvider: Send + Sync {
    fn is_direct_neighbor(&self, address: Address) -> bool;

    fn neighbors(&self) -> HashSet<Address>;

    /// Called for every frame known to have arrived over a single hop.
    fn observe(&self, _address: Address) {}

    /// Called when a neighbor announces that it leaves the mesh.
    fn forget(&self, _address: Address) {}

    /// Periodic cleanup; returns how many neighbors were dropped.
    fn expire(&self) -> usize {
        0
    }
}

/// Fixed neighbor set, for static deployments and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticNeighbors {
    neighbors: HashSet<Address>,
}

impl StaticNeighbors {
    pub fn new(neighbors: impl IntoIterator<Item = Address>) -> Self {
        Self {
            neighbors: neighbors.into_iter().collect(),
        }
    }
}

impl NeighborProvider for StaticNeighbors {
    fn is_direct_neighbor(&self, address: Address) -> bool {
        self.neighbors.contains(&address)
    }

    fn neighbors(&self) -> HashSet<Address> {
        self.neighbors.clone()
    }
}

/// Neighbors learned from one-hop traffic, forgotten after `timeout` of silence.
pub struct LivenessTable {
    last_seen: RwLock<HashMap<Address, Instant>>,
    timeout: Duration,
}

impl LivenessTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            last_seen: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    fn is_alive(&self, seen: Instant) -> bool {
        Instant::now().duration_since(seen) < self.timeout
    }
}

impl NeighborProvider for LivenessTable {
    fn is_direct_neighbor(&self, address: Address) -> bool {
        let table = self.last_seen.read().unwrap_or_else(PoisonError::into_inner);
        table.get(&address).is_some_and(|seen| self.is_alive(*seen))
    }

    fn neighbors(&self) -> HashSet<Address> {
        let table = self.last_seen.read().unwrap_or_else(PoisonError::into_inner);
        table
            .iter()
            .filter(|(_, seen)| self.is_alive(**seen))
            .map(|(address, _)| *address)
            .collect()
    }

    fn observe(&self, address: Address) {
        let mut table = self.last_seen.write().unwrap_or_else(PoisonError::into_inner);
        if table.insert(address, Instant::now()).is_none() {
            log::info!("New neighbor {}", address);
        }
    }

    fn forget(&self, address: Address) {
        let mut table = self.last_seen.write().unwrap_or_else(PoisonError::into_inner);
        if table.remove(&address).is_some() {
            log::info!("Neighbor {} left", address);
        }
    }

    fn expire(&self) -> usize {
        let mut table = self.last_seen.write().unwrap_or_else(PoisonError::into_inner);
        let before = table.len();
        let timeout = self.timeout;
        let now = Instant::now();
        table.retain(|address, seen| {
            let alive = now.duration_since(*seen) < timeout;
            if !alive {
                log::info!("Neighbor {} silent for {:?}, removing", address, timeout);
            }
            alive
        });
        before - table.len()
    }
}
