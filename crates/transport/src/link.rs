//! Physical radio link abstraction.

use async_trait::async_trait;

use crate::framing::Address;
use crate::MeshError;

/// A packet radio that delivers discrete, size-bounded packets.
///
/// Production firmware drives a serial LoRa module behind this trait; tests
/// and the simulator use [`crate::SimulatedLink`].
#[async_trait]
pub trait PhysicalLink: Send + Sync + 'static {
    /// Returns the next received packet without waiting, or `None` when
    /// nothing is pending.
    async fn read(&self) -> Option<Vec<u8>>;

    /// Transmits `packet` to the radio at `address` ([`crate::BROADCAST`]
    /// reaches every node in range).
    async fn write(&self, address: Address, packet: &[u8]) -> Result<(), MeshError>;
}
