//! reliable multi-hop transport for small-MTU long-range radio meshes

use std::time::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod framing;
pub mod fec;
pub mod reassembly;
pub mod routing;
pub mod neighbors;
pub mod retry;
pub mod scheduler;
pub mod dispatch;
pub mod link;
pub mod simulated;
pub mod node;

pub use framing::{Address, Frame, FrameCodec, FrameType, BROADCAST};
pub use fec::ErrorCorrection;
pub use reassembly::{Fragment, Reassembler};
pub use routing::{RouteLookup, RouteState, RouteTable, RoutingAction};
pub use neighbors::{LivenessTable, NeighborProvider, StaticNeighbors};
pub use retry::{Fingerprint, PendingSends};
pub use scheduler::TransmitQueue;
pub use dispatch::{Dispatcher, Handler, HandlerKey};
pub use link::PhysicalLink;
pub use simulated::{ChannelConfig, MediumNeighbors, MediumStats, SimulatedLink, SimulatedMedium};
pub use node::{MeshNode, NodeStats};

/// CRC bytes appended before forward error correction.
pub const CRC_LEN: usize = 2;

/// Largest block the Reed-Solomon code operates on, parity included.
pub const MAX_FEC_BLOCK: usize = 255;

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("packet of {len} bytes exceeds radio MTU of {mtu}")]
    PacketTooLarge { len: usize, mtu: usize },

    #[error("malformed frame: {0} bytes is shorter than the frame header")]
    MalformedFrame(usize),

    #[error("unknown frame type 0x{0:02x}")]
    UnknownFrameType(u8),

    #[error("payload of {len} bytes exceeds the fragmentation limit of {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("malformed route path")]
    MalformedRoutePath,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("radio transmission failed")]
    TransmissionFailed,

    #[error("encoding failed: {0}")]
    Encoding(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Bytes the radio delivers per packet, FEC parity included.
    pub packet_size: usize,
    pub parity_bytes: usize,
    /// Width of the ttl header field in bytes (1..=3).
    pub ttl_width: usize,
    /// Overrides the fragment budget derived from `packet_size`.
    pub fragment_payload: Option<usize>,
    pub default_ttl: u32,
    pub ack_timeout: Duration,
    /// Added to the ack deadline for every retry (linear backoff).
    pub ack_backoff: Duration,
    pub ack_jitter: Duration,
    pub max_tries: u32,
    pub poll_interval: Duration,
    pub discovery_timeout: Duration,
    pub route_retry_interval: Duration,
    pub max_route_attempts: u32,
    pub route_timeout: Duration,
    pub request_cache_timeout: Duration,
    pub reassembly_timeout: Duration,
    pub send_queue_capacity: usize,
    /// The link appends one RSSI byte to every received packet.
    pub rssi_appended: bool,
    pub heartbeat_interval: Option<Duration>,
    pub neighbor_timeout: Duration,
    pub maintenance_interval: Duration,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            packet_size: 199,
            parity_bytes: 5,
            ttl_width: 3,
            fragment_payload: None,
            default_ttl: 20,
            ack_timeout: Duration::from_secs(1),
            ack_backoff: Duration::from_millis(500),
            ack_jitter: Duration::from_millis(100),
            max_tries: 3,
            poll_interval: Duration::from_millis(100),
            discovery_timeout: Duration::from_secs(10),
            route_retry_interval: Duration::from_millis(500),
            max_route_attempts: 25,
            route_timeout: Duration::from_secs(300),
            request_cache_timeout: Duration::from_secs(30),
            reassembly_timeout: Duration::from_secs(30),
            send_queue_capacity: 64,
            rssi_appended: false,
            heartbeat_interval: Some(Duration::from_secs(120)),
            neighbor_timeout: Duration::from_secs(140),
            maintenance_interval: Duration::from_secs(5),
        }
    }
}

impl MeshConfig {
    pub fn header_len(&self) -> usize {
        framing::FIXED_HEADER_LEN + self.ttl_width
    }

    /// Largest payload a single frame can carry once header, CRC and parity
    /// are accounted for.
    pub fn max_fragment_payload(&self) -> usize {
        self.fragment_payload.unwrap_or_else(|| {
            self.packet_size
                .saturating_sub(self.parity_bytes + CRC_LEN + self.header_len())
        })
    }

    pub fn validate(&self) -> Result<(), MeshError> {
        if !(1..=3).contains(&self.ttl_width) {
            return Err(MeshError::InvalidConfig(format!(
                "ttl_width must be 1..=3, got {}",
                self.ttl_width
            )));
        }
        if self.packet_size > MAX_FEC_BLOCK {
            return Err(MeshError::InvalidConfig(format!(
                "packet_size {} exceeds one FEC block of {} bytes",
                self.packet_size, MAX_FEC_BLOCK
            )));
        }
        if self.parity_bytes < 2 || self.parity_bytes >= self.packet_size {
            return Err(MeshError::InvalidConfig(format!(
                "parity_bytes {} cannot correct anything within {}-byte packets",
                self.parity_bytes, self.packet_size
            )));
        }
        let budget = self.max_fragment_payload();
        let derived = self
            .packet_size
            .saturating_sub(self.parity_bytes + CRC_LEN + self.header_len());
        if budget < 2 || budget > derived {
            return Err(MeshError::InvalidConfig(format!(
                "fragment payload {} must be between 2 and {}",
                budget, derived
            )));
        }
        if self.max_tries == 0 {
            return Err(MeshError::InvalidConfig("max_tries must be at least 1".into()));
        }
        if self.send_queue_capacity == 0 {
            return Err(MeshError::InvalidConfig("send_queue_capacity must be nonzero".into()));
        }
        let periods = [
            ("poll_interval", Some(self.poll_interval)),
            ("maintenance_interval", Some(self.maintenance_interval)),
            ("heartbeat_interval", self.heartbeat_interval),
        ];
        for (name, period) in periods {
            if period.is_some_and(|period| period.is_zero()) {
                return Err(MeshError::InvalidConfig(format!("{} must be nonzero", name)));
            }
        }
        Ok(())
    }
}
