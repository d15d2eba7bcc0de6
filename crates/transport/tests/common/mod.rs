//! Shared fixtures for the transport integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use meshnode_transport::{
    Address, ErrorCorrection, Frame, FrameCodec, HandlerKey, MeshConfig, MeshError,
    MeshNode, PhysicalLink, SimulatedMedium,
};
use tokio::sync::{mpsc, Mutex};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Defaults without the periodic heartbeat, so links only carry test traffic.
pub fn quiet_config() -> MeshConfig {
    MeshConfig {
        heartbeat_interval: None,
        ..Default::default()
    }
}

/// A link driven by the test: packets written by the node surface on
/// [`LinkHandle::written`], packets pushed into [`LinkHandle::inject`] are
/// read by the node.
pub struct ScriptedLink {
    inbound: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    written: mpsc::UnboundedSender<(Address, Vec<u8>)>,
}

pub struct LinkHandle {
    pub inject: mpsc::UnboundedSender<Vec<u8>>,
    pub written: mpsc::UnboundedReceiver<(Address, Vec<u8>)>,
}

pub fn scripted_link() -> (Arc<ScriptedLink>, LinkHandle) {
    let (inject, inbound) = mpsc::unbounded_channel();
    let (written_tx, written) = mpsc::unbounded_channel();
    let link = ScriptedLink {
        inbound: Mutex::new(inbound),
        written: written_tx,
    };
    (Arc::new(link), LinkHandle { inject, written })
}

#[async_trait]
impl PhysicalLink for ScriptedLink {
    async fn read(&self) -> Option<Vec<u8>> {
        self.inbound.lock().await.try_recv().ok()
    }

    async fn write(&self, address: Address, packet: &[u8]) -> Result<(), MeshError> {
        self.written
            .send((address, packet.to_vec()))
            .map_err(|_| MeshError::TransmissionFailed)
    }
}

/// Encodes and decodes packets exactly as a node configured with `config` does.
pub struct Wire {
    codec: FrameCodec,
    fec: ErrorCorrection,
}

impl Wire {
    pub fn new(config: &MeshConfig) -> Self {
        Self {
            codec: FrameCodec::new(config.ttl_width).expect("codec"),
            fec: ErrorCorrection::new(config.parity_bytes).expect("fec"),
        }
    }

    pub fn encode(&self, frame: &Frame) -> Vec<u8> {
        self.fec.encode(&self.codec.serialize(frame))
    }

    pub fn decode(&self, packet: &[u8]) -> Frame {
        let data = self.fec.decode(packet).expect("packet decodes");
        self.codec.deserialize(&data).expect("frame parses")
    }
}

/// Registers a handler that forwards every delivered frame into a channel.
pub async fn collect(node: &MeshNode, key: HandlerKey) -> mpsc::UnboundedReceiver<Frame> {
    let (tx, rx) = mpsc::unbounded_channel();
    node.register_handler(key, move |frame: &Frame| {
        tx.send(frame.clone())?;
        Ok(())
    })
    .await;
    rx
}

/// A started node attached to `medium`, using the medium's adjacency as its
/// neighbor view.
pub async fn join_medium(
    medium: &Arc<SimulatedMedium>,
    address: Address,
    config: MeshConfig,
) -> MeshNode {
    let link = Arc::new(medium.join(address).await);
    let neighbors = Arc::new(medium.neighbor_view(address));
    let node = MeshNode::new(address, config, link, neighbors).expect("valid node");
    node.start();
    node
}

pub fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}
