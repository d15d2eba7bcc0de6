//! Simulated shared radio medium for tests and the simulator
//!
//! One background task plays the channel: packets are transmitted one at a
//! time, each occupying the air for its bandwidth-derived airtime plus
//! latency. Delivery honours an adjacency graph, so a node only hears
//! transmissions from nodes in range.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock as StdRwLock};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, trace, warn};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::framing::{Address, BROADCAST};
use crate::link::PhysicalLink;
use crate::neighbors::NeighborProvider;
use crate::MeshError;

const MEDIUM_QUEUE: usize = 100_000;
const NODE_INBOX: usize = 1_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Largest packet the radio accepts.
    pub mtu: usize,
    /// Air data rate; 0 makes transmission instantaneous.
    pub bandwidth_bps: u64,
    pub latency: Duration,
    /// Standard deviation of the normally distributed latency jitter.
    pub latency_jitter: Duration,
    pub packet_loss: f64,
    /// Probability that a delivered packet has bytes flipped.
    pub corruption_rate: f64,
    pub max_corrupted_bytes: usize,
    /// Appended as a trailing byte to every delivered packet.
    pub rssi: Option<u8>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            mtu: 255,
            bandwidth_bps: 0,
            latency: Duration::from_millis(10),
            latency_jitter: Duration::ZERO,
            packet_loss: 0.0,
            corruption_rate: 0.0,
            max_corrupted_bytes: 0,
            rssi: None,
        }
    }
}

impl ChannelConfig {
    /// A LoRa module at 2.4 kbps air rate in open terrain.
    pub fn lora() -> Self {
        Self {
            bandwidth_bps: 2400,
            latency: Duration::from_millis(50),
            latency_jitter: Duration::from_millis(10),
            packet_loss: 0.02,
            corruption_rate: 0.05,
            max_corrupted_bytes: 2,
            ..Default::default()
        }
    }

    fn airtime(&self, len: usize) -> Duration {
        if self.bandwidth_bps == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64((len * 8) as f64 / self.bandwidth_bps as f64)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MediumStats {
    pub packets_sent: u64,
    pub packets_dropped: u64,
    pub packets_corrupted: u64,
    pub packets_delivered: u64,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    dropped: AtomicU64,
    corrupted: AtomicU64,
    delivered: AtomicU64,
}

struct RadioPacket {
    from: Address,
    to: Address,
    payload: Vec<u8>,
}

type Adjacency = Arc<StdRwLock<HashMap<Address, HashSet<Address>>>>;

pub struct SimulatedMedium {
    config: ChannelConfig,
    nodes: Arc<RwLock<HashMap<Address, mpsc::Sender<Vec<u8>>>>>,
    adjacency: Adjacency,
    stats: Arc<Counters>,
    packet_queue: mpsc::Sender<RadioPacket>,
}

impl SimulatedMedium {
    pub fn new(config: ChannelConfig) -> Arc<Self> {
        let nodes = Arc::new(RwLock::new(HashMap::<Address, mpsc::Sender<Vec<u8>>>::new()));
        let adjacency: Adjacency = Arc::new(StdRwLock::new(HashMap::new()));
        let stats = Arc::new(Counters::default());
        let (packet_queue, mut packet_rx) = mpsc::channel::<RadioPacket>(MEDIUM_QUEUE);

        log::info!("Simulated medium initialized with config: {:?}", config);

        let nodes_clone = nodes.clone();
        let adjacency_clone = adjacency.clone();
        let stats_clone = stats.clone();
        let config_clone = config.clone();
        tokio::spawn(async move {
            while let Some(packet) = packet_rx.recv().await {
                let delay = config_clone.airtime(packet.payload.len())
                    + config_clone.latency
                    + sample_jitter(config_clone.latency_jitter);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }

                let recipients = in_range(&adjacency_clone, packet.from, packet.to);
                if recipients.is_empty() {
                    trace!("No node in range of {} heard packet for {}", packet.from, packet.to);
                    continue;
                }

                let inboxes = nodes_clone.read().await;
                for recipient in recipients {
                    let Some(inbox) = inboxes.get(&recipient) else {
                        continue;
                    };
                    let impaired = impair(&config_clone, &stats_clone, &packet.payload);
                    let Some(delivered) = impaired else {
                        debug!("Packet {} -> {} lost in transmission", packet.from, recipient);
                        continue;
                    };
                    match inbox.try_send(delivered) {
                        Ok(()) => {
                            stats_clone.delivered.fetch_add(1, Ordering::Relaxed);
                            trace!("Packet {} -> {} delivered", packet.from, recipient);
                        }
                        Err(e) => {
                            warn!("Failed to deliver packet to node {}: {}", recipient, e);
                        }
                    }
                }
            }
            debug!("Simulated medium stopped");
        });

        Arc::new(Self {
            config,
            nodes,
            adjacency,
            stats,
            packet_queue,
        })
    }

    pub async fn join(self: &Arc<Self>, address: Address) -> SimulatedLink {
        let (tx, rx) = mpsc::channel(NODE_INBOX);
        self.nodes.write().await.insert(address, tx);
        SimulatedLink {
            address,
            medium: Arc::clone(self),
            receiver: Mutex::new(rx),
        }
    }

    /// Puts `a` and `b` in radio range of each other.
    pub fn connect(&self, a: Address, b: Address) {
        let mut adjacency = self.adjacency.write().unwrap_or_else(PoisonError::into_inner);
        adjacency.entry(a).or_default().insert(b);
        adjacency.entry(b).or_default().insert(a);
    }

    pub fn disconnect(&self, a: Address, b: Address) {
        let mut adjacency = self.adjacency.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(peers) = adjacency.get_mut(&a) {
            peers.remove(&b);
        }
        if let Some(peers) = adjacency.get_mut(&b) {
            peers.remove(&a);
        }
    }

    /// Neighbor provider answering from the medium's ground truth.
    pub fn neighbor_view(self: &Arc<Self>, address: Address) -> MediumNeighbors {
        MediumNeighbors {
            address,
            adjacency: self.adjacency.clone(),
        }
    }

    async fn send_packet(
        &self,
        from: Address,
        to: Address,
        payload: Vec<u8>,
    ) -> Result<(), MeshError> {
        if payload.len() > self.config.mtu {
            return Err(MeshError::PacketTooLarge {
                len: payload.len(),
                mtu: self.config.mtu,
            });
        }
        let packet = RadioPacket { from, to, payload };
        match self.packet_queue.try_send(packet) {
            Ok(()) => {
                self.stats.sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::error!("Medium queue is full, cannot send packet from {} to {}", from, to);
                Err(MeshError::TransmissionFailed)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::error!("Medium is closed, cannot send packet from {} to {}", from, to);
                Err(MeshError::TransmissionFailed)
            }
        }
    }

    pub fn get_stats(&self) -> MediumStats {
        MediumStats {
            packets_sent: self.stats.sent.load(Ordering::Relaxed),
            packets_dropped: self.stats.dropped.load(Ordering::Relaxed),
            packets_corrupted: self.stats.corrupted.load(Ordering::Relaxed),
            packets_delivered: self.stats.delivered.load(Ordering::Relaxed),
        }
    }
}

fn in_range(adjacency: &Adjacency, from: Address, to: Address) -> Vec<Address> {
    let adjacency = adjacency.read().unwrap_or_else(PoisonError::into_inner);
    let Some(peers) = adjacency.get(&from) else {
        return Vec::new();
    };
    if to == BROADCAST {
        peers.iter().copied().collect()
    } else if peers.contains(&to) {
        vec![to]
    } else {
        Vec::new()
    }
}

fn sample_jitter(std_dev: Duration) -> Duration {
    if std_dev.is_zero() {
        return Duration::ZERO;
    }
    let Ok(normal) = Normal::new(0.0, std_dev.as_secs_f64()) else {
        return Duration::ZERO;
    };
    let offset: f64 = normal.sample(&mut rand::rng());
    Duration::from_secs_f64(offset.max(0.0))
}

/// Applies loss, corruption and the RSSI trailer to one delivery.
fn impair(config: &ChannelConfig, stats: &Counters, payload: &[u8]) -> Option<Vec<u8>> {
    let mut rng = rand::rng();
    if config.packet_loss > 0.0 && rng.random::<f64>() < config.packet_loss {
        stats.dropped.fetch_add(1, Ordering::Relaxed);
        return None;
    }

    let mut delivered = payload.to_vec();
    if config.max_corrupted_bytes > 0
        && !delivered.is_empty()
        && config.corruption_rate > 0.0
        && rng.random::<f64>() < config.corruption_rate
    {
        let flips = rng.random_range(1..=config.max_corrupted_bytes);
        for _ in 0..flips {
            let position = rng.random_range(0..delivered.len());
            delivered[position] ^= rng.random_range(1..=u8::MAX);
        }
        stats.corrupted.fetch_add(1, Ordering::Relaxed);
    }

    if let Some(rssi) = config.rssi {
        delivered.push(rssi);
    }
    Some(delivered)
}

pub struct SimulatedLink {
    address: Address,
    medium: Arc<SimulatedMedium>,
    receiver: Mutex<mpsc::Receiver<Vec<u8>>>,
}

#[async_trait]
impl PhysicalLink for SimulatedLink {
    async fn read(&self) -> Option<Vec<u8>> {
        self.receiver.lock().await.try_recv().ok()
    }

    async fn write(&self, address: Address, packet: &[u8]) -> Result<(), MeshError> {
        trace!("{} transmitting {} bytes to {}", self.address, packet.len(), address);
        self.medium
            .send_packet(self.address, address, packet.to_vec())
            .await
    }
}

pub struct MediumNeighbors {
    address: Address,
    adjacency: Adjacency,
}

impl NeighborProvider for MediumNeighbors {
    fn is_direct_neighbor(&self, address: Address) -> bool {
        let adjacency = self.adjacency.read().unwrap_or_else(PoisonError::into_inner);
        adjacency
            .get(&self.address)
            .is_some_and(|peers| peers.contains(&address))
    }

    fn neighbors(&self) -> HashSet<Address> {
        let adjacency = self.adjacency.read().unwrap_or_else(PoisonError::into_inner);
        adjacency.get(&self.address).cloned().unwrap_or_default()
    }
}
