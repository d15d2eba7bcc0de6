//! Outbound queue feeding the single radio transmitter.
//!
//! Two bounded lanes: control traffic (acknowledgements and routing frames)
//! always drains before data. A full lane drops its oldest entry.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, Notify};
use log::{debug, warn};

use crate::framing::{Address, Frame, FrameType};

/// A logical send requested by the application layer.
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub frame_type: FrameType,
    pub payload: Vec<u8>,
    pub destination: Address,
    pub ttl: u32,
    pub route_attempts: u32,
}

/// One pre-built frame: an acknowledgement, routing control, or a relayed frame.
#[derive(Debug, Clone)]
pub struct QueuedFrame {
    pub frame: Frame,
    /// Fixed next hop; `None` resolves through the route table.
    pub next_hop: Option<Address>,
    pub route_attempts: u32,
}

#[derive(Debug, Clone)]
pub enum Outbound {
    Send(SendRequest),
    Frame(QueuedFrame),
}

impl Outbound {
    pub fn is_control(&self) -> bool {
        match self {
            Outbound::Send(_) => false,
            Outbound::Frame(queued) => queued.frame.frame_type.is_control(),
        }
    }

    pub fn destination(&self) -> Address {
        match self {
            Outbound::Send(request) => request.destination,
            Outbound::Frame(queued) => queued.frame.destination,
        }
    }
}

#[derive(Default)]
struct Lanes {
    control: VecDeque<Outbound>,
    data: VecDeque<Outbound>,
}

#[derive(Clone)]
pub struct TransmitQueue {
    lanes: Arc<Mutex<Lanes>>,
    ready: Arc<Notify>,
    capacity: usize,
    queued: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl TransmitQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            lanes: Arc::new(Mutex::new(Lanes::default())),
            ready: Arc::new(Notify::new()),
            capacity: capacity.max(1),
            queued: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Enqueues without waiting for transmission.
    pub async fn push(&self, item: Outbound) {
        {
            let mut lanes = self.lanes.lock().await;
            let lane = if item.is_control() {
                &mut lanes.control
            } else {
                &mut lanes.data
            };
            if lane.len() >= self.capacity {
                if let Some(oldest) = lane.pop_front() {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Transmit queue full, dropping oldest entry for {}",
                        oldest.destination()
                    );
                }
            }
            lane.push_back(item);
            self.queued.fetch_add(1, Ordering::Relaxed);
            debug!(
                "Queued outbound item ({} control, {} data pending)",
                lanes.control.len(),
                lanes.data.len()
            );
        }
        self.ready.notify_one();
    }

    pub async fn pop(&self) -> Option<Outbound> {
        let mut lanes = self.lanes.lock().await;
        lanes.control.pop_front().or_else(|| lanes.data.pop_front())
    }

    pub async fn pop_control(&self) -> Option<Outbound> {
        self.lanes.lock().await.control.pop_front()
    }

    /// Waits for the next item, control lane first.
    pub async fn next(&self) -> Outbound {
        loop {
            if let Some(item) = self.pop().await {
                return item;
            }
            self.ready.notified().await;
        }
    }

    /// Resolves when something was pushed since the last wakeup.
    pub async fn wait_ready(&self) {
        self.ready.notified().await;
    }

    pub async fn len(&self) -> usize {
        let lanes = self.lanes.lock().await;
        lanes.control.len() + lanes.data.len()
    }

    pub fn get_stats(&self) -> (u64, u64) {
        (
            self.queued.load(Ordering::Relaxed),
            self.dropped.load(Ordering::Relaxed),
        )
    }
}
