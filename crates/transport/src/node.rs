//! A mesh node: wires codec, error correction, reassembly, routing and
//! acknowledgement tracking to one physical link.
//!
//! Two long-running tasks share the node state. The receive loop polls the
//! link and runs every packet through decode, routing, acknowledgement and
//! reassembly before dispatching. The transmit loop is the only writer on
//! the link; it drains the [`TransmitQueue`] and performs the stop-and-wait
//! retry of unicast fragments. Locks are never held across link I/O.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use log::{debug, info, trace, warn};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, sleep, sleep_until, Instant, MissedTickBehavior};

use crate::dispatch::{run_handlers, Dispatcher, HandlerKey};
use crate::fec::ErrorCorrection;
use crate::framing::{Address, Frame, FrameCodec, FrameType, BROADCAST};
use crate::link::PhysicalLink;
use crate::neighbors::NeighborProvider;
use crate::reassembly::{fragment, Fragment, Reassembler, MAX_FRAGMENTS};
use crate::retry::{ack_deadline, fingerprint, parse_fingerprint, PendingSends};
use crate::routing::{RouteLookup, RouteState, RouteTable, RoutingAction};
use crate::scheduler::{Outbound, QueuedFrame, SendRequest, TransmitQueue};
use crate::{MeshConfig, MeshError};

/// Snapshot of a node's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NodeStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub retransmissions: u64,
    pub acks_received: u64,
    pub corrupt_dropped: u64,
    pub forwarded: u64,
    /// Complete logical frames handed to the dispatcher.
    pub delivered: u64,
    pub abandoned: u64,
    pub unroutable: u64,
    pub queue_dropped: u64,
}

#[derive(Default)]
struct Counters {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    retransmissions: AtomicU64,
    acks_received: AtomicU64,
    corrupt_dropped: AtomicU64,
    forwarded: AtomicU64,
    delivered: AtomicU64,
    abandoned: AtomicU64,
    unroutable: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

struct NodeInner {
    address: Address,
    config: MeshConfig,
    link: Arc<dyn PhysicalLink>,
    neighbors: Arc<dyn NeighborProvider>,
    codec: FrameCodec,
    fec: ErrorCorrection,
    queue: TransmitQueue,
    pending: Mutex<PendingSends>,
    routes: Mutex<RouteTable>,
    reassembly: Mutex<Reassembler>,
    handlers: RwLock<Dispatcher>,
    stats: Counters,
    /// Cleared by `stop`; deferred requeues check it before pushing.
    running: Arc<AtomicBool>,
}

pub struct MeshNode {
    inner: Arc<NodeInner>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl MeshNode {
    pub fn new(
        address: Address,
        config: MeshConfig,
        link: Arc<dyn PhysicalLink>,
        neighbors: Arc<dyn NeighborProvider>,
    ) -> Result<Self, MeshError> {
        config.validate()?;
        if address == BROADCAST {
            return Err(MeshError::InvalidConfig(format!(
                "0x{:04x} is reserved for broadcast",
                BROADCAST
            )));
        }
        let codec = FrameCodec::new(config.ttl_width)?;
        let fec = ErrorCorrection::new(config.parity_bytes)?;

        let inner = NodeInner {
            address,
            codec,
            fec,
            link,
            neighbors,
            queue: TransmitQueue::new(config.send_queue_capacity),
            pending: Mutex::new(PendingSends::new()),
            routes: Mutex::new(RouteTable::new(address, &config)),
            reassembly: Mutex::new(Reassembler::new(config.reassembly_timeout)),
            handlers: RwLock::new(Dispatcher::new()),
            stats: Counters::default(),
            running: Arc::new(AtomicBool::new(false)),
            config,
        };
        Ok(Self {
            inner: Arc::new(inner),
            tasks: StdMutex::new(Vec::new()),
        })
    }

    /// Spawns the receive, transmit, maintenance and heartbeat tasks.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if !tasks.is_empty() {
            warn!("Node {} is already running", self.inner.address);
            return;
        }
        info!(
            "Starting mesh node {} ({} byte fragments, ttl {})",
            self.inner.address,
            self.inner.config.max_fragment_payload(),
            self.inner.config.default_ttl
        );
        self.inner.running.store(true, Ordering::Release);
        tasks.push(tokio::spawn(receive_loop(self.inner.clone())));
        tasks.push(tokio::spawn(transmit_loop(self.inner.clone())));
        tasks.push(tokio::spawn(maintenance_loop(self.inner.clone())));
        if let Some(period) = self.inner.config.heartbeat_interval {
            tasks.push(tokio::spawn(heartbeat_loop(self.inner.clone(), period)));
        }
    }

    /// Cancels all node tasks. Pending retries and open reassembly sessions
    /// are dropped with them.
    pub fn stop(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        self.inner.running.store(false, Ordering::Release);
        if tasks.is_empty() {
            return;
        }
        for task in tasks.drain(..) {
            task.abort();
        }
        info!("Stopped mesh node {}", self.inner.address);
    }

    pub fn local_address(&self) -> Address {
        self.inner.address
    }

    pub async fn send(
        &self,
        frame_type: FrameType,
        payload: Vec<u8>,
        destination: Address,
    ) -> Result<(), MeshError> {
        self.send_with_ttl(frame_type, payload, destination, self.inner.config.default_ttl)
            .await
    }

    /// Queues a logical send and returns immediately. Delivery is best
    /// effort; failures only show up in the logs and [`NodeStats`].
    pub async fn send_with_ttl(
        &self,
        frame_type: FrameType,
        payload: Vec<u8>,
        destination: Address,
        ttl: u32,
    ) -> Result<(), MeshError> {
        let max = self.inner.config.max_fragment_payload() * MAX_FRAGMENTS;
        if payload.len() > max {
            return Err(MeshError::PayloadTooLarge {
                len: payload.len(),
                max,
            });
        }
        if destination == self.inner.address {
            let frame = Frame::new(frame_type, destination, destination, ttl, payload);
            self.inner.dispatch(&frame).await;
            return Ok(());
        }
        self.inner
            .queue
            .push(Outbound::Send(SendRequest {
                frame_type,
                payload,
                destination,
                ttl,
                route_attempts: 0,
            }))
            .await;
        Ok(())
    }

    pub async fn register_handler<F>(&self, key: HandlerKey, handler: F)
    where
        F: Fn(&Frame) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.handlers.write().await.register(key, Arc::new(handler));
    }

    pub async fn route_state(&self, destination: Address) -> RouteState {
        if self.inner.neighbors.is_direct_neighbor(destination) {
            return RouteState::Known {
                next_hop: destination,
                hop_count: 1,
            };
        }
        self.inner
            .routes
            .lock()
            .await
            .state(destination, Instant::now())
    }

    pub fn stats(&self) -> NodeStats {
        let counters = &self.inner.stats;
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let (_, queue_dropped) = self.inner.queue.get_stats();
        NodeStats {
            frames_sent: load(&counters.frames_sent),
            frames_received: load(&counters.frames_received),
            retransmissions: load(&counters.retransmissions),
            acks_received: load(&counters.acks_received),
            corrupt_dropped: load(&counters.corrupt_dropped),
            forwarded: load(&counters.forwarded),
            delivered: load(&counters.delivered),
            abandoned: load(&counters.abandoned),
            unroutable: load(&counters.unroutable),
            queue_dropped,
        }
    }
}

impl Drop for MeshNode {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn receive_loop(inner: Arc<NodeInner>) {
    loop {
        match inner.link.read().await {
            Some(packet) => inner.handle_packet(packet).await,
            None => sleep(inner.config.poll_interval).await,
        }
    }
}

async fn transmit_loop(inner: Arc<NodeInner>) {
    loop {
        match inner.queue.next().await {
            Outbound::Send(request) => inner.transmit_request(request).await,
            Outbound::Frame(queued) => inner.transmit_frame(queued).await,
        }
    }
}

async fn maintenance_loop(inner: Arc<NodeInner>) {
    let mut ticker = interval(inner.config.maintenance_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let now = Instant::now();
        inner.routes.lock().await.expire(now);
        let evicted = inner.reassembly.lock().await.expire(now);
        if evicted > 0 {
            debug!("Node {} evicted {} stale reassembly sessions", inner.address, evicted);
        }
        inner.neighbors.expire();
    }
}

async fn heartbeat_loop(inner: Arc<NodeInner>, period: Duration) {
    inner.announce(FrameType::NodeJoining).await;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        inner.announce(FrameType::NodeAlive).await;
    }
}

impl NodeInner {
    fn encode(&self, frame: &Frame) -> Vec<u8> {
        self.fec.encode(&self.codec.serialize(frame))
    }

    fn deadline(&self, attempt: u32) -> Instant {
        ack_deadline(
            Instant::now(),
            attempt,
            self.config.ack_timeout,
            self.config.ack_backoff,
            self.config.ack_jitter,
        )
    }

    async fn announce(&self, frame_type: FrameType) {
        trace!("Node {} announcing {:?}", self.address, frame_type);
        self.queue
            .push(Outbound::Send(SendRequest {
                frame_type,
                payload: Vec::new(),
                destination: BROADCAST,
                ttl: self.config.default_ttl,
                route_attempts: 0,
            }))
            .await;
    }

    // ---- receive path ----

    async fn handle_packet(&self, mut packet: Vec<u8>) {
        let rssi = if self.config.rssi_appended {
            packet.pop()
        } else {
            None
        };
        let Some(data) = self.fec.decode(&packet) else {
            bump(&self.stats.corrupt_dropped);
            debug!("Node {} dropped uncorrectable packet ({} bytes)", self.address, packet.len());
            return;
        };
        let mut frame = match self.codec.deserialize(&data) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Node {} dropped packet: {}", self.address, e);
                return;
            }
        };
        frame.rssi = rssi;

        if frame.source == self.address {
            trace!("Node {} ignoring its own echo", self.address);
            return;
        }
        bump(&self.stats.frames_received);
        trace!(
            "Node {} received {:?} {} -> {} (index {}, session {}, ttl {})",
            self.address,
            frame.frame_type,
            frame.source,
            frame.destination,
            frame.fragment_index,
            frame.session_id,
            frame.ttl
        );
        self.observe(&frame);

        let now = Instant::now();
        match frame.frame_type {
            FrameType::RoutingRequest => {
                let action = self.routes.lock().await.handle_routing_request(
                    &frame,
                    self.neighbors.as_ref(),
                    now,
                );
                self.enqueue_action(action).await;
                return;
            }
            FrameType::RoutingResponse => {
                let action = self.routes.lock().await.handle_routing_response(&frame, now);
                self.enqueue_action(action).await;
                return;
            }
            FrameType::Acknowledgement if frame.destination == self.address => {
                self.handle_ack(&frame).await;
                return;
            }
            _ => {}
        }

        if frame.destination != self.address && !frame.is_broadcast() {
            self.forward(frame).await;
            return;
        }

        if !frame.is_broadcast() && !frame.frame_type.is_control() {
            self.acknowledge(&frame).await;
        }

        let assembled = self.reassembly.lock().await.accept(frame, now);
        if let Some(frame) = assembled {
            self.dispatch(&frame).await;
        }
    }

    /// Feeds one-hop evidence to the neighbor provider. Broadcasts are never
    /// relayed and routing frames carry the transmitting hop as source.
    fn observe(&self, frame: &Frame) {
        match frame.frame_type {
            FrameType::NodeLeaving => self.neighbors.forget(frame.source),
            frame_type if frame_type.is_routing() || frame.is_broadcast() => {
                self.neighbors.observe(frame.source)
            }
            _ => {}
        }
    }

    async fn handle_ack(&self, frame: &Frame) {
        let Some(fingerprint) = parse_fingerprint(&frame.payload) else {
            debug!("Malformed acknowledgement from {}", frame.source);
            return;
        };
        if self.pending.lock().await.acknowledge(&fingerprint) {
            bump(&self.stats.acks_received);
            trace!("Node {} got ack from {}", self.address, frame.source);
        } else {
            trace!("Ack from {} matches no pending send", frame.source);
        }
    }

    async fn acknowledge(&self, frame: &Frame) {
        let fingerprint = match fingerprint(frame) {
            Ok(fingerprint) => fingerprint,
            Err(e) => {
                warn!("Cannot acknowledge frame from {}: {}", frame.source, e);
                return;
            }
        };
        let ack = Frame::new(
            FrameType::Acknowledgement,
            self.address,
            frame.source,
            self.config.default_ttl,
            fingerprint.to_vec(),
        );
        self.queue
            .push(Outbound::Frame(QueuedFrame {
                frame: ack,
                next_hop: None,
                route_attempts: 0,
            }))
            .await;
    }

    async fn forward(&self, mut frame: Frame) {
        if frame.ttl <= 1 {
            debug!(
                "Dropping {:?} {} -> {}: ttl exhausted",
                frame.frame_type, frame.source, frame.destination
            );
            return;
        }
        frame.ttl -= 1;
        bump(&self.stats.forwarded);
        trace!("Node {} relaying frame {} -> {}", self.address, frame.source, frame.destination);
        self.queue
            .push(Outbound::Frame(QueuedFrame {
                frame,
                next_hop: None,
                route_attempts: 0,
            }))
            .await;
    }

    async fn enqueue_action(&self, action: Option<RoutingAction>) {
        let (frame, next_hop) = match action {
            Some(RoutingAction::Broadcast(frame)) => (frame, BROADCAST),
            Some(RoutingAction::Unicast { next_hop, frame }) => (frame, next_hop),
            None => return,
        };
        self.queue
            .push(Outbound::Frame(QueuedFrame {
                frame,
                next_hop: Some(next_hop),
                route_attempts: 0,
            }))
            .await;
    }

    async fn dispatch(&self, frame: &Frame) {
        let handlers = self.handlers.read().await.handlers_for(frame.frame_type);
        bump(&self.stats.delivered);
        debug!(
            "Node {} delivering {:?} from {} ({} bytes) to {} handlers",
            self.address,
            frame.frame_type,
            frame.source,
            frame.payload.len(),
            handlers.len()
        );
        run_handlers(&handlers, frame);
    }

    // ---- transmit path ----

    async fn write_packet(&self, next_hop: Address, packet: &[u8]) {
        match self.link.write(next_hop, packet).await {
            Ok(()) => bump(&self.stats.frames_sent),
            Err(e) => warn!("Node {} failed to write to {}: {}", self.address, next_hop, e),
        }
    }

    async fn transmit(&self, next_hop: Address, frame: &Frame) {
        trace!(
            "Node {} sending {:?} for {} via {}",
            self.address,
            frame.frame_type,
            frame.destination,
            next_hop
        );
        self.write_packet(next_hop, &self.encode(frame)).await;
    }

    async fn resolve(&self, destination: Address) -> RouteLookup {
        let (lookup, action) =
            self.routes
                .lock()
                .await
                .get_route(destination, self.neighbors.as_ref(), Instant::now());
        self.enqueue_action(action).await;
        lookup
    }

    /// Puts `item` back on the queue once discovery had time to progress.
    fn retry_after_discovery(&self, item: Outbound, attempts: u32) {
        if attempts >= self.config.max_route_attempts {
            bump(&self.stats.unroutable);
            warn!(
                "No route to {} after {} attempts, dropping",
                item.destination(),
                attempts
            );
            return;
        }
        let queue = self.queue.clone();
        let running = self.running.clone();
        let delay = self.config.route_retry_interval;
        tokio::spawn(async move {
            sleep(delay).await;
            if running.load(Ordering::Acquire) {
                queue.push(item).await;
            } else {
                trace!("Node stopped, dropping deferred send to {}", item.destination());
            }
        });
    }

    fn build_frame(&self, request: &SendRequest, piece: Fragment) -> Frame {
        Frame {
            frame_type: request.frame_type,
            source: self.address,
            destination: request.destination,
            ttl: request.ttl,
            fragment_index: piece.fragment_index,
            session_id: piece.session_id,
            rssi: None,
            payload: piece.payload,
        }
    }

    async fn transmit_request(&self, mut request: SendRequest) {
        let destination = request.destination;
        let next_hop = if destination == BROADCAST {
            BROADCAST
        } else {
            match self.resolve(destination).await {
                RouteLookup::NextHop(next_hop) => next_hop,
                RouteLookup::Pending => {
                    request.route_attempts += 1;
                    let attempts = request.route_attempts;
                    self.retry_after_discovery(Outbound::Send(request), attempts);
                    return;
                }
                RouteLookup::Unknown => {
                    bump(&self.stats.unroutable);
                    info!("{} is unreachable, dropping {:?} send", destination, request.frame_type);
                    return;
                }
            }
        };

        let fragments = match fragment(&request.payload, self.config.max_fragment_payload()) {
            Ok(fragments) => fragments,
            Err(e) => {
                warn!("Dropping send to {}: {}", destination, e);
                return;
            }
        };
        let total = fragments.len();

        for (delivered, piece) in fragments.into_iter().enumerate() {
            let frame = self.build_frame(&request, piece);
            if next_hop == BROADCAST || frame.frame_type.is_control() {
                self.transmit(next_hop, &frame).await;
                continue;
            }
            if !self.deliver_reliably(next_hop, frame).await {
                bump(&self.stats.abandoned);
                warn!(
                    "Abandoning send to {} via {} after {} tries ({}/{} frames acknowledged)",
                    destination, next_hop, self.config.max_tries, delivered, total
                );
                if next_hop != destination {
                    self.routes.lock().await.invalidate(destination);
                }
                return;
            }
        }
        debug!(
            "Node {} sent {} bytes to {} in {} frames",
            self.address,
            request.payload.len(),
            destination,
            total
        );
    }

    async fn transmit_frame(&self, queued: QueuedFrame) {
        let QueuedFrame {
            frame,
            next_hop,
            route_attempts,
        } = queued;
        let next_hop = match next_hop {
            Some(next_hop) => next_hop,
            None if frame.is_broadcast() => BROADCAST,
            None => match self.resolve(frame.destination).await {
                RouteLookup::NextHop(next_hop) => next_hop,
                RouteLookup::Pending => {
                    let attempts = route_attempts + 1;
                    let retry = Outbound::Frame(QueuedFrame {
                        frame,
                        next_hop: None,
                        route_attempts: attempts,
                    });
                    self.retry_after_discovery(retry, attempts);
                    return;
                }
                RouteLookup::Unknown => {
                    bump(&self.stats.unroutable);
                    debug!(
                        "Dropping {:?} for unreachable {}",
                        frame.frame_type, frame.destination
                    );
                    return;
                }
            },
        };
        self.transmit(next_hop, &frame).await;
    }

    /// Sends control traffic queued while a data frame waits for its ack.
    async fn drain_control(&self) {
        while let Some(item) = self.queue.pop_control().await {
            match item {
                Outbound::Frame(queued) => self.transmit_frame(queued).await,
                Outbound::Send(request) => self.queue.push(Outbound::Send(request)).await,
            }
        }
    }

    /// Stop-and-wait: transmits `frame` until it is acknowledged or
    /// `max_tries` is exhausted. Returns whether it was acknowledged.
    async fn deliver_reliably(&self, next_hop: Address, frame: Frame) -> bool {
        let fingerprint = match fingerprint(&frame) {
            Ok(fingerprint) => fingerprint,
            Err(e) => {
                warn!("Cannot track frame for {}: {}", frame.destination, e);
                return false;
            }
        };
        let packet = self.encode(&frame);
        let mut attempt = 1;
        let mut deadline = self.deadline(attempt);
        let mut acked = self
            .pending
            .lock()
            .await
            .register(fingerprint, frame.destination, deadline);
        trace!(
            "Node {} sending {:?} index {} to {} via {}",
            self.address,
            frame.frame_type,
            frame.fragment_index,
            frame.destination,
            next_hop
        );
        self.write_packet(next_hop, &packet).await;

        loop {
            tokio::select! {
                biased;
                result = &mut acked => return result.is_ok(),
                _ = sleep_until(deadline) => {
                    if attempt >= self.config.max_tries {
                        // an ack that raced the deadline already removed the entry
                        return self.pending.lock().await.abandon(&fingerprint).is_none();
                    }
                    attempt += 1;
                    deadline = self.deadline(attempt);
                    if self.pending.lock().await.record_retry(&fingerprint, deadline).is_none() {
                        continue;
                    }
                    bump(&self.stats.retransmissions);
                    debug!(
                        "Node {} retransmitting to {} (attempt {}/{})",
                        self.address, frame.destination, attempt, self.config.max_tries
                    );
                    self.write_packet(next_hop, &packet).await;
                }
                _ = self.queue.wait_ready() => self.drain_control().await,
            }
        }
    }
}
