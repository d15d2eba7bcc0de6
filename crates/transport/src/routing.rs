//! On-demand route discovery, a simplified flood-and-reply AODV.
//!
//! A node missing a route broadcasts a routing request whose payload carries
//! the path walked so far, starting with the requester. Relays append
//! themselves and re-flood (or forward directly when they already know the
//! way); the destination answers with a routing response carrying the full
//! path, which is walked back hop by hop. Every node the response crosses
//! learns the route to the destination through the node it heard it from.
//!
//! Each discovery carries a request id drawn from a per-node counter. The
//! handled-request cache is the only loop breaker: a request is processed at
//! most once per `(requester, destination, request id)` per cache window, so
//! copies of one flood die out while a later discovery for the same
//! destination gets through.
//!
//! The table performs no I/O; it returns [`RoutingAction`]s for the caller
//! to transmit.

use std::collections::HashMap;
use std::time::Duration;

use bytes::{Buf, BufMut};
use tokio::time::Instant;

use crate::framing::{Address, Frame, FrameType, BROADCAST};
use crate::neighbors::NeighborProvider;
use crate::{MeshConfig, MeshError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteLookup {
    NextHop(Address),
    /// Discovery is in flight; retry later.
    Pending,
    /// Discovery timed out without an answer.
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteState {
    Unknown,
    Discovering,
    Known { next_hop: Address, hop_count: u8 },
    Unreachable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingAction {
    Broadcast(Frame),
    Unicast { next_hop: Address, frame: Frame },
}

#[derive(Debug, Clone, Copy)]
pub struct RouteEntry {
    pub next_hop: Address,
    pub hop_count: u8,
    updated: Instant,
}

/// Path carried by routing requests and responses:
/// `[request_id:2][hop_count:1][address:2]*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePath {
    pub request_id: u16,
    pub hop_count: u8,
    pub hops: Vec<Address>,
}

impl RoutePath {
    pub fn new(requester: Address, request_id: u16) -> Self {
        Self {
            request_id,
            hop_count: 0,
            hops: vec![requester],
        }
    }

    pub fn requester(&self) -> Address {
        self.hops[0]
    }

    pub fn endpoint(&self) -> Address {
        self.hops[self.hops.len() - 1]
    }

    pub fn position(&self, address: Address) -> Option<usize> {
        self.hops.iter().position(|hop| *hop == address)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(3 + self.hops.len() * 2);
        out.put_u16(self.request_id);
        out.put_u8(self.hop_count);
        for hop in &self.hops {
            out.put_u16(*hop);
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MeshError> {
        if bytes.len() < 5 || (bytes.len() - 3) % 2 != 0 {
            return Err(MeshError::MalformedRoutePath);
        }
        let mut buf = bytes;
        let request_id = buf.get_u16();
        let hop_count = buf.get_u8();
        let mut hops = Vec::with_capacity(buf.len() / 2);
        while buf.has_remaining() {
            hops.push(buf.get_u16());
        }
        Ok(Self {
            request_id,
            hop_count,
            hops,
        })
    }
}

pub struct RouteTable {
    local: Address,
    default_ttl: u32,
    route_timeout: Duration,
    discovery_timeout: Duration,
    request_cache_timeout: Duration,
    routes: HashMap<Address, RouteEntry>,
    /// Discoveries this node started, by destination.
    pending: HashMap<Address, Instant>,
    /// Destinations whose discovery recently failed.
    unreachable: HashMap<Address, Instant>,
    handled: HashMap<(Address, Address, u16), Instant>,
    next_request_id: u16,
}

impl RouteTable {
    pub fn new(local: Address, config: &MeshConfig) -> Self {
        Self {
            local,
            default_ttl: config.default_ttl,
            route_timeout: config.route_timeout,
            discovery_timeout: config.discovery_timeout,
            request_cache_timeout: config.request_cache_timeout,
            routes: HashMap::new(),
            pending: HashMap::new(),
            unreachable: HashMap::new(),
            handled: HashMap::new(),
            next_request_id: rand::random(),
        }
    }

    pub fn state(&self, destination: Address, now: Instant) -> RouteState {
        if let Some(entry) = self.fresh_route(destination, now) {
            return RouteState::Known {
                next_hop: entry.next_hop,
                hop_count: entry.hop_count,
            };
        }
        if let Some(issued) = self.pending.get(&destination) {
            if now.duration_since(*issued) < self.discovery_timeout {
                return RouteState::Discovering;
            }
            return RouteState::Unreachable;
        }
        match self.unreachable.get(&destination) {
            Some(failed) if now.duration_since(*failed) < self.discovery_timeout => {
                RouteState::Unreachable
            }
            _ => RouteState::Unknown,
        }
    }

    fn fresh_route(&self, destination: Address, now: Instant) -> Option<&RouteEntry> {
        self.routes
            .get(&destination)
            .filter(|entry| now.duration_since(entry.updated) < self.route_timeout)
    }

    /// Records or refreshes a route; shorter or fresher information wins.
    pub fn learn(&mut self, destination: Address, next_hop: Address, hop_count: u8, now: Instant) {
        if destination == self.local || destination == BROADCAST {
            return;
        }
        let route_timeout = self.route_timeout;
        let replace = match self.routes.get(&destination) {
            Some(existing) => {
                existing.next_hop == next_hop
                    || hop_count <= existing.hop_count
                    || now.duration_since(existing.updated) >= route_timeout
            }
            None => true,
        };
        if replace {
            log::debug!(
                "Route to {} via {} ({} hops)",
                destination,
                next_hop,
                hop_count
            );
            self.routes.insert(
                destination,
                RouteEntry {
                    next_hop,
                    hop_count,
                    updated: now,
                },
            );
        }
    }

    /// Forgets a route whose next hop stopped acknowledging.
    pub fn invalidate(&mut self, destination: Address) {
        if let Some(entry) = self.routes.remove(&destination) {
            log::info!(
                "Invalidated route to {} via {}",
                destination,
                entry.next_hop
            );
        }
    }

    /// Resolves the next hop for `destination`, starting a discovery when
    /// nothing is known. The returned action must be transmitted.
    pub fn get_route(
        &mut self,
        destination: Address,
        neighbors: &dyn NeighborProvider,
        now: Instant,
    ) -> (RouteLookup, Option<RoutingAction>) {
        if destination == BROADCAST {
            return (RouteLookup::NextHop(BROADCAST), None);
        }
        if neighbors.is_direct_neighbor(destination) {
            return (RouteLookup::NextHop(destination), None);
        }
        if let Some(entry) = self.fresh_route(destination, now) {
            return (RouteLookup::NextHop(entry.next_hop), None);
        }
        self.routes.remove(&destination);

        if let Some(issued) = self.pending.get(&destination).copied() {
            if now.duration_since(issued) < self.discovery_timeout {
                return (RouteLookup::Pending, None);
            }
            log::warn!(
                "No route to {} after {:?}, giving up",
                destination,
                self.discovery_timeout
            );
            self.pending.remove(&destination);
            self.unreachable.insert(destination, now);
            return (RouteLookup::Unknown, None);
        }

        if let Some(failed) = self.unreachable.get(&destination).copied() {
            if now.duration_since(failed) < self.discovery_timeout {
                return (RouteLookup::Unknown, None);
            }
            self.unreachable.remove(&destination);
        }

        let request_id = self.next_request_id;
        self.next_request_id = request_id.wrapping_add(1);
        log::info!("Sending route request {} for {}", request_id, destination);
        self.pending.insert(destination, now);
        self.handled.insert((self.local, destination, request_id), now);
        let frame = Frame::new(
            FrameType::RoutingRequest,
            self.local,
            destination,
            self.default_ttl,
            RoutePath::new(self.local, request_id).encode(),
        );
        (RouteLookup::Pending, Some(RoutingAction::Broadcast(frame)))
    }

    pub fn handle_routing_request(
        &mut self,
        frame: &Frame,
        neighbors: &dyn NeighborProvider,
        now: Instant,
    ) -> Option<RoutingAction> {
        let mut path = match RoutePath::decode(&frame.payload) {
            Ok(path) => path,
            Err(e) => {
                log::debug!("Dropping routing request from {}: {}", frame.source, e);
                return None;
            }
        };
        let requester = path.requester();
        let target = frame.destination;

        if requester == self.local || path.position(self.local).is_some() {
            return None;
        }

        self.expire_handled(now);
        let key = (requester, target, path.request_id);
        if self.handled.contains_key(&key) {
            log::trace!(
                "Already handled route request {} from {} for {}",
                path.request_id,
                requester,
                target
            );
            return None;
        }
        self.handled.insert(key, now);

        let last_hop = frame.source;
        self.learn(last_hop, last_hop, 1, now);
        self.learn(requester, last_hop, path.hops.len() as u8, now);

        path.hops.push(self.local);

        if target == self.local {
            log::info!("Found a route: {:?}", path.hops);
            let response = Frame::new(
                FrameType::RoutingResponse,
                self.local,
                requester,
                self.default_ttl,
                path.encode(),
            );
            return Some(RoutingAction::Unicast {
                next_hop: last_hop,
                frame: response,
            });
        }

        if frame.ttl <= 1 {
            log::debug!("Route request {} -> {} ran out of ttl", requester, target);
            return None;
        }

        path.hop_count = path.hop_count.saturating_add(1);
        let forwarded = Frame::new(
            FrameType::RoutingRequest,
            self.local,
            target,
            frame.ttl - 1,
            path.encode(),
        );

        let known = if neighbors.is_direct_neighbor(target) {
            Some(target)
        } else {
            self.fresh_route(target, now).map(|entry| entry.next_hop)
        };
        match known {
            Some(next_hop) if next_hop != last_hop => {
                log::debug!("Directing route request for {} to {}", target, next_hop);
                Some(RoutingAction::Unicast {
                    next_hop,
                    frame: forwarded,
                })
            }
            _ => Some(RoutingAction::Broadcast(forwarded)),
        }
    }

    pub fn handle_routing_response(
        &mut self,
        frame: &Frame,
        now: Instant,
    ) -> Option<RoutingAction> {
        let path = match RoutePath::decode(&frame.payload) {
            Ok(path) if path.hops.len() >= 2 => path,
            _ => {
                log::debug!("Dropping malformed routing response from {}", frame.source);
                return None;
            }
        };
        let position = path.position(self.local)?;
        let endpoint = path.endpoint();
        if position + 1 >= path.hops.len() {
            return None;
        }

        let hops_to_endpoint = (path.hops.len() - 1 - position) as u8;
        self.learn(frame.source, frame.source, 1, now);
        self.learn(endpoint, frame.source, hops_to_endpoint, now);

        if position == 0 {
            log::info!("Response route: {:?}", path.hops);
            self.pending.remove(&endpoint);
            self.unreachable.remove(&endpoint);
            return None;
        }

        let previous = path.hops[position - 1];
        self.learn(path.requester(), previous, position as u8, now);

        if frame.ttl <= 1 {
            log::debug!("Route response for {} ran out of ttl", endpoint);
            return None;
        }
        let forwarded = Frame::new(
            FrameType::RoutingResponse,
            self.local,
            path.requester(),
            frame.ttl - 1,
            frame.payload.clone(),
        );
        Some(RoutingAction::Unicast {
            next_hop: previous,
            frame: forwarded,
        })
    }

    fn expire_handled(&mut self, now: Instant) {
        let timeout = self.request_cache_timeout;
        self.handled
            .retain(|_, handled| now.duration_since(*handled) < timeout);
    }

    /// Evicts stale routes, request cache entries and negative entries.
    pub fn expire(&mut self, now: Instant) {
        self.expire_handled(now);
        let route_timeout = self.route_timeout;
        self.routes.retain(|destination, entry| {
            let fresh = now.duration_since(entry.updated) < route_timeout;
            if !fresh {
                log::debug!("Route to {} via {} expired", destination, entry.next_hop);
            }
            fresh
        });
        let discovery_timeout = self.discovery_timeout;
        self.unreachable
            .retain(|_, failed| now.duration_since(*failed) < discovery_timeout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neighbors::StaticNeighbors;

    fn table(local: Address) -> RouteTable {
        RouteTable::new(local, &MeshConfig::default())
    }

    fn request(from: Address, target: Address, hops: &[Address], ttl: u32) -> Frame {
        request_with_id(from, target, hops, ttl, 7)
    }

    fn request_with_id(
        from: Address,
        target: Address,
        hops: &[Address],
        ttl: u32,
        request_id: u16,
    ) -> Frame {
        let path = RoutePath {
            request_id,
            hop_count: (hops.len() - 1) as u8,
            hops: hops.to_vec(),
        };
        Frame::new(FrameType::RoutingRequest, from, target, ttl, path.encode())
    }

    fn response(from: Address, requester: Address, hops: &[Address]) -> Frame {
        let path = RoutePath {
            request_id: 7,
            hop_count: (hops.len() - 2) as u8,
            hops: hops.to_vec(),
        };
        Frame::new(FrameType::RoutingResponse, from, requester, 20, path.encode())
    }

    #[test]
    fn path_encoding() {
        let path = RoutePath {
            request_id: 0x0102,
            hop_count: 2,
            hops: vec![1, 0x00a2, 3],
        };
        let bytes = path.encode();
        assert_eq!(bytes, vec![1, 2, 2, 0x00, 0x01, 0x00, 0xa2, 0x00, 0x03]);
        assert_eq!(RoutePath::decode(&bytes).unwrap(), path);
        assert!(RoutePath::decode(&[0, 0, 0]).is_err());
        assert!(RoutePath::decode(&[0, 0, 0, 1, 2, 3]).is_err());
    }

    #[test]
    fn direct_neighbor_shortcut() {
        let mut routes = table(1);
        let neighbors = StaticNeighbors::new([2]);
        let (lookup, action) = routes.get_route(2, &neighbors, Instant::now());
        assert_eq!(lookup, RouteLookup::NextHop(2));
        assert!(action.is_none());
    }

    #[test]
    fn discovery_floods_once() {
        let mut routes = table(1);
        let neighbors = StaticNeighbors::new([2]);
        let now = Instant::now();

        let (lookup, action) = routes.get_route(9, &neighbors, now);
        assert_eq!(lookup, RouteLookup::Pending);
        match action {
            Some(RoutingAction::Broadcast(frame)) => {
                assert_eq!(frame.frame_type, FrameType::RoutingRequest);
                assert_eq!(frame.destination, 9);
                let path = RoutePath::decode(&frame.payload).unwrap();
                assert_eq!(path.hops, vec![1]);
                assert_eq!(path.hop_count, 0);
            }
            other => panic!("expected a broadcast request, got {:?}", other),
        }
        assert_eq!(routes.state(9, now), RouteState::Discovering);

        let (lookup, action) = routes.get_route(9, &neighbors, now + Duration::from_secs(1));
        assert_eq!(lookup, RouteLookup::Pending);
        assert!(action.is_none());
    }

    #[test]
    fn discovery_timeout_reports_unknown() {
        let mut routes = table(1);
        let neighbors = StaticNeighbors::default();
        let start = Instant::now();
        routes.get_route(9, &neighbors, start);

        let later = start + Duration::from_secs(11);
        assert_eq!(routes.state(9, later), RouteState::Unreachable);
        assert_eq!(routes.get_route(9, &neighbors, later).0, RouteLookup::Unknown);
        assert_eq!(
            routes.get_route(9, &neighbors, later + Duration::from_secs(1)),
            (RouteLookup::Unknown, None)
        );

        // negative entry lapses and discovery restarts
        let retry = later + Duration::from_secs(11);
        let (lookup, action) = routes.get_route(9, &neighbors, retry);
        assert_eq!(lookup, RouteLookup::Pending);
        assert!(matches!(action, Some(RoutingAction::Broadcast(_))));
    }

    #[test]
    fn relay_appends_itself_and_refloods() {
        let mut routes = table(2);
        let neighbors = StaticNeighbors::new([1, 3]);
        let now = Instant::now();

        let action = routes.handle_routing_request(&request(1, 9, &[1], 20), &neighbors, now);
        match action {
            Some(RoutingAction::Broadcast(frame)) => {
                assert_eq!(frame.source, 2);
                assert_eq!(frame.destination, 9);
                assert_eq!(frame.ttl, 19);
                let path = RoutePath::decode(&frame.payload).unwrap();
                assert_eq!(path.hops, vec![1, 2]);
                assert_eq!(path.hop_count, 1);
            }
            other => panic!("expected re-flood, got {:?}", other),
        }
        assert_eq!(
            routes.state(1, now),
            RouteState::Known { next_hop: 1, hop_count: 1 }
        );

        // the same request arriving over another path is ignored
        let again = routes.handle_routing_request(&request(3, 9, &[1, 3], 19), &neighbors, now);
        assert!(again.is_none());
    }

    #[test]
    fn fresh_discovery_passes_the_request_cache() {
        let mut routes = table(2);
        let neighbors = StaticNeighbors::new([1, 3]);
        let now = Instant::now();

        let first = request_with_id(1, 9, &[1], 20, 40);
        assert!(routes.handle_routing_request(&first, &neighbors, now).is_some());
        let echo = request_with_id(3, 9, &[1, 3], 19, 40);
        assert!(routes.handle_routing_request(&echo, &neighbors, now).is_none());

        // the requester lost its route and asks again well inside the window
        let retry = request_with_id(1, 9, &[1], 20, 41);
        let later = now + Duration::from_secs(5);
        assert!(routes.handle_routing_request(&retry, &neighbors, later).is_some());
    }

    #[test]
    fn each_discovery_gets_a_new_request_id() {
        let mut routes = table(1);
        let neighbors = StaticNeighbors::default();
        let start = Instant::now();

        let request_id = |action: Option<RoutingAction>| match action {
            Some(RoutingAction::Broadcast(frame)) => {
                RoutePath::decode(&frame.payload).unwrap().request_id
            }
            other => panic!("expected a broadcast request, got {:?}", other),
        };
        let first = request_id(routes.get_route(9, &neighbors, start).1);

        routes.handle_routing_response(&response(2, 1, &[1, 2, 9]), start);
        routes.invalidate(9);
        let second = request_id(routes.get_route(9, &neighbors, start).1);
        assert_eq!(second, first.wrapping_add(1));
    }

    #[test]
    fn requester_ignores_its_own_echo() {
        let mut routes = table(1);
        let neighbors = StaticNeighbors::new([2]);
        let echo = request(2, 9, &[1, 2], 19);
        assert!(routes
            .handle_routing_request(&echo, &neighbors, Instant::now())
            .is_none());
    }

    #[test]
    fn relay_directs_request_when_route_known() {
        let mut routes = table(2);
        let neighbors = StaticNeighbors::new([1, 3]);
        let now = Instant::now();
        routes.learn(9, 3, 2, now);

        let action = routes.handle_routing_request(&request(1, 9, &[1], 20), &neighbors, now);
        match action {
            Some(RoutingAction::Unicast { next_hop, frame }) => {
                assert_eq!(next_hop, 3);
                assert_eq!(frame.frame_type, FrameType::RoutingRequest);
            }
            other => panic!("expected directed request, got {:?}", other),
        }
    }

    #[test]
    fn exhausted_ttl_stops_the_flood() {
        let mut routes = table(2);
        let neighbors = StaticNeighbors::new([1]);
        let exhausted = request(1, 9, &[1], 1);
        let action = routes.handle_routing_request(&exhausted, &neighbors, Instant::now());
        assert!(action.is_none());
    }

    #[test]
    fn destination_replies_along_the_path() {
        let mut routes = table(9);
        let neighbors = StaticNeighbors::new([3]);
        let now = Instant::now();

        let action = routes.handle_routing_request(&request(3, 9, &[1, 2, 3], 18), &neighbors, now);
        match action {
            Some(RoutingAction::Unicast { next_hop, frame }) => {
                assert_eq!(next_hop, 3);
                assert_eq!(frame.frame_type, FrameType::RoutingResponse);
                assert_eq!(frame.destination, 1);
                let path = RoutePath::decode(&frame.payload).unwrap();
                assert_eq!(path.hops, vec![1, 2, 3, 9]);
            }
            other => panic!("expected a response, got {:?}", other),
        }
        assert_eq!(
            routes.state(1, now),
            RouteState::Known { next_hop: 3, hop_count: 3 }
        );
    }

    #[test]
    fn relay_walks_response_back() {
        let mut routes = table(2);
        let now = Instant::now();

        let action = routes.handle_routing_response(&response(3, 1, &[1, 2, 3, 9]), now);
        match action {
            Some(RoutingAction::Unicast { next_hop, frame }) => {
                assert_eq!(next_hop, 1);
                assert_eq!(frame.source, 2);
                assert_eq!(frame.ttl, 19);
            }
            other => panic!("expected forwarded response, got {:?}", other),
        }
        assert_eq!(
            routes.state(9, now),
            RouteState::Known { next_hop: 3, hop_count: 2 }
        );
        assert_eq!(
            routes.state(1, now),
            RouteState::Known { next_hop: 1, hop_count: 1 }
        );
    }

    #[test]
    fn requester_resolves_pending_discovery() {
        let mut routes = table(1);
        let neighbors = StaticNeighbors::new([2]);
        let now = Instant::now();
        routes.get_route(9, &neighbors, now);

        let action = routes.handle_routing_response(&response(2, 1, &[1, 2, 3, 9]), now);
        assert!(action.is_none());
        assert_eq!(
            routes.get_route(9, &neighbors, now).0,
            RouteLookup::NextHop(2)
        );
        assert_eq!(
            routes.state(9, now),
            RouteState::Known { next_hop: 2, hop_count: 3 }
        );
    }

    #[test]
    fn routes_expire_and_invalidate() {
        let mut routes = table(1);
        let neighbors = StaticNeighbors::default();
        let now = Instant::now();
        routes.learn(9, 2, 3, now);
        routes.learn(8, 2, 2, now);

        routes.invalidate(8);
        assert_eq!(routes.state(8, now), RouteState::Unknown);

        let stale = now + Duration::from_secs(301);
        routes.expire(stale);
        assert_eq!(routes.state(9, stale), RouteState::Unknown);
        assert_eq!(routes.get_route(9, &neighbors, stale).0, RouteLookup::Pending);
    }

    #[test]
    fn longer_routes_do_not_replace_shorter_ones() {
        let mut routes = table(1);
        let now = Instant::now();
        routes.learn(9, 2, 2, now);
        routes.learn(9, 3, 4, now);
        assert_eq!(routes.state(9, now), RouteState::Known { next_hop: 2, hop_count: 2 });
        routes.learn(9, 4, 1, now);
        assert_eq!(routes.state(9, now), RouteState::Known { next_hop: 4, hop_count: 1 });
    }
}
