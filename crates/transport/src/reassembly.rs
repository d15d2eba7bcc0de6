//! Fragmentation of oversized payloads and reassembly of inbound sessions.
//!
//! A payload larger than the fragment budget is split into N chunks sent with
//! `fragment_index` N, N-1, ..., 1, followed by a closing fragment with index 0
//! whose one-byte payload repeats N. All fragments share a random nonzero
//! `session_id`. Receivers key sessions by `(source, session_id)` and complete
//! once the closing fragment and every data index are present, in any order.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::framing::{Address, Frame, FrameType};
use crate::MeshError;

/// Data chunks a single session can carry.
pub const MAX_FRAGMENTS: usize = u8::MAX as usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub fragment_index: u8,
    pub session_id: u16,
    pub payload: Vec<u8>,
}

/// Splits `payload` into frames of at most `max_payload` bytes.
pub fn fragment(payload: &[u8], max_payload: usize) -> Result<Vec<Fragment>, MeshError> {
    if max_payload == 0 {
        return Err(MeshError::InvalidConfig("fragment budget must be nonzero".into()));
    }
    if payload.len() <= max_payload {
        return Ok(vec![Fragment {
            fragment_index: 0,
            session_id: 0,
            payload: payload.to_vec(),
        }]);
    }

    let chunk_count = payload.len().div_ceil(max_payload);
    if chunk_count > MAX_FRAGMENTS {
        return Err(MeshError::PayloadTooLarge {
            len: payload.len(),
            max: MAX_FRAGMENTS * max_payload,
        });
    }

    let session_id: u16 = rand::rng().random_range(1..=u16::MAX);
    let mut fragments: Vec<Fragment> = payload
        .chunks(max_payload)
        .enumerate()
        .map(|(i, chunk)| Fragment {
            fragment_index: (chunk_count - i) as u8,
            session_id,
            payload: chunk.to_vec(),
        })
        .collect();

    fragments.push(Fragment {
        fragment_index: 0,
        session_id,
        payload: vec![chunk_count as u8],
    });

    Ok(fragments)
}

struct ReassemblySession {
    frame_type: FrameType,
    source: Address,
    destination: Address,
    ttl: u32,
    fragments: BTreeMap<u8, Vec<u8>>,
    expected: Option<u8>,
    closed: bool,
    created: Instant,
    last_seen: Instant,
}

impl ReassemblySession {
    fn new(frame: &Frame, now: Instant) -> Self {
        Self {
            frame_type: frame.frame_type,
            source: frame.source,
            destination: frame.destination,
            ttl: frame.ttl,
            fragments: BTreeMap::new(),
            expected: None,
            closed: false,
            created: now,
            last_seen: now,
        }
    }

    fn is_complete(&self) -> bool {
        if !self.closed {
            return false;
        }
        let expected = match self.expected {
            Some(n) => n,
            None => match self.fragments.keys().next_back() {
                Some(&highest) => highest,
                None => return false,
            },
        };
        (1..=expected).all(|index| self.fragments.contains_key(&index))
    }

    fn assemble(self) -> Frame {
        let mut payload = Vec::new();
        for chunk in self.fragments.into_values().rev() {
            payload.extend_from_slice(&chunk);
        }
        Frame::new(self.frame_type, self.source, self.destination, self.ttl, payload)
    }
}

pub struct Reassembler {
    sessions: HashMap<(Address, u16), ReassemblySession>,
    timeout: Duration,
}

impl Reassembler {
    pub fn new(timeout: Duration) -> Self {
        Self {
            sessions: HashMap::new(),
            timeout,
        }
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Buffers `frame` and returns the logical frame once its session is whole.
    pub fn accept(&mut self, frame: Frame, now: Instant) -> Option<Frame> {
        if frame.is_self_contained() {
            return Some(frame);
        }

        self.expire(now);

        let key = (frame.source, frame.session_id);
        let session = self
            .sessions
            .entry(key)
            .or_insert_with(|| ReassemblySession::new(&frame, now));
        session.last_seen = now;

        if frame.fragment_index == 0 {
            session.closed = true;
            session.expected = frame.payload.first().copied();
        } else {
            // duplicates overwrite, which keeps retransmissions idempotent
            session.fragments.insert(frame.fragment_index, frame.payload);
        }

        log::trace!(
            "Fragment {} of session {:04x} from {}: {} buffered, closed={}",
            frame.fragment_index,
            key.1,
            key.0,
            session.fragments.len(),
            session.closed
        );

        if !session.is_complete() {
            return None;
        }

        let session = self.sessions.remove(&key)?;
        log::debug!(
            "Reassembled session {:04x} from {} ({} fragments, {:?} after first)",
            key.1,
            key.0,
            session.fragments.len(),
            now.duration_since(session.created)
        );
        Some(session.assemble())
    }

    /// Drops sessions inactive for longer than the reassembly timeout.
    pub fn expire(&mut self, now: Instant) -> usize {
        let timeout = self.timeout;
        let before = self.sessions.len();
        self.sessions.retain(|key, session| {
            if now.duration_since(session.last_seen) >= timeout {
                log::warn!(
                    "Dropping incomplete session {:04x} from {} after {:?} ({} fragments)",
                    key.1,
                    key.0,
                    timeout,
                    session.fragments.len()
                );
                false
            } else {
                true
            }
        });
        before - self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;

    fn frames_for(source: Address, payload: &[u8], budget: usize) -> Vec<Frame> {
        fragment(payload, budget)
            .unwrap()
            .into_iter()
            .map(|f| Frame {
                frame_type: FrameType::Replication,
                source,
                destination: 2,
                ttl: 20,
                fragment_index: f.fragment_index,
                session_id: f.session_id,
                rssi: None,
                payload: f.payload,
            })
            .collect()
    }

    fn feed(reassembler: &mut Reassembler, frames: Vec<Frame>) -> Vec<Frame> {
        let now = Instant::now();
        frames
            .into_iter()
            .filter_map(|frame| reassembler.accept(frame, now))
            .collect()
    }

    #[test]
    fn small_payload_is_one_pseudo_fragment() {
        let fragments = fragment(&[1, 2, 3], 188).unwrap();
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].fragment_index, 0);
        assert_eq!(fragments[0].session_id, 0);

        let exact = fragment(&[7u8; 188], 188).unwrap();
        assert_eq!(exact.len(), 1);
    }

    #[test]
    fn counts_down_to_closing_fragment() {
        let payload: Vec<u8> = (0..820).map(|i| i as u8).collect();
        let fragments = fragment(&payload, 188).unwrap();

        let indices: Vec<u8> = fragments.iter().map(|f| f.fragment_index).collect();
        assert_eq!(indices, vec![5, 4, 3, 2, 1, 0]);

        let session = fragments[0].session_id;
        assert_ne!(session, 0);
        assert!(fragments.iter().all(|f| f.session_id == session));
        assert_eq!(fragments[4].payload.len(), 820 - 4 * 188);
        assert_eq!(fragments[5].payload, vec![5]);
    }

    #[test]
    fn too_many_fragments_rejected() {
        let result = fragment(&vec![0u8; 256 * 10], 10);
        assert!(matches!(result, Err(MeshError::PayloadTooLarge { .. })));
    }

    #[test]
    fn in_order_reassembly() {
        let payload: Vec<u8> = (0..820).map(|i| (i * 3) as u8).collect();
        let mut reassembler = Reassembler::new(Duration::from_secs(30));

        let done = feed(&mut reassembler, frames_for(1, &payload, 188));
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].payload, payload);
        assert_eq!(done[0].source, 1);
        assert!(done[0].is_self_contained());
        assert_eq!(reassembler.open_sessions(), 0);
    }

    #[test]
    fn reverse_and_shuffled_orders_agree() {
        let payload: Vec<u8> = (0..1000).map(|i| (i % 97) as u8).collect();
        let mut rng = rand::rng();

        let mut reversed = frames_for(1, &payload, 64);
        reversed.reverse();
        let mut reassembler = Reassembler::new(Duration::from_secs(30));
        let done = feed(&mut reassembler, reversed);
        assert_eq!(done[0].payload, payload);

        for _ in 0..20 {
            let mut shuffled = frames_for(1, &payload, 64);
            shuffled.shuffle(&mut rng);
            let mut reassembler = Reassembler::new(Duration::from_secs(30));
            let done = feed(&mut reassembler, shuffled);
            assert_eq!(done.len(), 1);
            assert_eq!(done[0].payload, payload);
        }
    }

    #[test]
    fn duplicate_fragments_are_idempotent() {
        let payload = vec![9u8; 300];
        let frames = frames_for(4, &payload, 100);
        let mut with_dupes = frames.clone();
        with_dupes.insert(1, frames[0].clone());
        with_dupes.insert(3, frames[2].clone());

        let mut reassembler = Reassembler::new(Duration::from_secs(30));
        let done = feed(&mut reassembler, with_dupes);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].payload, payload);
    }

    #[test]
    fn sessions_from_different_sources_do_not_mix() {
        let a = vec![0xAAu8; 250];
        let b = vec![0xBBu8; 250];
        let mut frames_a = frames_for(1, &a, 100);
        let mut frames_b = frames_for(2, &b, 100);
        // force a session id collision between the two senders
        for frame in &mut frames_b {
            frame.session_id = frames_a[0].session_id;
        }

        let mut interleaved = Vec::new();
        while !frames_a.is_empty() || !frames_b.is_empty() {
            if !frames_a.is_empty() {
                interleaved.push(frames_a.remove(0));
            }
            if !frames_b.is_empty() {
                interleaved.push(frames_b.remove(0));
            }
        }

        let mut reassembler = Reassembler::new(Duration::from_secs(30));
        let done = feed(&mut reassembler, interleaved);
        assert_eq!(done.len(), 2);
        let from_a = done.iter().find(|f| f.source == 1).unwrap();
        let from_b = done.iter().find(|f| f.source == 2).unwrap();
        assert_eq!(from_a.payload, a);
        assert_eq!(from_b.payload, b);
    }

    #[test]
    fn empty_closing_fragment_uses_highest_index() {
        let payload = vec![5u8; 250];
        let mut frames = frames_for(3, &payload, 100);
        frames.last_mut().unwrap().payload.clear();

        let mut reassembler = Reassembler::new(Duration::from_secs(30));
        let done = feed(&mut reassembler, frames);
        assert_eq!(done[0].payload, payload);
    }

    #[test]
    fn stale_sessions_are_swept() {
        let mut reassembler = Reassembler::new(Duration::from_secs(30));
        let start = Instant::now();
        let frames = frames_for(1, &[1u8; 300], 100);

        assert!(reassembler.accept(frames[0].clone(), start).is_none());
        assert_eq!(reassembler.open_sessions(), 1);

        assert_eq!(reassembler.expire(start + Duration::from_secs(10)), 0);
        assert_eq!(reassembler.expire(start + Duration::from_secs(31)), 1);
        assert_eq!(reassembler.open_sessions(), 0);
    }
}
