//! Stop-and-wait acknowledgement tracking.
//!
//! Every acknowledged unicast frame is identified by a fingerprint both ends
//! compute independently from the frame content. The sender parks a
//! [`PendingSend`] under that fingerprint; the receive path completes it when
//! an acknowledgement carrying the same fingerprint arrives.

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::framing::{Address, Frame};
use crate::MeshError;

pub const FINGERPRINT_LEN: usize = 8;

pub type Fingerprint = [u8; FINGERPRINT_LEN];

#[derive(Serialize)]
struct FingerprintInput<'a> {
    source: Address,
    frame_type: u8,
    destination: Address,
    session_id: u16,
    fragment_index: u8,
    payload: &'a [u8],
}

/// Content fingerprint of a frame; ttl and rssi change in flight and are excluded.
pub fn fingerprint(frame: &Frame) -> Result<Fingerprint, MeshError> {
    let input = FingerprintInput {
        source: frame.source,
        frame_type: frame.frame_type.as_u8(),
        destination: frame.destination,
        session_id: frame.session_id,
        fragment_index: frame.fragment_index,
        payload: &frame.payload,
    };
    let encoded = bincode::serde::encode_to_vec(&input, bincode::config::standard())
        .map_err(|e| MeshError::Encoding(e.to_string()))?;

    let digest = Sha256::digest(&encoded);
    let mut out = [0u8; FINGERPRINT_LEN];
    out.copy_from_slice(&digest[..FINGERPRINT_LEN]);
    Ok(out)
}

pub fn parse_fingerprint(payload: &[u8]) -> Option<Fingerprint> {
    payload.try_into().ok()
}

/// Deadline for the given attempt: linear backoff plus random jitter.
pub fn ack_deadline(
    now: Instant,
    attempt: u32,
    timeout: Duration,
    backoff: Duration,
    jitter: Duration,
) -> Instant {
    let linear = backoff * attempt.saturating_sub(1);
    let jitter = if jitter.is_zero() {
        Duration::ZERO
    } else {
        let millis = jitter.as_millis() as u64;
        Duration::from_millis(rand::rng().random_range(0..=millis))
    };
    now + timeout + linear + jitter
}

#[derive(Debug)]
pub struct PendingSend {
    pub destination: Address,
    pub attempts: u32,
    pub deadline: Instant,
    acked: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
pub struct PendingSends {
    sends: HashMap<Fingerprint, PendingSend>,
}

impl PendingSends {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sends.is_empty()
    }

    /// Registers a send after its first transmission. The receiver resolves
    /// once the matching acknowledgement is observed.
    pub fn register(
        &mut self,
        fingerprint: Fingerprint,
        destination: Address,
        deadline: Instant,
    ) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.sends.insert(
            fingerprint,
            PendingSend {
                destination,
                attempts: 1,
                deadline,
                acked: Some(tx),
            },
        );
        rx
    }

    /// Records a retransmission, returning the attempt count so far.
    pub fn record_retry(&mut self, fingerprint: &Fingerprint, deadline: Instant) -> Option<u32> {
        let send = self.sends.get_mut(fingerprint)?;
        send.attempts += 1;
        send.deadline = deadline;
        Some(send.attempts)
    }

    /// Completes the pending send matching `fingerprint`, if any.
    pub fn acknowledge(&mut self, fingerprint: &Fingerprint) -> bool {
        match self.sends.remove(fingerprint) {
            Some(mut send) => {
                if let Some(tx) = send.acked.take() {
                    let _ = tx.send(());
                }
                true
            }
            None => false,
        }
    }

    pub fn abandon(&mut self, fingerprint: &Fingerprint) -> Option<PendingSend> {
        self.sends.remove(fingerprint)
    }
}
