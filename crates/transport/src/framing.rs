//! Wire frame format: a fixed big-endian header followed by raw payload.
//!
//! ```text
//! [type:1][source:2][destination:2][ttl:1-3][fragment_index:1][session_id:2][payload..]
//! ```
//!
//! The radio already delivers discrete packets, so there is no length prefix.

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::MeshError;

pub type Address = u16;

/// Reserved destination that every node in radio range accepts.
pub const BROADCAST: Address = 0xFFFF;

/// Header bytes excluding the variable-width ttl field.
pub const FIXED_HEADER_LEN: usize = 1 + 2 + 2 + 1 + 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameType {
    Discovery = 0x00,
    Measurement = 0x01,
    Config = 0x02,
    Replication = 0x03,
    Acknowledgement = 0x04,
    NodeJoining = 0x06,
    NodeLeaving = 0x07,
    NodeAlive = 0x08,
    RoutingRequest = 0x0d,
    RoutingResponse = 0x0e,
    SyncTime = 0x0f,
}

impl FrameType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Frames that never expect an acknowledgement of their own.
    pub fn is_control(self) -> bool {
        matches!(
            self,
            FrameType::Acknowledgement | FrameType::RoutingRequest | FrameType::RoutingResponse
        )
    }

    pub fn is_routing(self) -> bool {
        matches!(self, FrameType::RoutingRequest | FrameType::RoutingResponse)
    }
}

impl TryFrom<u8> for FrameType {
    type Error = MeshError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x00 => FrameType::Discovery,
            0x01 => FrameType::Measurement,
            0x02 => FrameType::Config,
            0x03 => FrameType::Replication,
            0x04 => FrameType::Acknowledgement,
            0x06 => FrameType::NodeJoining,
            0x07 => FrameType::NodeLeaving,
            0x08 => FrameType::NodeAlive,
            0x0d => FrameType::RoutingRequest,
            0x0e => FrameType::RoutingResponse,
            0x0f => FrameType::SyncTime,
            other => return Err(MeshError::UnknownFrameType(other)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub source: Address,
    pub destination: Address,
    pub ttl: u32,
    /// Countdown within a session; 0 closes it and marks unfragmented frames.
    pub fragment_index: u8,
    /// Nonzero only for frames that belong to a fragmented session.
    pub session_id: u16,
    /// Signal strength of the received packet, never transmitted.
    pub rssi: Option<u8>,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(
        frame_type: FrameType,
        source: Address,
        destination: Address,
        ttl: u32,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            frame_type,
            source,
            destination,
            ttl,
            fragment_index: 0,
            session_id: 0,
            rssi: None,
            payload,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.destination == BROADCAST
    }

    /// True when the frame needs no reassembly.
    pub fn is_self_contained(&self) -> bool {
        self.fragment_index == 0 && self.session_id == 0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    ttl_width: usize,
}

impl FrameCodec {
    pub fn new(ttl_width: usize) -> Result<Self, MeshError> {
        if !(1..=3).contains(&ttl_width) {
            return Err(MeshError::InvalidConfig(format!(
                "ttl_width must be 1..=3, got {}",
                ttl_width
            )));
        }
        Ok(Self { ttl_width })
    }

    pub fn header_len(&self) -> usize {
        FIXED_HEADER_LEN + self.ttl_width
    }

    fn max_ttl(&self) -> u32 {
        (1u32 << (8 * self.ttl_width)) - 1
    }

    /// Serializes `frame`; a ttl wider than the field is clamped to its maximum.
    pub fn serialize(&self, frame: &Frame) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.header_len() + frame.payload.len());
        out.put_u8(frame.frame_type.as_u8());
        out.put_u16(frame.source);
        out.put_u16(frame.destination);
        out.put_uint(u64::from(frame.ttl.min(self.max_ttl())), self.ttl_width);
        out.put_u8(frame.fragment_index);
        out.put_u16(frame.session_id);
        out.extend_from_slice(&frame.payload);
        out
    }

    pub fn deserialize(&self, bytes: &[u8]) -> Result<Frame, MeshError> {
        if bytes.len() < self.header_len() {
            return Err(MeshError::MalformedFrame(bytes.len()));
        }

        let mut buf = bytes;
        let frame_type = FrameType::try_from(buf.get_u8())?;
        let source = buf.get_u16();
        let destination = buf.get_u16();
        let ttl = buf.get_uint(self.ttl_width) as u32;
        let fragment_index = buf.get_u8();
        let session_id = buf.get_u16();

        Ok(Frame {
            frame_type,
            source,
            destination,
            ttl,
            fragment_index,
            session_id,
            rssi: None,
            payload: buf.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(frame_type: FrameType) -> Frame {
        Frame {
            frame_type,
            source: 0x0001,
            destination: 0x00a2,
            ttl: 20,
            fragment_index: 3,
            session_id: 0xbeef,
            rssi: None,
            payload: b"temperature=21.5".to_vec(),
        }
    }

    #[test]
    fn header_layout_is_big_endian() {
        let codec = FrameCodec::new(1).unwrap();
        let bytes = codec.serialize(&sample(FrameType::Measurement));

        assert_eq!(&bytes[..9], &[0x01, 0x00, 0x01, 0x00, 0xa2, 20, 3, 0xbe, 0xef]);
        assert_eq!(&bytes[9..], b"temperature=21.5");
    }

    #[test]
    fn frames_survive_every_ttl_width() {
        for width in 1..=3 {
            let codec = FrameCodec::new(width).unwrap();
            for frame_type in [FrameType::Config, FrameType::RoutingResponse, FrameType::SyncTime] {
                let frame = sample(frame_type);
                let decoded = codec.deserialize(&codec.serialize(&frame)).unwrap();
                assert_eq!(decoded, frame);
            }
        }
    }

    #[test]
    fn empty_payload_broadcast() {
        let codec = FrameCodec::new(3).unwrap();
        let frame = Frame::new(FrameType::NodeAlive, 7, BROADCAST, 1, Vec::new());
        let bytes = codec.serialize(&frame);
        assert_eq!(bytes.len(), codec.header_len());

        let decoded = codec.deserialize(&bytes).unwrap();
        assert!(decoded.is_broadcast());
        assert!(decoded.is_self_contained());
    }

    #[test]
    fn oversized_ttl_is_clamped() {
        let codec = FrameCodec::new(1).unwrap();
        let mut frame = sample(FrameType::Replication);
        frame.ttl = 1000;
        let decoded = codec.deserialize(&codec.serialize(&frame)).unwrap();
        assert_eq!(decoded.ttl, 255);
    }

    #[test]
    fn short_input_is_malformed() {
        let codec = FrameCodec::new(3).unwrap();
        let result = codec.deserialize(&[0x01, 0x00, 0x01, 0x00]);
        assert!(matches!(result, Err(MeshError::MalformedFrame(4))));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let codec = FrameCodec::new(1).unwrap();
        let mut bytes = codec.serialize(&sample(FrameType::Config));
        bytes[0] = 0x05;
        assert!(matches!(codec.deserialize(&bytes), Err(MeshError::UnknownFrameType(0x05))));
    }
}
