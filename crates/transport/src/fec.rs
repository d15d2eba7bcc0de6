//! CRC + Reed-Solomon wrapping applied to every frame on the air.
//!
//! `encode` appends a CRC-16 to the frame and runs the result through a
//! systematic Reed-Solomon code in blocks of at most [`MAX_FEC_BLOCK`] bytes.
//! `decode` corrects up to `parity / 2` corrupted bytes per block and only
//! hands data back when the CRC still matches afterwards.

use crc::{Crc, CRC_16_KERMIT};
use reed_solomon::{Decoder, Encoder};

use crate::{MeshError, CRC_LEN, MAX_FEC_BLOCK};

const CHECKSUM: Crc<u16> = Crc::<u16>::new(&CRC_16_KERMIT);

pub fn checksum(data: &[u8]) -> [u8; CRC_LEN] {
    CHECKSUM.checksum(data).to_be_bytes()
}

pub struct ErrorCorrection {
    parity: usize,
    encoder: Encoder,
    decoder: Decoder,
}

impl ErrorCorrection {
    pub fn new(parity: usize) -> Result<Self, MeshError> {
        if parity == 0 || parity >= MAX_FEC_BLOCK - CRC_LEN {
            return Err(MeshError::InvalidConfig(format!(
                "parity byte count {} out of range",
                parity
            )));
        }
        Ok(Self {
            parity,
            encoder: Encoder::new(parity),
            decoder: Decoder::new(parity),
        })
    }

    /// Corrupted bytes per block the code is guaranteed to repair.
    pub fn correctable(&self) -> usize {
        self.parity / 2
    }

    fn block_data_len(&self) -> usize {
        MAX_FEC_BLOCK - self.parity
    }

    /// Bytes on the air for `len` bytes of frame.
    pub fn encoded_len(&self, len: usize) -> usize {
        let protected = len + CRC_LEN;
        let blocks = protected.div_ceil(self.block_data_len());
        protected + blocks * self.parity
    }

    pub fn encode(&self, data: &[u8]) -> Vec<u8> {
        let mut protected = Vec::with_capacity(data.len() + CRC_LEN);
        protected.extend_from_slice(data);
        protected.extend_from_slice(&checksum(data));

        let mut out = Vec::with_capacity(self.encoded_len(data.len()));
        for block in protected.chunks(self.block_data_len()) {
            let encoded = self.encoder.encode(block);
            out.extend_from_slice(encoded.data());
            out.extend_from_slice(encoded.ecc());
        }
        out
    }

    /// Returns `None` for anything uncorrectable or failing the CRC.
    pub fn decode(&self, bytes: &[u8]) -> Option<Vec<u8>> {
        let mut protected = Vec::with_capacity(bytes.len());
        for block in bytes.chunks(MAX_FEC_BLOCK) {
            if block.len() <= self.parity {
                log::trace!("FEC block of {} bytes holds no data", block.len());
                return None;
            }
            let mut block = block.to_vec();
            match self.decoder.correct(&mut block[..], None) {
                Ok(corrected) => protected.extend_from_slice(corrected.data()),
                Err(e) => {
                    log::trace!("Uncorrectable FEC block: {:?}", e);
                    return None;
                }
            }
        }

        if protected.len() < CRC_LEN {
            return None;
        }
        let (data, crc) = protected.split_at(protected.len() - CRC_LEN);
        if checksum(data) != crc {
            log::debug!("CRC mismatch after FEC decode of {} bytes", bytes.len());
            return None;
        }
        Some(data.to_vec())
    }
}
