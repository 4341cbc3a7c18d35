// Copyright 2023. The Sable Project
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met:
//
// 1. Redistributions of source code must retain the above copyright notice, this list of conditions and the following
// disclaimer.
//
// 2. Redistributions in binary form must reproduce the above copyright notice, this list of conditions and the
// following disclaimer in the documentation and/or other materials provided with the distribution.
//
// 3. Neither the name of the copyright holder nor the names of its contributors may be used to endorse or promote
// products derived from this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES,
// INCLUDING, BUT NOT LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
// DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
// SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY,
// WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE
// USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

use bytes::{Buf, BufMut, BytesMut};
use primitive_types::U256;

use crate::{
    common::FixedHash,
    transactions::encoding::{double_sha256, ensure_remaining, read_hash, write_hash, EncodingError},
};

/// The fixed consensus encoding size of a block header.
pub const BLOCK_HEADER_SIZE: usize = 80;

/// The fixed-size record at the head of every block. Identified by the double SHA-256 of its 80 consensus
/// bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: u32,
    pub prev_hash: FixedHash,
    pub merkle_root: FixedHash,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn write(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.version);
        write_hash(buf, &self.prev_hash);
        write_hash(buf, &self.merkle_root);
        buf.put_u32_le(self.timestamp);
        buf.put_u32_le(self.bits);
        buf.put_u32_le(self.nonce);
    }

    pub fn read(buf: &mut impl Buf) -> Result<Self, EncodingError> {
        ensure_remaining(buf, 4)?;
        let version = buf.get_u32_le();
        let prev_hash = read_hash(buf)?;
        let merkle_root = read_hash(buf)?;
        ensure_remaining(buf, 12)?;
        let timestamp = buf.get_u32_le();
        let bits = buf.get_u32_le();
        let nonce = buf.get_u32_le();
        Ok(Self {
            version,
            prev_hash,
            merkle_root,
            timestamp,
            bits,
            nonce,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(BLOCK_HEADER_SIZE);
        self.write(&mut buf);
        buf.to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EncodingError> {
        if bytes.len() != BLOCK_HEADER_SIZE {
            return Err(EncodingError::Invalid(format!(
                "block header must be {} bytes, got {}",
                BLOCK_HEADER_SIZE,
                bytes.len()
            )));
        }
        let mut buf = bytes;
        Self::read(&mut buf)
    }

    pub fn hash(&self) -> FixedHash {
        double_sha256(&self.to_bytes())
    }

    /// The target threshold encoded by the compact `bits` field. `None` when the encoding is negative or
    /// overflows 256 bits.
    pub fn target(&self) -> Option<U256> {
        let exponent = (self.bits >> 24) as usize;
        let mantissa = self.bits & 0x007f_ffff;
        if self.bits & 0x0080_0000 != 0 {
            return None;
        }
        let target = if exponent <= 3 {
            U256::from(mantissa >> (8 * (3 - exponent)))
        } else {
            // A 23-bit mantissa shifted by more than 8 * 29 bits no longer fits in 256 bits
            if exponent > 32 {
                return None;
            }
            U256::from(mantissa) << (8 * (exponent - 3))
        };
        Some(target)
    }

    /// Expected work for this header: floor(2^256 / (target + 1)), the standard chain-work contribution.
    /// Headers with an invalid or zero target contribute no work.
    pub fn work(&self) -> U256 {
        match self.target() {
            Some(target) if !target.is_zero() => {
                // (~target / (target + 1)) + 1 == 2^256 / (target + 1) without overflowing
                (!target / (target + 1)) + 1
            },
            _ => U256::zero(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn header() -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_hash: FixedHash::from([1u8; 32]),
            merkle_root: FixedHash::from([2u8; 32]),
            timestamp: 1_600_000_000,
            bits: 0x1d00_ffff,
            nonce: 42,
        }
    }

    #[test]
    fn encoding_is_exactly_80_bytes_and_roundtrips() {
        let bytes = header().to_bytes();
        assert_eq!(bytes.len(), BLOCK_HEADER_SIZE);
        let decoded = BlockHeader::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, header());
        assert_eq!(decoded.hash(), header().hash());
    }

    #[test]
    fn mainnet_genesis_difficulty_work() {
        // bits 0x1d00ffff is difficulty 1; its work is 2^32 / (1 - 2^-32), just over 2^32
        let work = header().work();
        assert!(work > U256::from(u32::MAX));
        assert!(work < U256::from(u64::from(u32::MAX) + 3));
    }

    #[test]
    fn easier_target_means_less_work() {
        let mut easy = header();
        easy.bits = 0x207f_ffff;
        assert!(easy.work() < header().work());
        assert!(!easy.work().is_zero());
    }

    #[test]
    fn negative_and_overflowing_targets_are_rejected() {
        let mut h = header();
        h.bits = 0x0180_0000;
        assert!(h.target().is_none());
        h.bits = 0xff00_0001;
        assert!(h.target().is_none());
    }
}
