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

//! Data-plane payload codecs owned by the domain layer: header batches and the locator-based header/block
//! requests. Control-plane payloads live in the comms crate.

use bytes::{Buf, Bytes, BytesMut};

use crate::{
    blocks::{BlockHeader, ChainHeader},
    common::FixedHash,
    transactions::encoding::{read_count, read_hash, write_hash, write_varint, EncodingError, BLOCK_LOCATOR_CAP},
};

use std::sync::Arc;

/// Headers served per `headers` message.
pub const MAX_HEADERS_PER_MESSAGE: usize = 2000;

#[derive(Debug, Clone, Default)]
pub struct HeadersMessage {
    pub headers: Vec<BlockHeader>,
}

impl HeadersMessage {
    pub fn to_payload(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + self.headers.len() * 80);
        write_varint(&mut buf, self.headers.len() as u64);
        for header in &self.headers {
            header.write(&mut buf);
        }
        buf.freeze()
    }

    pub fn from_payload(mut payload: Bytes) -> Result<Self, EncodingError> {
        let count = read_count(&mut payload, MAX_HEADERS_PER_MESSAGE, "header")?;
        let mut headers = Vec::with_capacity(count);
        for _ in 0..count {
            headers.push(BlockHeader::read(&mut payload)?);
        }
        Ok(Self { headers })
    }
}

/// The shared payload of `getheaders` and `getblocks`: a block locator (newest first, sparse toward
/// genesis) plus a stop hash (zero for "as many as allowed").
#[derive(Debug, Clone)]
pub struct GetHeadersMessage {
    pub locator: Vec<FixedHash>,
    pub stop: FixedHash,
}

impl GetHeadersMessage {
    /// The standard locator for a tip: dense for the last blocks, then exponentially sparse, ending at
    /// genesis.
    pub fn with_locator_from(tip: &Arc<ChainHeader>) -> Self {
        let mut locator = Vec::new();
        let mut step = 1u64;
        let mut height = tip.height();
        loop {
            if let Some(header) = tip.ancestor_at_height(height) {
                locator.push(*header.hash());
            }
            if height == 0 || locator.len() >= BLOCK_LOCATOR_CAP {
                break;
            }
            if locator.len() >= 10 {
                step *= 2;
            }
            height = height.saturating_sub(step);
        }
        Self {
            locator,
            stop: FixedHash::zero(),
        }
    }

    pub fn to_payload(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + (self.locator.len() + 1) * 32);
        write_varint(&mut buf, self.locator.len() as u64);
        for hash in &self.locator {
            write_hash(&mut buf, hash);
        }
        write_hash(&mut buf, &self.stop);
        buf.freeze()
    }

    pub fn from_payload(mut payload: Bytes) -> Result<Self, EncodingError> {
        let count = read_count(&mut payload, BLOCK_LOCATOR_CAP, "locator entry")?;
        let mut locator = Vec::with_capacity(count);
        for _ in 0..count {
            locator.push(read_hash(&mut payload)?);
        }
        let stop = read_hash(&mut payload)?;
        Ok(Self { locator, stop })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_helpers::chain;

    #[test]
    fn headers_roundtrip() {
        let chain = chain::linear_chain(3);
        let msg = HeadersMessage {
            headers: chain.blocks.iter().map(|b| b.block().header).collect(),
        };
        let decoded = HeadersMessage::from_payload(msg.to_payload()).unwrap();
        assert_eq!(decoded.headers.len(), 4);
        assert_eq!(decoded.headers[3].hash(), *chain.blocks[3].hash());
    }

    #[test]
    fn locator_is_dense_then_sparse_and_ends_at_genesis() {
        let chain = chain::linear_chain(40);
        let tip = chain.blocks[40].chain_header().clone();
        let msg = GetHeadersMessage::with_locator_from(&tip);

        assert_eq!(msg.locator.first(), Some(tip.hash()));
        assert_eq!(msg.locator.last(), Some(chain.blocks[0].hash()));
        // Sparse enough to not carry the whole chain
        assert!(msg.locator.len() < 25);

        let decoded = GetHeadersMessage::from_payload(msg.to_payload()).unwrap();
        assert_eq!(decoded.locator, msg.locator);
        assert_eq!(decoded.stop, FixedHash::zero());
    }
}
