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

//! Consensus serialization shared by blocks and transactions. The variable-length integer is the same
//! compact-size form used on the wire; hashes are double SHA-256 over the consensus bytes.

use bytes::{Buf, BufMut};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::common::FixedHash;

pub use sable_comms::protocol::encoding::{read_varint, write_varint};

/// Scripts larger than this cannot appear in a valid transaction; the cap bounds decode allocations.
pub const MAX_SCRIPT_SIZE: usize = 10_000;
/// Upper bound on the transaction count decoded from one block.
pub const MAX_TRANSACTIONS_PER_BLOCK: usize = 100_000;
/// Upper bound on inputs/outputs decoded from one transaction.
pub const MAX_TX_IO: usize = 100_000;
/// Upper bound on block-locator entries; an exponential locator over any practical chain stays far below it.
pub const BLOCK_LOCATOR_CAP: usize = 64;

#[derive(Debug, Error)]
pub enum EncodingError {
    #[error("Encoded data ended prematurely")]
    Truncated,
    #[error("Invalid encoding: {0}")]
    Invalid(String),
}

impl From<sable_comms::protocol::ProtocolError> for EncodingError {
    fn from(err: sable_comms::protocol::ProtocolError) -> Self {
        EncodingError::Invalid(err.to_string())
    }
}

pub fn double_sha256(data: &[u8]) -> FixedHash {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    FixedHash::from(out)
}

pub fn ensure_remaining(buf: &impl Buf, needed: usize) -> Result<(), EncodingError> {
    if buf.remaining() < needed {
        return Err(EncodingError::Truncated);
    }
    Ok(())
}

pub fn read_hash(buf: &mut impl Buf) -> Result<FixedHash, EncodingError> {
    ensure_remaining(buf, 32)?;
    let mut bytes = [0u8; 32];
    buf.copy_to_slice(&mut bytes);
    Ok(FixedHash::from(bytes))
}

pub fn write_hash(buf: &mut impl BufMut, hash: &FixedHash) {
    buf.put_slice(hash.as_bytes());
}

pub fn read_count(buf: &mut impl Buf, max: usize, what: &str) -> Result<usize, EncodingError> {
    let count = read_varint(buf)? as usize;
    if count > max {
        return Err(EncodingError::Invalid(format!(
            "{} count {} exceeds the limit of {}",
            what, count, max
        )));
    }
    Ok(count)
}

pub fn write_var_bytes(buf: &mut impl BufMut, bytes: &[u8]) {
    write_varint(buf, bytes.len() as u64);
    buf.put_slice(bytes);
}

pub fn read_var_bytes(buf: &mut impl Buf, max: usize, what: &str) -> Result<Vec<u8>, EncodingError> {
    let len = read_count(buf, max, what)?;
    ensure_remaining(buf, len)?;
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    Ok(bytes)
}

/// The size of `write_varint(n)` in bytes.
pub fn varint_size(n: u64) -> usize {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

#[cfg(test)]
mod test {
    use bytes::BytesMut;

    use super::*;

    #[test]
    fn double_sha256_matches_known_vector() {
        // sha256d("hello") from the reference implementation
        let hash = double_sha256(b"hello");
        assert_eq!(
            hash.to_hex(),
            "9595c9df90075148eb06860365df33584b75bff782a510c6cd4883a419833d50"
        );
    }

    #[test]
    fn var_bytes_respects_cap() {
        let mut buf = BytesMut::new();
        write_var_bytes(&mut buf, &[7u8; 64]);
        let mut rd = buf.freeze();
        assert!(read_var_bytes(&mut rd, 32, "script").is_err());
    }

    #[test]
    fn varint_size_matches_encoding() {
        for n in [0u64, 0xfc, 0xfd, 0xffff, 0x1_0000, u64::from(u32::MAX), u64::MAX] {
            let mut buf = BytesMut::new();
            write_varint(&mut buf, n);
            assert_eq!(buf.len(), varint_size(n));
        }
    }
}
