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

use std::fmt;

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::{
    common::FixedHash,
    transactions::encoding::{
        double_sha256,
        ensure_remaining,
        read_count,
        read_hash,
        read_var_bytes,
        varint_size,
        write_hash,
        write_var_bytes,
        write_varint,
        EncodingError,
        MAX_SCRIPT_SIZE,
        MAX_TX_IO,
    },
};

/// The output index marking a coinbase input's previous out-point.
pub const COINBASE_OUTPUT_INDEX: u32 = u32::MAX;

/// A reference to one spendable output: the funding transaction and the output position within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: FixedHash,
    pub index: u32,
}

impl OutPoint {
    pub fn new(txid: FixedHash, index: u32) -> Self {
        Self { txid, index }
    }

    /// The null out-point found in coinbase inputs.
    pub fn null() -> Self {
        Self {
            txid: FixedHash::zero(),
            index: COINBASE_OUTPUT_INDEX,
        }
    }

    pub fn is_null(&self) -> bool {
        self.index == COINBASE_OUTPUT_INDEX && self.txid == FixedHash::zero()
    }

    /// A 36-byte ordered key for engine lookups: txid then big-endian index.
    pub fn to_key_bytes(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(36);
        key.extend_from_slice(self.txid.as_bytes());
        key.extend_from_slice(&self.index.to_be_bytes());
        key
    }

    pub fn write(&self, buf: &mut impl BufMut) {
        write_hash(buf, &self.txid);
        buf.put_u32_le(self.index);
    }

    pub fn read(buf: &mut impl Buf) -> Result<Self, EncodingError> {
        let txid = read_hash(buf)?;
        ensure_remaining(buf, 4)?;
        let index = buf.get_u32_le();
        Ok(Self { txid, index })
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInput {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl TxInput {
    pub fn write(&self, buf: &mut impl BufMut) {
        self.prevout.write(buf);
        write_var_bytes(buf, &self.script_sig);
        buf.put_u32_le(self.sequence);
    }

    pub fn read(buf: &mut impl Buf) -> Result<Self, EncodingError> {
        let prevout = OutPoint::read(buf)?;
        let script_sig = read_var_bytes(buf, MAX_SCRIPT_SIZE, "script_sig")?;
        ensure_remaining(buf, 4)?;
        let sequence = buf.get_u32_le();
        Ok(Self {
            prevout,
            script_sig,
            sequence,
        })
    }

    fn encoded_size(&self) -> usize {
        36 + varint_size(self.script_sig.len() as u64) + self.script_sig.len() + 4
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    /// Value in the smallest unit.
    pub value: u64,
    pub script_pubkey: Vec<u8>,
}

impl TxOutput {
    pub fn new(value: u64, script_pubkey: Vec<u8>) -> Self {
        Self { value, script_pubkey }
    }

    /// The empty marker output that opens a coinstake transaction.
    pub fn empty_marker() -> Self {
        Self {
            value: 0,
            script_pubkey: Vec::new(),
        }
    }

    pub fn is_empty_marker(&self) -> bool {
        self.value == 0 && self.script_pubkey.is_empty()
    }

    pub fn write(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.value);
        write_var_bytes(buf, &self.script_pubkey);
    }

    pub fn read(buf: &mut impl Buf) -> Result<Self, EncodingError> {
        ensure_remaining(buf, 8)?;
        let value = buf.get_u64_le();
        let script_pubkey = read_var_bytes(buf, MAX_SCRIPT_SIZE, "script_pubkey")?;
        Ok(Self { value, script_pubkey })
    }

    fn encoded_size(&self) -> usize {
        8 + varint_size(self.script_pubkey.len() as u64) + self.script_pubkey.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub lock_time: u32,
}

impl Transaction {
    /// A coinbase transaction spends the null out-point as its only input.
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].prevout.is_null()
    }

    /// A coinstake transaction (proof-of-stake reward) has a real input and opens its outputs with the empty
    /// marker output.
    pub fn is_coinstake(&self) -> bool {
        !self.inputs.is_empty() &&
            !self.inputs[0].prevout.is_null() &&
            self.outputs.len() >= 2 &&
            self.outputs[0].is_empty_marker()
    }

    pub fn txid(&self) -> FixedHash {
        double_sha256(&self.to_bytes())
    }

    pub fn write(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.version);
        write_varint(buf, self.inputs.len() as u64);
        for input in &self.inputs {
            input.write(buf);
        }
        write_varint(buf, self.outputs.len() as u64);
        for output in &self.outputs {
            output.write(buf);
        }
        buf.put_u32_le(self.lock_time);
    }

    pub fn read(buf: &mut impl Buf) -> Result<Self, EncodingError> {
        ensure_remaining(buf, 4)?;
        let version = buf.get_u32_le();
        let num_inputs = read_count(buf, MAX_TX_IO, "input")?;
        let mut inputs = Vec::with_capacity(num_inputs.min(1024));
        for _ in 0..num_inputs {
            inputs.push(TxInput::read(buf)?);
        }
        let num_outputs = read_count(buf, MAX_TX_IO, "output")?;
        let mut outputs = Vec::with_capacity(num_outputs.min(1024));
        for _ in 0..num_outputs {
            outputs.push(TxOutput::read(buf)?);
        }
        ensure_remaining(buf, 4)?;
        let lock_time = buf.get_u32_le();
        Ok(Self {
            version,
            inputs,
            outputs,
            lock_time,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.encoded_size());
        self.write(&mut buf);
        buf.to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EncodingError> {
        let mut buf = bytes;
        let tx = Self::read(&mut buf)?;
        if buf.has_remaining() {
            return Err(EncodingError::Invalid("trailing bytes after transaction".to_string()));
        }
        Ok(tx)
    }

    pub fn encoded_size(&self) -> usize {
        4 + varint_size(self.inputs.len() as u64) +
            self.inputs.iter().map(TxInput::encoded_size).sum::<usize>() +
            varint_size(self.outputs.len() as u64) +
            self.outputs.iter().map(TxOutput::encoded_size).sum::<usize>() +
            4
    }
}

#[cfg(test)]
mod test {
    use super::*;

    pub(crate) fn coinbase(value: u64, script: Vec<u8>) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput {
                prevout: OutPoint::null(),
                script_sig: vec![0x51],
                sequence: u32::MAX,
            }],
            outputs: vec![TxOutput::new(value, script)],
            lock_time: 0,
        }
    }

    #[test]
    fn roundtrip_preserves_txid() {
        let tx = Transaction {
            version: 2,
            inputs: vec![TxInput {
                prevout: OutPoint::new(FixedHash::from([9u8; 32]), 1),
                script_sig: vec![1, 2, 3],
                sequence: 0xffff_fffe,
            }],
            outputs: vec![TxOutput::new(50_000, vec![0x76, 0xa9]), TxOutput::new(7, vec![])],
            lock_time: 101,
        };
        let bytes = tx.to_bytes();
        assert_eq!(bytes.len(), tx.encoded_size());
        let decoded = Transaction::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, tx);
        assert_eq!(decoded.txid(), tx.txid());
    }

    #[test]
    fn coinbase_and_coinstake_classification() {
        let cb = coinbase(100, vec![0xac]);
        assert!(cb.is_coinbase());
        assert!(!cb.is_coinstake());

        let cs = Transaction {
            version: 1,
            inputs: vec![TxInput {
                prevout: OutPoint::new(FixedHash::from([1u8; 32]), 0),
                script_sig: vec![],
                sequence: u32::MAX,
            }],
            outputs: vec![TxOutput::empty_marker(), TxOutput::new(100, vec![0xac])],
            lock_time: 0,
        };
        assert!(cs.is_coinstake());
        assert!(!cs.is_coinbase());
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = coinbase(1, vec![]).to_bytes();
        bytes.push(0);
        assert!(Transaction::from_bytes(&bytes).is_err());
    }

    #[test]
    fn outpoint_key_bytes_order_by_index() {
        let txid = FixedHash::from([3u8; 32]);
        let a = OutPoint::new(txid, 1).to_key_bytes();
        let b = OutPoint::new(txid, 256).to_key_bytes();
        assert!(a < b);
    }
}
