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

use crate::{
    blocks::header::BlockHeader,
    common::FixedHash,
    transactions::{
        encoding::{
            double_sha256,
            read_count,
            varint_size,
            write_varint,
            EncodingError,
            MAX_TRANSACTIONS_PER_BLOCK,
        },
        Transaction,
    },
};

/// A header plus its ordered transactions. The first transaction is the coinbase (proof-of-work) or the
/// coinstake marker pair (proof-of-stake). Serialized size is tracked because the store queue and the
/// download scheduler budget by bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Self { header, transactions }
    }

    pub fn hash(&self) -> FixedHash {
        self.header.hash()
    }

    pub fn write(&self, buf: &mut impl BufMut) {
        self.header.write(buf);
        write_varint(buf, self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.write(buf);
        }
    }

    pub fn read(buf: &mut impl Buf) -> Result<Self, EncodingError> {
        let header = BlockHeader::read(buf)?;
        let num_txs = read_count(buf, MAX_TRANSACTIONS_PER_BLOCK, "transaction")?;
        let mut transactions = Vec::with_capacity(num_txs.min(1024));
        for _ in 0..num_txs {
            transactions.push(Transaction::read(buf)?);
        }
        Ok(Self { header, transactions })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.encoded_size());
        self.write(&mut buf);
        buf.to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EncodingError> {
        let mut buf = bytes;
        let block = Self::read(&mut buf)?;
        if buf.has_remaining() {
            return Err(EncodingError::Invalid("trailing bytes after block".to_string()));
        }
        Ok(block)
    }

    pub fn encoded_size(&self) -> usize {
        crate::blocks::header::BLOCK_HEADER_SIZE +
            varint_size(self.transactions.len() as u64) +
            self.transactions.iter().map(Transaction::encoded_size).sum::<usize>()
    }
}

/// The merkle root over the block's transaction ids: pairwise double SHA-256, odd levels duplicate their
/// last entry.
pub fn compute_merkle_root(transactions: &[Transaction]) -> FixedHash {
    if transactions.is_empty() {
        return FixedHash::zero();
    }
    let mut level: Vec<FixedHash> = transactions.iter().map(Transaction::txid).collect();
    while level.len() > 1 {
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        for pair in level.chunks(2) {
            let left = pair[0];
            let right = pair.get(1).copied().unwrap_or(left);
            let mut concat = Vec::with_capacity(64);
            concat.extend_from_slice(left.as_bytes());
            concat.extend_from_slice(right.as_bytes());
            next.push(double_sha256(&concat));
        }
        level = next;
    }
    level[0]
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::transactions::{OutPoint, TxInput, TxOutput};

    fn coinbase(tag: u8) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput {
                prevout: OutPoint::null(),
                script_sig: vec![tag],
                sequence: u32::MAX,
            }],
            outputs: vec![TxOutput::new(50, vec![0xac])],
            lock_time: 0,
        }
    }

    fn block(txs: Vec<Transaction>) -> Block {
        let header = BlockHeader {
            version: 1,
            prev_hash: FixedHash::zero(),
            merkle_root: compute_merkle_root(&txs),
            timestamp: 1_600_000_000,
            bits: 0x207f_ffff,
            nonce: 0,
        };
        Block::new(header, txs)
    }

    #[test]
    fn roundtrip_is_byte_identical() {
        let block = block(vec![coinbase(1), coinbase(2), coinbase(3)]);
        let bytes = block.to_bytes();
        assert_eq!(bytes.len(), block.encoded_size());
        let decoded = Block::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, block);
        assert_eq!(decoded.to_bytes(), bytes);
    }

    #[test]
    fn merkle_root_of_single_transaction_is_its_txid() {
        let tx = coinbase(9);
        assert_eq!(compute_merkle_root(std::slice::from_ref(&tx)), tx.txid());
    }

    #[test]
    fn merkle_root_changes_with_transaction_order() {
        let a = compute_merkle_root(&[coinbase(1), coinbase(2)]);
        let b = compute_merkle_root(&[coinbase(2), coinbase(1)]);
        assert_ne!(a, b);
    }
}
