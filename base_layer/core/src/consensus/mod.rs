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

//! Network constants relevant to chain bookkeeping. The consensus *rules* (script execution, stake
//! validation, difficulty adjustment) live in the external validator; this module only carries the constants
//! the storage and indexing layers depend on.

use once_cell::sync::Lazy;

use crate::{
    blocks::{compute_merkle_root, Block, BlockHeader},
    common::FixedHash,
    transactions::{OutPoint, Transaction, TxInput, TxOutput},
};

#[derive(Debug, Clone)]
pub struct ConsensusConstants {
    /// Blocks deeper than this below the tip are final: they can never be disconnected, so rewind data and
    /// fork branches older than this may be discarded.
    pub max_reorg_depth: u64,
    /// Coinbase and coinstake outputs may not be spent until this many blocks deep.
    pub reward_maturity: u64,
    /// The node considers itself in initial block download while the tip is older than this.
    pub ibd_max_tip_age_secs: u64,
    /// The node considers itself in initial block download while more than this many blocks behind the best
    /// claimed peer height.
    pub ibd_lag_threshold: u64,
}

impl Default for ConsensusConstants {
    fn default() -> Self {
        Self {
            max_reorg_depth: 500,
            reward_maturity: 100,
            ibd_max_tip_age_secs: 24 * 60 * 60,
            ibd_lag_threshold: 144,
        }
    }
}

/// The deterministic genesis block. Every node derives the same block, so the genesis hash never needs to be
/// carried in configuration.
pub fn genesis_block() -> &'static Block {
    static GENESIS: Lazy<Block> = Lazy::new(|| {
        let coinbase = Transaction {
            version: 1,
            inputs: vec![TxInput {
                prevout: OutPoint::null(),
                script_sig: b"The beginning of the Sable chain".to_vec(),
                sequence: u32::MAX,
            }],
            // The genesis reward is unspendable by convention
            outputs: vec![TxOutput::new(0, vec![0x6a])],
            lock_time: 0,
        };
        let transactions = vec![coinbase];
        let header = BlockHeader {
            version: 1,
            prev_hash: FixedHash::zero(),
            merkle_root: compute_merkle_root(&transactions),
            timestamp: 1_672_531_200,
            bits: 0x1f00_ffff,
            nonce: 0,
        };
        Block::new(header, transactions)
    });
    &GENESIS
}

pub fn genesis_hash() -> FixedHash {
    genesis_block().hash()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn genesis_is_deterministic_and_well_formed() {
        let block = genesis_block();
        assert_eq!(block.hash(), genesis_hash());
        assert_eq!(block.header.prev_hash, FixedHash::zero());
        assert_eq!(block.header.merkle_root, compute_merkle_root(&block.transactions));
        assert!(block.transactions[0].is_coinbase());
    }

    #[test]
    fn compaction_distance_exceeds_reorg_depth() {
        // The address indexer's irreversible compaction depends on this relationship
        let constants = ConsensusConstants::default();
        assert!(constants.max_reorg_depth > constants.reward_maturity);
    }
}
