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

use std::sync::Arc;

use crate::{
    blocks::{compute_merkle_root, Block, BlockHeader, ChainBlock, ChainHeader, HeaderTree, SharedHeaderTree},
    consensus,
    transactions::{OutPoint, Transaction, TxInput, TxOutput},
};

/// A test chain: the shared header tree plus every built block, indexed by height for the main chain.
pub struct TestChain {
    pub tree: SharedHeaderTree,
    pub blocks: Vec<Arc<ChainBlock>>,
}

/// A coinbase whose script_sig embeds `tag`, so equal-shaped blocks still get distinct hashes.
pub fn coinbase(value: u64, script_pubkey: Vec<u8>, tag: u64) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxInput {
            prevout: OutPoint::null(),
            script_sig: tag.to_le_bytes().to_vec(),
            sequence: u32::MAX,
        }],
        outputs: vec![TxOutput::new(value, script_pubkey)],
        lock_time: 0,
    }
}

/// A transaction spending `prevout` into one output paying `script_pubkey`.
pub fn spend(prevout: OutPoint, value: u64, script_pubkey: Vec<u8>) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxInput {
            prevout,
            script_sig: vec![0x51],
            sequence: u32::MAX,
        }],
        outputs: vec![TxOutput::new(value, script_pubkey)],
        lock_time: 0,
    }
}

/// Build a block on `parent`: a tagged coinbase followed by `txs`.
pub fn make_block(parent: &Arc<ChainHeader>, txs: Vec<Transaction>, tag: u64) -> Block {
    let mut transactions = vec![coinbase(50_000_000, vec![0x51], (parent.height() + 1) << 20 | tag)];
    transactions.extend(txs);
    let header = BlockHeader {
        version: 1,
        prev_hash: *parent.hash(),
        merkle_root: compute_merkle_root(&transactions),
        timestamp: 1_672_531_200 + parent.height() as u32 + 1,
        bits: 0x207f_ffff,
        nonce: tag as u32,
    };
    Block::new(header, transactions)
}

/// A chain holding only the deterministic genesis block.
pub fn genesis_chain() -> TestChain {
    let genesis = consensus::genesis_block().clone();
    let tree = HeaderTree::shared(genesis.header);
    let header = tree
        .read()
        .expect("header tree lock poisoned")
        .genesis()
        .clone();
    TestChain {
        tree,
        blocks: vec![Arc::new(ChainBlock::new(header, Arc::new(genesis)))],
    }
}

/// Genesis plus `length` empty blocks; `blocks[i]` sits at height `i`.
pub fn linear_chain(length: usize) -> TestChain {
    let mut chain = genesis_chain();
    for _ in 0..length {
        add_block(&mut chain, Vec::new(), 0);
    }
    chain
}

/// Append a block with `txs` to the chain's last block.
pub fn add_block(chain: &mut TestChain, txs: Vec<Transaction>, tag: u64) -> Arc<ChainBlock> {
    let parent = chain.blocks.last().expect("chain always has genesis").chain_header().clone();
    let block = make_block(&parent, txs, tag);
    let header = chain
        .tree
        .write()
        .expect("header tree lock poisoned")
        .add_header(block.header)
        .expect("block built on a known parent");
    let entry = Arc::new(ChainBlock::new(header, Arc::new(block)));
    chain.blocks.push(entry.clone());
    entry
}

/// Build a fork of `count` blocks branching off `chain.blocks[fork_at]`. The fork's headers join the shared
/// tree; its blocks are returned without touching the main-chain list.
pub fn extend_fork(chain: &mut TestChain, fork_at: usize, count: usize, tag: u64) -> Vec<Arc<ChainBlock>> {
    let mut parent = chain.blocks[fork_at].chain_header().clone();
    let mut fork = Vec::with_capacity(count);
    for i in 0..count {
        let block = make_block(&parent, Vec::new(), tag * 1000 + i as u64 + 1);
        let header = chain
            .tree
            .write()
            .expect("header tree lock poisoned")
            .add_header(block.header)
            .expect("fork built on a known parent");
        parent = header.clone();
        fork.push(Arc::new(ChainBlock::new(header, Arc::new(block))));
    }
    fork
}
