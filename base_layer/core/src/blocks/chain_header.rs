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

use std::{fmt, sync::Arc};

use primitive_types::U256;

use crate::{
    blocks::{Block, BlockError, BlockHeader},
    common::FixedHash,
};

/// A header annotated with its position in the tree: a strong reference to its parent (none for genesis),
/// its height, and the cumulative work of the chain ending at it.
///
/// Invariants: `header.prev_hash` equals the parent's hash, `height` is the parent's height plus one, and
/// `total_work` never decreases along any root-to-leaf path.
#[derive(Debug, Clone)]
pub struct ChainHeader {
    header: BlockHeader,
    hash: FixedHash,
    height: u64,
    total_work: U256,
    parent: Option<Arc<ChainHeader>>,
}

impl ChainHeader {
    pub fn genesis(header: BlockHeader) -> Arc<Self> {
        let hash = header.hash();
        let total_work = header.work();
        Arc::new(Self {
            header,
            hash,
            height: 0,
            total_work,
            parent: None,
        })
    }

    pub fn with_parent(parent: Arc<ChainHeader>, header: BlockHeader) -> Result<Arc<Self>, BlockError> {
        let hash = header.hash();
        if header.prev_hash != parent.hash {
            return Err(BlockError::MismatchedParent {
                hash,
                claimed: header.prev_hash,
                actual: parent.hash,
            });
        }
        let total_work = parent.total_work + header.work();
        let height = parent.height + 1;
        Ok(Arc::new(Self {
            header,
            hash,
            height,
            total_work,
            parent: Some(parent),
        }))
    }

    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    pub fn hash(&self) -> &FixedHash {
        &self.hash
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn total_work(&self) -> U256 {
        self.total_work
    }

    pub fn parent(&self) -> Option<&Arc<ChainHeader>> {
        self.parent.as_ref()
    }

    pub fn is_genesis(&self) -> bool {
        self.parent.is_none()
    }

    /// Walk parent links to the ancestor at `height`. Returns `None` when `height` exceeds this header's.
    pub fn ancestor_at_height(self: &Arc<Self>, height: u64) -> Option<Arc<ChainHeader>> {
        if height > self.height {
            return None;
        }
        let mut current = self.clone();
        while current.height > height {
            current = current.parent.as_ref()?.clone();
        }
        Some(current)
    }

    /// Whether `ancestor` lies on the path from this header back to genesis (or is this header itself).
    pub fn has_ancestor_or_equal(self: &Arc<Self>, ancestor: &Arc<ChainHeader>) -> bool {
        match self.ancestor_at_height(ancestor.height) {
            Some(at) => at.hash == ancestor.hash,
            None => false,
        }
    }
}

impl PartialEq for ChainHeader {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for ChainHeader {}

impl fmt::Display for ChainHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({})", self.height, self.hash)
    }
}

/// A block paired with its chained header. This is the unit moved through the store queue and published on
/// the event bus.
#[derive(Debug, Clone)]
pub struct ChainBlock {
    header: Arc<ChainHeader>,
    block: Arc<Block>,
}

impl ChainBlock {
    pub fn new(header: Arc<ChainHeader>, block: Arc<Block>) -> Self {
        debug_assert_eq!(header.hash(), &block.hash());
        Self { header, block }
    }

    pub fn chain_header(&self) -> &Arc<ChainHeader> {
        &self.header
    }

    pub fn block(&self) -> &Arc<Block> {
        &self.block
    }

    pub fn hash(&self) -> &FixedHash {
        self.header.hash()
    }

    pub fn height(&self) -> u64 {
        self.header.height()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn header_with_prev(prev: FixedHash, nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_hash: prev,
            merkle_root: FixedHash::zero(),
            timestamp: 0,
            bits: 0x207f_ffff,
            nonce,
        }
    }

    #[test]
    fn heights_and_work_accumulate() {
        let genesis = ChainHeader::genesis(header_with_prev(FixedHash::zero(), 0));
        let one = ChainHeader::with_parent(genesis.clone(), header_with_prev(*genesis.hash(), 1)).unwrap();
        let two = ChainHeader::with_parent(one.clone(), header_with_prev(*one.hash(), 2)).unwrap();

        assert_eq!(two.height(), 2);
        assert!(two.total_work() > one.total_work());
        assert!(one.total_work() > genesis.total_work());
    }

    #[test]
    fn mismatched_parent_is_rejected() {
        let genesis = ChainHeader::genesis(header_with_prev(FixedHash::zero(), 0));
        let stranger = header_with_prev(FixedHash::from([7u8; 32]), 1);
        assert!(matches!(
            ChainHeader::with_parent(genesis, stranger),
            Err(BlockError::MismatchedParent { .. })
        ));
    }

    #[test]
    fn ancestor_walks() {
        let genesis = ChainHeader::genesis(header_with_prev(FixedHash::zero(), 0));
        let mut tip = genesis.clone();
        for nonce in 1..=5 {
            tip = ChainHeader::with_parent(tip.clone(), header_with_prev(*tip.hash(), nonce)).unwrap();
        }
        assert_eq!(tip.ancestor_at_height(0).unwrap().hash(), genesis.hash());
        assert_eq!(tip.ancestor_at_height(5).unwrap().hash(), tip.hash());
        assert!(tip.ancestor_at_height(6).is_none());
        assert!(tip.has_ancestor_or_equal(&genesis));
        assert!(tip.has_ancestor_or_equal(&tip));
        assert!(!genesis.has_ancestor_or_equal(&tip));
    }
}
