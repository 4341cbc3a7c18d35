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

//! The in-memory tree of every chained header the node knows about. Each leaf is a candidate chain tip;
//! the best tip is the leaf with the greatest cumulative work. Stale branches are pruned once they fall
//! behind the best tip by more than the maximum reorg depth.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, RwLock},
};

use log::*;

use crate::{
    blocks::{BlockError, BlockHeader, ChainHeader},
    common::FixedHash,
};

const LOG_TARGET: &str = "c::bl::header_tree";

pub type SharedHeaderTree = Arc<RwLock<HeaderTree>>;

pub struct HeaderTree {
    headers: HashMap<FixedHash, Arc<ChainHeader>>,
    tips: HashSet<FixedHash>,
    genesis: Arc<ChainHeader>,
    best_tip: Arc<ChainHeader>,
}

impl HeaderTree {
    pub fn new(genesis_header: BlockHeader) -> Self {
        let genesis = ChainHeader::genesis(genesis_header);
        let mut headers = HashMap::new();
        headers.insert(*genesis.hash(), genesis.clone());
        let mut tips = HashSet::new();
        tips.insert(*genesis.hash());
        Self {
            headers,
            tips,
            best_tip: genesis.clone(),
            genesis,
        }
    }

    pub fn shared(genesis_header: BlockHeader) -> SharedHeaderTree {
        Arc::new(RwLock::new(Self::new(genesis_header)))
    }

    pub fn genesis(&self) -> &Arc<ChainHeader> {
        &self.genesis
    }

    pub fn best_tip(&self) -> &Arc<ChainHeader> {
        &self.best_tip
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn contains(&self, hash: &FixedHash) -> bool {
        self.headers.contains_key(hash)
    }

    pub fn get(&self, hash: &FixedHash) -> Option<Arc<ChainHeader>> {
        self.headers.get(hash).cloned()
    }

    /// Link a header under its parent. Adding an already-known header returns the existing entry; a header
    /// whose parent is unknown is an orphan and is rejected.
    pub fn add_header(&mut self, header: BlockHeader) -> Result<Arc<ChainHeader>, BlockError> {
        let hash = header.hash();
        if let Some(existing) = self.headers.get(&hash) {
            return Ok(existing.clone());
        }
        let parent = self
            .headers
            .get(&header.prev_hash)
            .cloned()
            .ok_or(BlockError::OrphanHeader {
                hash,
                prev: header.prev_hash,
            })?;
        let chained = ChainHeader::with_parent(parent, header)?;
        self.tips.remove(&chained.header().prev_hash);
        self.tips.insert(hash);
        if chained.total_work() > self.best_tip.total_work() {
            trace!(
                target: LOG_TARGET,
                "New best tip {} (work {})",
                chained,
                chained.total_work()
            );
            self.best_tip = chained.clone();
        }
        self.headers.insert(hash, chained.clone());
        Ok(chained)
    }

    /// The last header common to both chains. `a` and `b` must be members of this tree.
    pub fn fork_point(&self, a: &Arc<ChainHeader>, b: &Arc<ChainHeader>) -> Arc<ChainHeader> {
        let common_height = a.height().min(b.height());
        let mut left = a
            .ancestor_at_height(common_height)
            .expect("height clamped to both chains");
        let mut right = b
            .ancestor_at_height(common_height)
            .expect("height clamped to both chains");
        while left.hash() != right.hash() {
            let next_left = left.parent().cloned();
            let next_right = right.parent().cloned();
            match (next_left, next_right) {
                (Some(l), Some(r)) => {
                    left = l;
                    right = r;
                },
                // Both chains descend from the same genesis, so this cannot be reached for tree members
                _ => return self.genesis.clone(),
            }
        }
        left
    }

    /// Whether `ancestor_hash` is on the path from `descendant` to genesis (or is `descendant` itself).
    pub fn is_ancestor_or_equal(&self, ancestor_hash: &FixedHash, descendant: &Arc<ChainHeader>) -> bool {
        match self.headers.get(ancestor_hash) {
            Some(ancestor) => descendant.has_ancestor_or_equal(ancestor),
            None => false,
        }
    }

    /// All candidate tips, best first.
    pub fn tips(&self) -> Vec<Arc<ChainHeader>> {
        let mut tips = self
            .tips
            .iter()
            .filter_map(|hash| self.headers.get(hash).cloned())
            .collect::<Vec<_>>();
        tips.sort_by(|a, b| b.total_work().cmp(&a.total_work()));
        tips
    }

    /// Headers along the main chain in `[start_height ..= end_height]`, lowest first.
    pub fn main_chain_range(&self, start_height: u64, end_height: u64) -> Vec<Arc<ChainHeader>> {
        let best = self.best_tip.clone();
        let end = end_height.min(best.height());
        if start_height > end {
            return Vec::new();
        }
        let mut headers = Vec::with_capacity((end - start_height + 1) as usize);
        let mut current = best.ancestor_at_height(end);
        while let Some(header) = current {
            if header.height() < start_height {
                break;
            }
            headers.push(header.clone());
            current = header.parent().cloned();
        }
        headers.reverse();
        headers
    }

    /// Drop branches that can no longer be reorged to: every header that is not an ancestor of the best tip
    /// and lies at or below `best_height - max_reorg_depth`. Returns the number of headers removed.
    pub fn prune_stale_forks(&mut self, max_reorg_depth: u64) -> usize {
        let best = self.best_tip.clone();
        let horizon = best.height().saturating_sub(max_reorg_depth);
        let stale = self
            .headers
            .values()
            .filter(|h| h.height() <= horizon && !best.has_ancestor_or_equal(h))
            .map(|h| *h.hash())
            .collect::<Vec<_>>();
        for hash in &stale {
            self.headers.remove(hash);
            self.tips.remove(hash);
        }
        if !stale.is_empty() {
            debug!(target: LOG_TARGET, "Pruned {} stale fork header(s)", stale.len());
        }
        stale.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn header(prev: FixedHash, nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_hash: prev,
            merkle_root: FixedHash::zero(),
            timestamp: 0,
            bits: 0x207f_ffff,
            nonce,
        }
    }

    fn extend(tree: &mut HeaderTree, from: &Arc<ChainHeader>, count: u32, tag: u32) -> Vec<Arc<ChainHeader>> {
        let mut headers = Vec::new();
        let mut prev = *from.hash();
        for i in 0..count {
            let added = tree.add_header(header(prev, tag * 1000 + i)).unwrap();
            prev = *added.hash();
            headers.push(added);
        }
        headers
    }

    #[test]
    fn orphans_are_rejected_and_duplicates_are_idempotent() {
        let mut tree = HeaderTree::new(header(FixedHash::zero(), 0));
        let orphan = header(FixedHash::from([9u8; 32]), 1);
        assert!(matches!(tree.add_header(orphan), Err(BlockError::OrphanHeader { .. })));

        let genesis = tree.genesis().clone();
        let h = header(*genesis.hash(), 1);
        let first = tree.add_header(h).unwrap();
        let second = tree.add_header(h).unwrap();
        assert_eq!(first.hash(), second.hash());
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn best_tip_follows_cumulative_work() {
        let mut tree = HeaderTree::new(header(FixedHash::zero(), 0));
        let genesis = tree.genesis().clone();
        let short = extend(&mut tree, &genesis, 2, 1);
        assert_eq!(tree.best_tip().hash(), short[1].hash());

        let long = extend(&mut tree, &genesis, 5, 2);
        assert_eq!(tree.best_tip().hash(), long[4].hash());
        assert_eq!(tree.tips().len(), 2);
    }

    #[test]
    fn fork_point_finds_the_common_ancestor() {
        let mut tree = HeaderTree::new(header(FixedHash::zero(), 0));
        let genesis = tree.genesis().clone();
        let trunk = extend(&mut tree, &genesis, 3, 1);
        let branch = extend(&mut tree, &trunk[1], 4, 2);

        let fork = tree.fork_point(&trunk[2], &branch[3]);
        assert_eq!(fork.hash(), trunk[1].hash());
        assert!(tree.is_ancestor_or_equal(fork.hash(), &branch[3]));
        assert!(!tree.is_ancestor_or_equal(trunk[2].hash(), &branch[3]));
    }

    #[test]
    fn main_chain_range_is_ordered_and_clamped() {
        let mut tree = HeaderTree::new(header(FixedHash::zero(), 0));
        let genesis = tree.genesis().clone();
        extend(&mut tree, &genesis, 5, 1);

        let range = tree.main_chain_range(2, 100);
        assert_eq!(range.len(), 4);
        assert_eq!(range[0].height(), 2);
        assert_eq!(range[3].height(), 5);
        assert!(tree.main_chain_range(6, 6).is_empty());
    }

    #[test]
    fn stale_forks_are_pruned_outside_the_reorg_window() {
        let mut tree = HeaderTree::new(header(FixedHash::zero(), 0));
        let genesis = tree.genesis().clone();
        let stale = extend(&mut tree, &genesis, 1, 7);
        extend(&mut tree, &genesis, 10, 1);

        let removed = tree.prune_stale_forks(3);
        assert_eq!(removed, 1);
        assert!(!tree.contains(stale[0].hash()));
        // Genesis is on the main chain and survives
        assert!(tree.contains(genesis.hash()));
    }
}
