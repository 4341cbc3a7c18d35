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

//! A sliding-window lookup from out-point to the height of the rewind record that would restore it,
//! covering the most recent `window` blocks (the maximum reorg depth). Callers use it to answer "how deep
//! would a reorg have to go to resurrect this spent output" without scanning rewind records.

use std::{
    collections::HashMap,
    sync::RwLock,
};

use crate::transactions::OutPoint;

pub struct RewindDataIndex {
    entries: RwLock<HashMap<OutPoint, u64>>,
    window: u64,
}

impl RewindDataIndex {
    pub fn new(window: u64) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            window,
        }
    }

    pub fn window(&self) -> u64 {
        self.window
    }

    /// The earliest height whose rewind record restores this out-point.
    pub fn lookup(&self, outpoint: &OutPoint) -> Option<u64> {
        self.entries
            .read()
            .expect("rewind index lock poisoned")
            .get(outpoint)
            .copied()
    }

    pub fn insert<I: IntoIterator<Item = OutPoint>>(&self, outpoints: I, height: u64) {
        let mut entries = self.entries.write().expect("rewind index lock poisoned");
        for outpoint in outpoints {
            // Keep the earliest restoring height if the outpoint somehow appears twice
            entries
                .entry(outpoint)
                .and_modify(|h| *h = (*h).min(height))
                .or_insert(height);
        }
    }

    /// Drop entries for rewind records above the new tip (called when the coinview rewinds).
    pub fn remove_at_or_above(&self, height: u64) {
        self.entries
            .write()
            .expect("rewind index lock poisoned")
            .retain(|_, h| *h < height);
    }

    /// Slide the window forward: entries older than `tip_height - window` fall out.
    pub fn retain_window(&self, tip_height: u64) {
        let floor = tip_height.saturating_sub(self.window);
        self.entries
            .write()
            .expect("rewind index lock poisoned")
            .retain(|_, h| *h >= floor);
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("rewind index lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::FixedHash;

    fn op(tag: u8, index: u32) -> OutPoint {
        OutPoint::new(FixedHash::from([tag; 32]), index)
    }

    #[test]
    fn lookup_returns_the_restoring_height() {
        let index = RewindDataIndex::new(10);
        index.insert([op(1, 0), op(1, 1)], 100);
        index.insert([op(2, 0)], 101);
        assert_eq!(index.lookup(&op(1, 1)), Some(100));
        assert_eq!(index.lookup(&op(2, 0)), Some(101));
        assert_eq!(index.lookup(&op(3, 0)), None);
    }

    #[test]
    fn rewinding_evicts_entries_above_the_new_tip() {
        let index = RewindDataIndex::new(10);
        index.insert([op(1, 0)], 100);
        index.insert([op(2, 0)], 101);
        index.remove_at_or_above(101);
        assert_eq!(index.lookup(&op(1, 0)), Some(100));
        assert_eq!(index.lookup(&op(2, 0)), None);
    }

    #[test]
    fn window_slides_forward() {
        let index = RewindDataIndex::new(5);
        index.insert([op(1, 0)], 100);
        index.insert([op(2, 0)], 104);
        index.retain_window(106);
        assert_eq!(index.lookup(&op(1, 0)), None);
        assert_eq!(index.lookup(&op(2, 0)), Some(104));
    }
}
