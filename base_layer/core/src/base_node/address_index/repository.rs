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

//! Persistence for the address indexer: per-address balance-change ledgers, the out-point working set with
//! its write-back cache, per-block rewind records and the indexer tip. All state sits behind one repository
//! lock; disk writes happen on flush, on cache eviction, and immediately for rewind records.
//!
//! Cached out-point entries carry an explicit state machine {clean, dirty, deleted}; the disk action on
//! eviction or flush derives from that state alone.

use std::{
    collections::{HashMap, HashSet},
    num::NonZeroUsize,
    sync::Mutex,
};

use log::*;
use lru::LruCache;
use sable_storage::{KeyValStore, StoreHandle};
use serde::{Deserialize, Serialize};

use crate::{
    base_node::address_index::AddressIndexError,
    chain_storage::store_names,
    common::FixedHash,
    transactions::OutPoint,
};

const LOG_TARGET: &str = "c::bn::address_index::repository";

const KEY_INDEXER_TIP: &[u8] = b"address_index_tip";

/// One balance movement for an address: the block height, the amount and its direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressBalanceChange {
    pub height: u64,
    pub amount: u64,
    pub deposit: bool,
}

impl AddressBalanceChange {
    pub fn signed_amount(&self) -> i64 {
        if self.deposit {
            self.amount as i64
        } else {
            -(self.amount as i64)
        }
    }
}

/// The script and value behind one spendable out-point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutPointRecord {
    pub script_pubkey: Vec<u8>,
    pub value: u64,
}

/// Everything needed to undo one indexed block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRewindRecord {
    pub block_hash: FixedHash,
    pub height: u64,
    /// The out-points this block consumed, with their records, for restoration on reorg.
    pub consumed: Vec<(OutPoint, OutPointRecord)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CacheEntryState {
    Clean,
    Dirty,
    Deleted,
}

#[derive(Debug, Clone)]
struct CachedOutPoint {
    record: OutPointRecord,
    state: CacheEntryState,
}

struct Inner {
    addresses: HashMap<String, Vec<AddressBalanceChange>>,
    dirty_addresses: HashSet<String>,
    outpoints: LruCache<OutPoint, CachedOutPoint>,
    tip: Option<(FixedHash, u64)>,
    tip_dirty: bool,
}

pub struct AddressIndexRepository {
    balances: StoreHandle,
    outpoints: StoreHandle,
    rewinds: StoreHandle,
    metadata: StoreHandle,
    inner: Mutex<Inner>,
}

impl AddressIndexRepository {
    pub fn new(engine: &KeyValStore, outpoint_cache_size: usize) -> Result<Self, AddressIndexError> {
        let metadata = engine.get_handle(store_names::METADATA)?;
        let tip = match metadata.get(KEY_INDEXER_TIP)? {
            Some(bytes) if bytes.len() == 40 => {
                let hash = FixedHash::try_from_bytes(&bytes[..32]).expect("length checked");
                let height = u64::from_le_bytes(bytes[32..40].try_into().expect("length checked"));
                Some((hash, height))
            },
            Some(bytes) => {
                return Err(AddressIndexError::CorruptRecord(format!(
                    "indexer tip record of {} bytes",
                    bytes.len()
                )))
            },
            None => None,
        };
        Ok(Self {
            balances: engine.get_handle(store_names::ADDR_BALANCES)?,
            outpoints: engine.get_handle(store_names::ADDR_OUTPOINTS)?,
            rewinds: engine.get_handle(store_names::ADDR_REWIND)?,
            metadata,
            inner: Mutex::new(Inner {
                addresses: HashMap::new(),
                dirty_addresses: HashSet::new(),
                outpoints: LruCache::new(
                    NonZeroUsize::new(outpoint_cache_size.max(1)).expect("max(1) is non-zero"),
                ),
                tip,
                tip_dirty: false,
            }),
        })
    }

    pub fn indexer_tip(&self) -> Option<(FixedHash, u64)> {
        self.lock().tip
    }

    pub fn set_indexer_tip(&self, hash: FixedHash, height: u64) {
        let mut inner = self.lock();
        inner.tip = Some((hash, height));
        inner.tip_dirty = true;
    }

    pub fn record_change(
        &self,
        address: &str,
        change: AddressBalanceChange,
    ) -> Result<(), AddressIndexError> {
        let loaded = self.load_address_locked(address)?;
        let mut inner = self.lock();
        inner.addresses.entry(address.to_string()).or_insert(loaded).push(change);
        inner.dirty_addresses.insert(address.to_string());
        Ok(())
    }

    /// The balance at `max_height`: the signed sum of every change at or below it.
    pub fn balance_at(&self, address: &str, max_height: u64) -> Result<i64, AddressIndexError> {
        Ok(self
            .balance_changes(address)?
            .iter()
            .filter(|c| c.height <= max_height)
            .map(AddressBalanceChange::signed_amount)
            .sum())
    }

    pub fn balance_changes(&self, address: &str) -> Result<Vec<AddressBalanceChange>, AddressIndexError> {
        let loaded = self.load_address_locked(address)?;
        let inner = self.lock();
        Ok(inner.addresses.get(address).cloned().unwrap_or(loaded))
    }

    /// Reorg support: drop every balance change above the fork height, across all addresses. The caller
    /// must flush first so the engine scan sees the full ledger. Returns the number of affected addresses.
    pub fn trim_balances_above(&self, fork_height: u64) -> Result<usize, AddressIndexError> {
        let mut affected = 0usize;
        for (key, value) in self.balances.scan_prefix(&[])? {
            let mut changes: Vec<AddressBalanceChange> =
                bincode::deserialize(&value).map_err(|e| AddressIndexError::CorruptRecord(e.to_string()))?;
            if changes.iter().all(|c| c.height <= fork_height) {
                continue;
            }
            changes.retain(|c| c.height <= fork_height);
            if changes.is_empty() {
                self.balances.delete(&key)?;
            } else {
                let encoded =
                    bincode::serialize(&changes).map_err(|e| AddressIndexError::CorruptRecord(e.to_string()))?;
                self.balances.insert(&key, &encoded)?;
            }
            affected += 1;
        }
        // Memory copies may predate the trim; drop them so reads reload from the engine
        let mut inner = self.lock();
        inner.addresses.clear();
        inner.dirty_addresses.clear();
        Ok(affected)
    }

    /// Collapse an address's deep history into a synthetic change at height 0. Runs only when the address
    /// holds more than `threshold` changes and its second-oldest change is older than
    /// (tip − trigger distance); never collapses changes inside the reorg window. Irreversible.
    pub fn compact_address(
        &self,
        address: &str,
        consensus_tip_height: u64,
        threshold: usize,
        trigger_distance: u64,
    ) -> Result<bool, AddressIndexError> {
        let changes = self.balance_changes(address)?;
        let safe_height = consensus_tip_height.saturating_sub(trigger_distance);
        let eligible = changes.len() > threshold &&
            changes.get(1).map(|c| c.height < safe_height).unwrap_or(false);
        if !eligible {
            return Ok(false);
        }

        let excess = changes.len() - threshold;
        let safe_cut = changes
            .iter()
            .position(|c| c.height >= safe_height)
            .unwrap_or(changes.len());
        let cut = excess.min(safe_cut);
        if cut == 0 {
            return Ok(false);
        }

        let collapsed_sum: i64 = changes[..cut].iter().map(AddressBalanceChange::signed_amount).sum();
        let mut compacted = Vec::with_capacity(changes.len() - cut + 1);
        compacted.push(AddressBalanceChange {
            height: 0,
            amount: collapsed_sum.unsigned_abs(),
            deposit: collapsed_sum >= 0,
        });
        compacted.extend_from_slice(&changes[cut..]);

        debug!(
            target: LOG_TARGET,
            "Compacted {} change(s) of '{}' into a synthetic base entry", cut, address
        );
        let mut inner = self.lock();
        inner.addresses.insert(address.to_string(), compacted);
        inner.dirty_addresses.insert(address.to_string());
        Ok(true)
    }

    pub fn put_outpoint(&self, outpoint: OutPoint, record: OutPointRecord) -> Result<(), AddressIndexError> {
        let mut inner = self.lock();
        let evicted = inner.outpoints.push(outpoint, CachedOutPoint {
            record,
            state: CacheEntryState::Dirty,
        });
        drop(inner);
        if let Some((key, entry)) = evicted {
            if key != outpoint {
                self.write_evicted(&key, &entry)?;
            }
        }
        Ok(())
    }

    pub fn get_outpoint(&self, outpoint: &OutPoint) -> Result<Option<OutPointRecord>, AddressIndexError> {
        {
            let mut inner = self.lock();
            if let Some(entry) = inner.outpoints.get(outpoint) {
                return Ok(match entry.state {
                    CacheEntryState::Deleted => None,
                    _ => Some(entry.record.clone()),
                });
            }
        }
        let Some(bytes) = self.outpoints.get(&outpoint.to_key_bytes())? else {
            return Ok(None);
        };
        let record: OutPointRecord =
            bincode::deserialize(&bytes).map_err(|e| AddressIndexError::CorruptRecord(e.to_string()))?;
        let mut inner = self.lock();
        let evicted = inner.outpoints.push(*outpoint, CachedOutPoint {
            record: record.clone(),
            state: CacheEntryState::Clean,
        });
        drop(inner);
        if let Some((key, entry)) = evicted {
            if key != *outpoint {
                self.write_evicted(&key, &entry)?;
            }
        }
        Ok(Some(record))
    }

    /// Consume an out-point: return its record and transition the entry to `deleted` so the disk copy is
    /// removed at the next flush or eviction.
    pub fn spend_outpoint(&self, outpoint: &OutPoint) -> Result<Option<OutPointRecord>, AddressIndexError> {
        let record = self.get_outpoint(outpoint)?;
        if record.is_some() {
            let mut inner = self.lock();
            if let Some(entry) = inner.outpoints.get_mut(outpoint) {
                entry.state = CacheEntryState::Deleted;
            }
        }
        Ok(record)
    }

    /// Reorg support: resurrect a consumed out-point.
    pub fn restore_outpoint(&self, outpoint: OutPoint, record: OutPointRecord) -> Result<(), AddressIndexError> {
        self.put_outpoint(outpoint, record)
    }

    /// Rewind records are durable the moment their block is processed.
    pub fn save_rewind_record(&self, record: &AddressRewindRecord) -> Result<(), AddressIndexError> {
        let encoded = bincode::serialize(record).map_err(|e| AddressIndexError::CorruptRecord(e.to_string()))?;
        self.rewinds.insert(&rewind_key(record.height, &record.block_hash), &encoded)?;
        Ok(())
    }

    pub fn rewind_records_above(&self, height: u64) -> Result<Vec<AddressRewindRecord>, AddressIndexError> {
        let mut records = Vec::new();
        for (_, value) in self.rewinds.scan_prefix(&[])? {
            let record: AddressRewindRecord =
                bincode::deserialize(&value).map_err(|e| AddressIndexError::CorruptRecord(e.to_string()))?;
            if record.height > height {
                records.push(record);
            }
        }
        // Newest first: reorgs undo from the top down
        records.sort_by(|a, b| b.height.cmp(&a.height));
        Ok(records)
    }

    pub fn delete_rewind_records_above(&self, height: u64) -> Result<usize, AddressIndexError> {
        self.delete_rewind_records_where(|record_height| record_height > height)
    }

    /// Purge finalized rewind records below `floor` (they can never be replayed once the chain is past the
    /// compaction trigger distance).
    pub fn purge_rewind_records_below(&self, floor: u64) -> Result<usize, AddressIndexError> {
        self.delete_rewind_records_where(|record_height| record_height < floor)
    }

    /// Persist all dirty state: addresses, cached out-point transitions and the tip.
    pub fn flush(&self) -> Result<(), AddressIndexError> {
        let (dirty_addresses, outpoint_ops, tip) = {
            let mut inner = self.lock();
            let dirty_names: Vec<String> = inner.dirty_addresses.drain().collect();
            let dirty = dirty_names
                .into_iter()
                .filter_map(|addr| inner.addresses.get(&addr).map(|changes| (addr, changes.clone())))
                .collect::<Vec<_>>();

            let mut ops = Vec::new();
            let mut deleted_keys = Vec::new();
            for (key, entry) in inner.outpoints.iter() {
                match entry.state {
                    CacheEntryState::Dirty => ops.push((*key, Some(entry.record.clone()))),
                    CacheEntryState::Deleted => {
                        ops.push((*key, None));
                        deleted_keys.push(*key);
                    },
                    CacheEntryState::Clean => {},
                }
            }
            for key in deleted_keys {
                inner.outpoints.pop(&key);
            }
            // Everything still cached is clean after this flush
            for (_, entry) in inner.outpoints.iter_mut() {
                entry.state = CacheEntryState::Clean;
            }
            // The address working set has served its purpose; reads reload on demand
            inner.addresses.clear();

            let tip = if inner.tip_dirty {
                inner.tip_dirty = false;
                inner.tip
            } else {
                None
            };
            (dirty, ops, tip)
        };

        for (address, changes) in &dirty_addresses {
            if changes.is_empty() {
                self.balances.delete(address.as_bytes())?;
            } else {
                let encoded =
                    bincode::serialize(changes).map_err(|e| AddressIndexError::CorruptRecord(e.to_string()))?;
                self.balances.insert(address.as_bytes(), &encoded)?;
            }
        }
        for (outpoint, record) in &outpoint_ops {
            match record {
                Some(record) => {
                    let encoded =
                        bincode::serialize(record).map_err(|e| AddressIndexError::CorruptRecord(e.to_string()))?;
                    self.outpoints.insert(&outpoint.to_key_bytes(), &encoded)?;
                },
                None => self.outpoints.delete(&outpoint.to_key_bytes())?,
            }
        }
        if let Some((hash, height)) = tip {
            let mut bytes = Vec::with_capacity(40);
            bytes.extend_from_slice(hash.as_bytes());
            bytes.extend_from_slice(&height.to_le_bytes());
            self.metadata.insert(KEY_INDEXER_TIP, &bytes)?;
        }
        trace!(
            target: LOG_TARGET,
            "Flushed {} address(es) and {} out-point entr(ies)",
            dirty_addresses.len(),
            outpoint_ops.len()
        );
        Ok(())
    }

    fn delete_rewind_records_where<F: Fn(u64) -> bool>(&self, predicate: F) -> Result<usize, AddressIndexError> {
        let mut deleted = 0usize;
        for (key, value) in self.rewinds.scan_prefix(&[])? {
            let record: AddressRewindRecord =
                bincode::deserialize(&value).map_err(|e| AddressIndexError::CorruptRecord(e.to_string()))?;
            if predicate(record.height) {
                self.rewinds.delete(&key)?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Load an address's persisted changes without mutating the working set.
    fn load_address_locked(&self, address: &str) -> Result<Vec<AddressBalanceChange>, AddressIndexError> {
        {
            let inner = self.lock();
            if let Some(changes) = inner.addresses.get(address) {
                return Ok(changes.clone());
            }
        }
        match self.balances.get(address.as_bytes())? {
            Some(bytes) => {
                bincode::deserialize(&bytes).map_err(|e| AddressIndexError::CorruptRecord(e.to_string()))
            },
            None => Ok(Vec::new()),
        }
    }

    fn write_evicted(&self, outpoint: &OutPoint, entry: &CachedOutPoint) -> Result<(), AddressIndexError> {
        match entry.state {
            CacheEntryState::Dirty => {
                let encoded = bincode::serialize(&entry.record)
                    .map_err(|e| AddressIndexError::CorruptRecord(e.to_string()))?;
                self.outpoints.insert(&outpoint.to_key_bytes(), &encoded)?;
            },
            CacheEntryState::Deleted => self.outpoints.delete(&outpoint.to_key_bytes())?,
            CacheEntryState::Clean => {},
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("address index repository lock poisoned")
    }
}

fn rewind_key(height: u64, block_hash: &FixedHash) -> Vec<u8> {
    let mut key = Vec::with_capacity(40);
    key.extend_from_slice(&height.to_be_bytes());
    key.extend_from_slice(block_hash.as_bytes());
    key
}

#[cfg(test)]
mod test {
    use sable_storage::StoreBuilder;
    use tempfile::TempDir;

    use super::*;

    fn setup(dir: &TempDir, cache: usize) -> AddressIndexRepository {
        let mut builder = StoreBuilder::new(dir.path());
        for name in store_names::all() {
            builder = builder.add_store(name);
        }
        let engine = builder.build().unwrap();
        AddressIndexRepository::new(&engine, cache).unwrap()
    }

    fn change(height: u64, amount: u64, deposit: bool) -> AddressBalanceChange {
        AddressBalanceChange { height, amount, deposit }
    }

    fn op(tag: u8, index: u32) -> OutPoint {
        OutPoint::new(FixedHash::from([tag; 32]), index)
    }

    fn rec(value: u64) -> OutPointRecord {
        OutPointRecord {
            script_pubkey: vec![0x51],
            value,
        }
    }

    #[test]
    fn balances_sum_changes_up_to_a_height() {
        let dir = TempDir::new().unwrap();
        let repo = setup(&dir, 16);
        repo.record_change("addr", change(10, 500, true)).unwrap();
        repo.record_change("addr", change(12, 200, false)).unwrap();
        repo.record_change("addr", change(15, 50, true)).unwrap();

        assert_eq!(repo.balance_at("addr", 9).unwrap(), 0);
        assert_eq!(repo.balance_at("addr", 10).unwrap(), 500);
        assert_eq!(repo.balance_at("addr", 14).unwrap(), 300);
        assert_eq!(repo.balance_at("addr", 100).unwrap(), 350);
    }

    #[test]
    fn state_survives_flush_and_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let repo = setup(&dir, 16);
            repo.record_change("addr", change(5, 42, true)).unwrap();
            repo.put_outpoint(op(1, 0), rec(42)).unwrap();
            repo.set_indexer_tip(FixedHash::from([9u8; 32]), 5);
            repo.flush().unwrap();
        }
        let repo = setup(&dir, 16);
        assert_eq!(repo.indexer_tip().unwrap(), (FixedHash::from([9u8; 32]), 5));
        assert_eq!(repo.balance_at("addr", 10).unwrap(), 42);
        assert_eq!(repo.get_outpoint(&op(1, 0)).unwrap().unwrap().value, 42);
    }

    #[test]
    fn spent_outpoints_disappear_after_flush() {
        let dir = TempDir::new().unwrap();
        let repo = setup(&dir, 16);
        repo.put_outpoint(op(1, 0), rec(10)).unwrap();
        repo.flush().unwrap();

        let spent = repo.spend_outpoint(&op(1, 0)).unwrap();
        assert_eq!(spent.unwrap().value, 10);
        // The deleted state hides the entry immediately
        assert!(repo.get_outpoint(&op(1, 0)).unwrap().is_none());
        repo.flush().unwrap();
        assert!(repo.get_outpoint(&op(1, 0)).unwrap().is_none());
    }

    #[test]
    fn dirty_entries_write_through_on_eviction() {
        let dir = TempDir::new().unwrap();
        let repo = setup(&dir, 2);
        repo.put_outpoint(op(1, 0), rec(1)).unwrap();
        repo.put_outpoint(op(2, 0), rec(2)).unwrap();
        // Evicts op(1, 0), which must land on disk despite never being flushed
        repo.put_outpoint(op(3, 0), rec(3)).unwrap();
        assert_eq!(repo.get_outpoint(&op(1, 0)).unwrap().unwrap().value, 1);
    }

    #[test]
    fn trim_drops_changes_above_the_fork() {
        let dir = TempDir::new().unwrap();
        let repo = setup(&dir, 16);
        repo.record_change("a", change(5, 10, true)).unwrap();
        repo.record_change("a", change(9, 7, true)).unwrap();
        repo.record_change("b", change(9, 3, true)).unwrap();
        repo.flush().unwrap();

        let affected = repo.trim_balances_above(8).unwrap();
        assert_eq!(affected, 2);
        assert_eq!(repo.balance_at("a", 100).unwrap(), 10);
        assert_eq!(repo.balance_at("b", 100).unwrap(), 0);
    }

    #[test]
    fn compaction_collapses_deep_history_only() {
        let dir = TempDir::new().unwrap();
        let repo = setup(&dir, 16);
        for height in 1..=10u64 {
            repo.record_change("a", change(height, 10, true)).unwrap();
        }

        // Tip far ahead: everything old enough, keep the newest 4
        assert!(repo.compact_address("a", 10_000, 4, 600).unwrap());
        let changes = repo.balance_changes("a").unwrap();
        assert_eq!(changes.len(), 5);
        assert_eq!(changes[0].height, 0);
        assert_eq!(changes[0].signed_amount(), 60);
        assert_eq!(repo.balance_at("a", 10_000).unwrap(), 100);

        // Within the reorg window nothing compacts
        let dir2 = TempDir::new().unwrap();
        let repo2 = setup(&dir2, 16);
        for height in 1..=10u64 {
            repo2.record_change("b", change(height, 10, true)).unwrap();
        }
        assert!(!repo2.compact_address("b", 11, 4, 600).unwrap());
    }

    #[test]
    fn rewind_records_filter_by_height() {
        let dir = TempDir::new().unwrap();
        let repo = setup(&dir, 16);
        for height in [3u64, 5, 8] {
            repo.save_rewind_record(&AddressRewindRecord {
                block_hash: FixedHash::from([height as u8; 32]),
                height,
                consumed: vec![(op(height as u8, 0), rec(height))],
            })
            .unwrap();
        }

        let above = repo.rewind_records_above(4).unwrap();
        assert_eq!(above.iter().map(|r| r.height).collect::<Vec<_>>(), vec![8, 5]);

        assert_eq!(repo.delete_rewind_records_above(4).unwrap(), 2);
        assert_eq!(repo.purge_rewind_records_below(4).unwrap(), 1);
        assert!(repo.rewind_records_above(0).unwrap().is_empty());
    }
}
