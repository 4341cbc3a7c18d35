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

//! The unspent-output set. A transaction's surviving outputs collapse into one [`CoinsRecord`]; the set is
//! consistent with exactly one tip hash, advanced under optimistic concurrency by `save_changes` and walked
//! back one block at a time by `rewind` using per-height rewind records.
//!
//! The view is a two-variant stack: a persistent engine-backed layer, optionally wrapped by a cache layer
//! that owns the next-lower layer. Operations dispatch on the variant; walking the stack is a loop over
//! "does this layer wrap another".

use std::{
    collections::BTreeMap,
    num::NonZeroUsize,
    sync::Mutex,
};

use log::*;
use lru::LruCache;
use sable_storage::{KeyValStore, StoreHandle, WriteTransaction};
use serde::{Deserialize, Serialize};

use crate::{
    chain_storage::{rewind_index::RewindDataIndex, store_names, ChainStorageError},
    common::FixedHash,
    transactions::{OutPoint, Transaction},
};

const LOG_TARGET: &str = "c::cs::coinview";

const KEY_COINVIEW_TIP: &[u8] = b"coinview_tip";

/// One spendable output with the metadata needed to judge maturity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub value: u64,
    pub script_pubkey: Vec<u8>,
    /// Height of the block that created this output.
    pub height: u64,
    /// Whether the creating transaction was a coinbase or coinstake (maturity rules apply).
    pub is_reward: bool,
}

/// The surviving outputs of one transaction. `outputs[i] == None` means output `i` has been spent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinsRecord {
    pub txid: FixedHash,
    pub outputs: Vec<Option<Coin>>,
}

impl CoinsRecord {
    pub fn from_transaction(tx: &Transaction, height: u64) -> Self {
        let is_reward = tx.is_coinbase() || tx.is_coinstake();
        let outputs = tx
            .outputs
            .iter()
            .map(|out| {
                if out.is_empty_marker() {
                    None
                } else {
                    Some(Coin {
                        value: out.value,
                        script_pubkey: out.script_pubkey.clone(),
                        height,
                        is_reward,
                    })
                }
            })
            .collect();
        Self {
            txid: tx.txid(),
            outputs,
        }
    }

    /// A record whose outputs are all spent is prunable: it is deleted rather than stored.
    pub fn is_fully_spent(&self) -> bool {
        self.outputs.iter().all(Option::is_none)
    }

    pub fn spend(&mut self, index: u32) -> Option<Coin> {
        self.outputs.get_mut(index as usize).and_then(Option::take)
    }

    pub fn coin(&self, index: u32) -> Option<&Coin> {
        self.outputs.get(index as usize).and_then(Option::as_ref)
    }
}

/// The undo log for one block: everything needed to turn coinview(h) back into coinview(h-1).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewindRecord {
    pub height: u64,
    /// The tip before this block was connected.
    pub previous_tip: FixedHash,
    /// Transactions created by this block; deleted on rewind.
    pub removed_txids: Vec<FixedHash>,
    /// Coins this block spent; restored on rewind.
    pub restored: Vec<(OutPoint, Coin)>,
}

/// Everything `save_changes` applies in one transaction.
#[derive(Debug, Clone, Default)]
pub struct CoinViewChanges {
    /// Records to upsert (or delete, when fully spent), processed in txid order.
    pub modified: Vec<CoinsRecord>,
    /// The pre-change images of the modified records. Carried for callers that want to audit a save;
    /// `save_changes` itself does not consume them (the rewind-data index is fed from `rewind_records`).
    pub originals: Vec<CoinsRecord>,
    pub rewind_records: Vec<RewindRecord>,
}

/// The engine-backed coinview layer.
pub struct PersistentCoinView {
    engine: KeyValStore,
    coins: StoreHandle,
    rewind: StoreHandle,
    metadata: StoreHandle,
    genesis_hash: FixedHash,
    /// Serializes save/rewind so the optimistic tip check and the commit are one critical section.
    write_lock: Mutex<()>,
    rewind_index: Option<RewindDataIndex>,
}

impl PersistentCoinView {
    pub fn new(
        engine: &KeyValStore,
        genesis_hash: FixedHash,
        rewind_index_window: Option<u64>,
    ) -> Result<Self, ChainStorageError> {
        let view = Self {
            engine: engine.clone(),
            coins: engine.get_handle(store_names::COINS)?,
            rewind: engine.get_handle(store_names::REWIND)?,
            metadata: engine.get_handle(store_names::METADATA)?,
            genesis_hash,
            write_lock: Mutex::new(()),
            rewind_index: rewind_index_window.map(RewindDataIndex::new),
        };
        if let Some(index) = &view.rewind_index {
            let tip_height = view.highest_rewind_record()?.map(|(_, rr)| rr.height).unwrap_or(0);
            view.refill_rewind_index(index, tip_height)?;
        }
        Ok(view)
    }

    pub fn get_tip_hash(&self) -> Result<FixedHash, ChainStorageError> {
        match self.metadata.get(KEY_COINVIEW_TIP)? {
            Some(bytes) => FixedHash::try_from_bytes(&bytes).ok_or(ChainStorageError::CorruptRecord {
                store: store_names::METADATA,
                message: format!("coinview tip of {} bytes", bytes.len()),
            }),
            None => Ok(self.genesis_hash),
        }
    }

    pub fn fetch_coins(
        &self,
        txids: &[FixedHash],
    ) -> Result<(FixedHash, Vec<Option<CoinsRecord>>), ChainStorageError> {
        let tip = self.get_tip_hash()?;
        let mut records = Vec::with_capacity(txids.len());
        for txid in txids {
            records.push(self.get_record(txid)?);
        }
        Ok((tip, records))
    }

    pub fn save_changes(
        &self,
        changes: CoinViewChanges,
        old_tip: FixedHash,
        new_tip: FixedHash,
        height: u64,
    ) -> Result<(), ChainStorageError> {
        let _guard = self.write_lock.lock().expect("coinview write lock poisoned");
        let current = self.get_tip_hash()?;
        if current != old_tip {
            return Err(ChainStorageError::InvalidOldTip {
                expected: current,
                given: old_tip,
            });
        }

        let mut modified = changes.modified;
        // The engine rewards writes in key order
        modified.sort_by(|a, b| a.txid.cmp(&b.txid));

        let mut txn = WriteTransaction::new();
        for record in &modified {
            if record.is_fully_spent() {
                txn.delete(&self.coins, record.txid.to_vec());
            } else {
                txn.insert(&self.coins, record.txid.to_vec(), encode(record)?);
            }
        }

        let mut next_sequence = self.next_rewind_sequence()?;
        for record in &changes.rewind_records {
            txn.insert(&self.rewind, next_sequence.to_be_bytes().to_vec(), encode(record)?);
            next_sequence += 1;
        }
        txn.insert(&self.metadata, KEY_COINVIEW_TIP.to_vec(), new_tip.to_vec());
        self.engine.commit(txn)?;

        if let Some(index) = &self.rewind_index {
            for record in &changes.rewind_records {
                index.insert(record.restored.iter().map(|(op, _)| *op), record.height);
            }
            index.retain_window(height);
        }
        trace!(
            target: LOG_TARGET,
            "Coinview advanced to {} at height {} ({} modified record(s))",
            new_tip,
            height,
            modified.len()
        );
        Ok(())
    }

    /// Undo exactly one block. Returns the tip the view now sits at. With no rewind records left, the view
    /// resets to genesis.
    pub fn rewind(&self) -> Result<FixedHash, ChainStorageError> {
        let _guard = self.write_lock.lock().expect("coinview write lock poisoned");
        let Some((sequence, record)) = self.highest_rewind_record()? else {
            self.metadata
                .insert(KEY_COINVIEW_TIP, self.genesis_hash.as_bytes())?;
            return Ok(self.genesis_hash);
        };

        let mut txn = WriteTransaction::new();
        txn.delete(&self.rewind, sequence.to_vec());

        // Restore spent coins, grouped per funding transaction
        let mut by_txid: BTreeMap<FixedHash, Vec<(u32, Coin)>> = BTreeMap::new();
        for (outpoint, coin) in &record.restored {
            by_txid
                .entry(outpoint.txid)
                .or_default()
                .push((outpoint.index, coin.clone()));
        }
        for (txid, coins) in by_txid {
            let mut rec = self.get_record(&txid)?.unwrap_or(CoinsRecord {
                txid,
                outputs: Vec::new(),
            });
            for (index, coin) in coins {
                let index = index as usize;
                if rec.outputs.len() <= index {
                    rec.outputs.resize(index + 1, None);
                }
                rec.outputs[index] = Some(coin);
            }
            txn.insert(&self.coins, txid.to_vec(), encode(&rec)?);
        }
        for txid in &record.removed_txids {
            txn.delete(&self.coins, txid.to_vec());
        }
        txn.insert(&self.metadata, KEY_COINVIEW_TIP.to_vec(), record.previous_tip.to_vec());
        self.engine.commit(txn)?;

        if let Some(index) = &self.rewind_index {
            index.remove_at_or_above(record.height);
            self.refill_rewind_index(index, record.height.saturating_sub(1))?;
        }
        debug!(
            target: LOG_TARGET,
            "Coinview rewound one block to {} (undid height {})", record.previous_tip, record.height
        );
        Ok(record.previous_tip)
    }

    /// The earliest height at which `outpoint` could be restored by a rewind, when the sliding-window index
    /// is enabled.
    pub fn rewind_data_height(&self, outpoint: &OutPoint) -> Option<u64> {
        self.rewind_index.as_ref().and_then(|index| index.lookup(outpoint))
    }

    fn get_record(&self, txid: &FixedHash) -> Result<Option<CoinsRecord>, ChainStorageError> {
        match self.coins.get(txid.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes, store_names::COINS)?)),
            None => Ok(None),
        }
    }

    fn next_rewind_sequence(&self) -> Result<u64, ChainStorageError> {
        Ok(self.highest_rewind_record()?.map(|(seq, _)| seq_to_u64(&seq) + 1).unwrap_or(0))
    }

    fn highest_rewind_record(&self) -> Result<Option<([u8; 8], RewindRecord)>, ChainStorageError> {
        match self.rewind.last()? {
            Some((key, value)) => {
                let sequence: [u8; 8] = key
                    .as_slice()
                    .try_into()
                    .map_err(|_| ChainStorageError::CorruptRecord {
                        store: store_names::REWIND,
                        message: format!("rewind key of {} bytes", key.len()),
                    })?;
                Ok(Some((sequence, decode(&value, store_names::REWIND)?)))
            },
            None => Ok(None),
        }
    }

    fn refill_rewind_index(&self, index: &RewindDataIndex, tip_height: u64) -> Result<(), ChainStorageError> {
        let floor = tip_height.saturating_sub(index.window());
        for (_, value) in self.rewind.scan_prefix(&[])? {
            let record: RewindRecord = decode(&value, store_names::REWIND)?;
            if record.height >= floor && record.height <= tip_height {
                index.insert(record.restored.iter().map(|(op, _)| *op), record.height);
            }
        }
        Ok(())
    }
}

fn seq_to_u64(bytes: &[u8; 8]) -> u64 {
    u64::from_be_bytes(*bytes)
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ChainStorageError> {
    bincode::serialize(value).map_err(|e| ChainStorageError::CorruptRecord {
        store: store_names::COINS,
        message: e.to_string(),
    })
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8], store: &'static str) -> Result<T, ChainStorageError> {
    bincode::deserialize(bytes).map_err(|e| ChainStorageError::CorruptRecord {
        store,
        message: e.to_string(),
    })
}

/// A read cache over the next-lower view layer. The cache owns its inner layer; stacking deeper than one
/// cache is possible but not used in practice.
pub struct CachedCoinView {
    cache: Mutex<LruCache<FixedHash, Option<CoinsRecord>>>,
    inner: Box<CoinView>,
}

impl CachedCoinView {
    pub fn new(inner: CoinView, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("max(1) is non-zero");
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            inner: Box::new(inner),
        }
    }
}

/// The coinview stack. See the module docs for the layering model.
pub enum CoinView {
    Persistent(PersistentCoinView),
    Cached(CachedCoinView),
}

impl CoinView {
    /// The layer below this one, if any.
    pub fn inner(&self) -> Option<&CoinView> {
        match self {
            CoinView::Persistent(_) => None,
            CoinView::Cached(cached) => Some(&cached.inner),
        }
    }

    /// The persistent layer at the bottom of the stack.
    pub fn persistent(&self) -> &PersistentCoinView {
        let mut layer = self;
        loop {
            match layer {
                CoinView::Persistent(view) => return view,
                CoinView::Cached(_) => layer = layer.inner().expect("cached layer always wraps another"),
            }
        }
    }

    pub fn get_tip_hash(&self) -> Result<FixedHash, ChainStorageError> {
        self.persistent().get_tip_hash()
    }

    pub fn fetch_coins(
        &self,
        txids: &[FixedHash],
    ) -> Result<(FixedHash, Vec<Option<CoinsRecord>>), ChainStorageError> {
        match self {
            CoinView::Persistent(view) => view.fetch_coins(txids),
            CoinView::Cached(cached) => {
                let mut records: Vec<Option<Option<CoinsRecord>>> = vec![None; txids.len()];
                let mut misses = Vec::new();
                {
                    let mut cache = cached.cache.lock().expect("coinview cache lock poisoned");
                    for (i, txid) in txids.iter().enumerate() {
                        match cache.get(txid) {
                            Some(hit) => records[i] = Some(hit.clone()),
                            None => misses.push((i, *txid)),
                        }
                    }
                }
                let miss_ids = misses.iter().map(|(_, txid)| *txid).collect::<Vec<_>>();
                let (tip, fetched) = cached.inner.fetch_coins(&miss_ids)?;
                let mut cache = cached.cache.lock().expect("coinview cache lock poisoned");
                for ((i, txid), record) in misses.into_iter().zip(fetched) {
                    cache.put(txid, record.clone());
                    records[i] = Some(record);
                }
                Ok((tip, records.into_iter().map(|r| r.expect("all slots filled")).collect()))
            },
        }
    }

    pub fn save_changes(
        &self,
        changes: CoinViewChanges,
        old_tip: FixedHash,
        new_tip: FixedHash,
        height: u64,
    ) -> Result<(), ChainStorageError> {
        match self {
            CoinView::Persistent(view) => view.save_changes(changes, old_tip, new_tip, height),
            CoinView::Cached(cached) => {
                {
                    let mut cache = cached.cache.lock().expect("coinview cache lock poisoned");
                    for record in &changes.modified {
                        if record.is_fully_spent() {
                            cache.put(record.txid, None);
                        } else {
                            cache.put(record.txid, Some(record.clone()));
                        }
                    }
                }
                cached.inner.save_changes(changes, old_tip, new_tip, height)
            },
        }
    }

    pub fn rewind(&self) -> Result<FixedHash, ChainStorageError> {
        match self {
            CoinView::Persistent(view) => view.rewind(),
            CoinView::Cached(cached) => {
                // Cheapest correct move: drop everything cached and let reads repopulate
                cached.cache.lock().expect("coinview cache lock poisoned").clear();
                cached.inner.rewind()
            },
        }
    }
}
