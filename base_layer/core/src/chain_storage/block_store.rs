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

//! The block store and its write queue. Incoming blocks land in a FIFO queue and an in-memory pending map
//! that serves reads immediately; a single writer task drains the queue into batches and commits each batch
//! in one engine transaction, resolving reorgs by deleting the abandoned stored suffix first. Entries that
//! do not chain are dropped from the batch, never reordered; the download scheduler fetches them again.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::Duration,
};

use log::*;
use sable_shutdown::ShutdownSignal;
use sable_storage::{KeyValStore, StoreHandle, WriteTransaction};
use tokio::sync::{mpsc, Notify};

use crate::{
    blocks::{Block, ChainBlock, SharedHeaderTree},
    chain_storage::{store_names, ChainStorageError},
    common::FixedHash,
    events::{EventBus, NodeEvent},
};

const LOG_TARGET: &str = "c::cs::block_store";

/// Maximum time a batch may accumulate before it is flushed. A prime number of seconds, so this flush does
/// not fall into lockstep with other periodic tasks.
pub const BLOCK_STORE_FLUSH_INTERVAL: Duration = Duration::from_secs(17);

const KEY_STORE_TIP: &[u8] = b"block_store_tip";
const KEY_PRUNED_TIP: &[u8] = b"block_store_pruned_tip";
const KEY_TX_INDEX_ENABLED: &[u8] = b"tx_index_enabled";

#[derive(Debug, Clone)]
pub struct BlockStoreConfig {
    /// Flush the current batch once its serialized size reaches this many bytes.
    pub max_batch_bytes: usize,
    /// When set, keep only this many blocks below the store tip and prune the rest.
    pub blocks_to_keep: Option<u64>,
    /// Maintain the per-transaction index (txid to block hash).
    pub tx_index: bool,
}

impl Default for BlockStoreConfig {
    fn default() -> Self {
        Self {
            max_batch_bytes: 5 * 1024 * 1024,
            blocks_to_keep: None,
            tx_index: false,
        }
    }
}

/// Engine-level block persistence. All mutation goes through single atomic transactions; the queue above it
/// is the only writer at runtime.
pub struct BlockStoreDatabase {
    engine: KeyValStore,
    blocks: StoreHandle,
    tx_index: StoreHandle,
    metadata: StoreHandle,
    genesis_hash: FixedHash,
    config: BlockStoreConfig,
}

impl BlockStoreDatabase {
    pub fn new(
        engine: &KeyValStore,
        genesis_hash: FixedHash,
        config: BlockStoreConfig,
    ) -> Result<Self, ChainStorageError> {
        Ok(Self {
            engine: engine.clone(),
            blocks: engine.get_handle(store_names::BLOCKS)?,
            tx_index: engine.get_handle(store_names::TX_INDEX)?,
            metadata: engine.get_handle(store_names::METADATA)?,
            genesis_hash,
            config,
        })
    }

    /// Startup recovery. Must run before the consensus tip is set: a store tip unknown to the header tree is
    /// walked back (deleting blocks) until a known header is reached, which would be unsound once the
    /// coinview has an established tip. Also rejects toggling the transaction index on a non-empty store.
    pub fn initialize(&self, tree: &SharedHeaderTree, consensus_tip_set: bool) -> Result<(), ChainStorageError> {
        if consensus_tip_set {
            return Err(ChainStorageError::InitializationFailed(
                "the consensus tip is already set; store recovery would make rewinding impossible".to_string(),
            ));
        }

        let store_is_empty = self.blocks.is_empty()?;
        if let Some(flag) = self.metadata.get(KEY_TX_INDEX_ENABLED)? {
            let was_enabled = flag == [1];
            if was_enabled != self.config.tx_index && !store_is_empty {
                return Err(ChainStorageError::InitializationFailed(
                    "toggling the transaction index on a non-empty block store requires a full reindex".to_string(),
                ));
            }
        }
        self.metadata
            .insert(KEY_TX_INDEX_ENABLED, &[u8::from(self.config.tx_index)])?;

        let (mut tip_hash, _) = self.store_tip()?;
        let mut removed = 0usize;
        loop {
            let known = {
                let tree = tree.read().expect("header tree lock poisoned");
                tree.contains(&tip_hash)
            };
            if known {
                break;
            }
            let block = self
                .get_block(&tip_hash)?
                .ok_or(ChainStorageError::BlockNotFound(tip_hash))?;
            let mut txn = WriteTransaction::new();
            self.delete_block_in_txn(&mut txn, &tip_hash, &block);
            self.engine.commit(txn)?;
            removed += 1;
            tip_hash = block.header.prev_hash;
        }
        if removed > 0 {
            warn!(
                target: LOG_TARGET,
                "Store recovery removed {} block(s) unknown to the header tree; tip is now {}", removed, tip_hash
            );
        }
        let height = {
            let tree = tree.read().expect("header tree lock poisoned");
            tree.get(&tip_hash)
                .map(|h| h.height())
                .ok_or(ChainStorageError::BlockNotFound(tip_hash))?
        };
        self.set_store_tip_standalone(tip_hash, height)?;
        Ok(())
    }

    pub fn store_tip(&self) -> Result<(FixedHash, u64), ChainStorageError> {
        match self.metadata.get(KEY_STORE_TIP)? {
            Some(bytes) if bytes.len() == 40 => {
                let hash = FixedHash::try_from_bytes(&bytes[..32]).expect("length checked");
                let height = u64::from_le_bytes(bytes[32..40].try_into().expect("length checked"));
                Ok((hash, height))
            },
            Some(bytes) => Err(ChainStorageError::CorruptRecord {
                store: store_names::METADATA,
                message: format!("store tip record of {} bytes", bytes.len()),
            }),
            None => Ok((self.genesis_hash, 0)),
        }
    }

    pub fn pruned_tip(&self) -> Result<u64, ChainStorageError> {
        match self.metadata.get(KEY_PRUNED_TIP)? {
            Some(bytes) if bytes.len() == 8 => Ok(u64::from_le_bytes(bytes.try_into().expect("length checked"))),
            Some(bytes) => Err(ChainStorageError::CorruptRecord {
                store: store_names::METADATA,
                message: format!("pruned tip record of {} bytes", bytes.len()),
            }),
            None => Ok(0),
        }
    }

    pub fn get_block(&self, hash: &FixedHash) -> Result<Option<Block>, ChainStorageError> {
        match self.blocks.get(hash.as_bytes())? {
            Some(bytes) => Ok(Some(Block::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn contains_block(&self, hash: &FixedHash) -> Result<bool, ChainStorageError> {
        Ok(self.blocks.exists(hash.as_bytes())?)
    }

    pub fn get_block_hash_by_txid(&self, txid: &FixedHash) -> Result<Option<FixedHash>, ChainStorageError> {
        if !self.config.tx_index {
            return Err(ChainStorageError::TransactionIndexDisabled);
        }
        match self.tx_index.get(txid.as_bytes())? {
            Some(bytes) => Ok(FixedHash::try_from_bytes(&bytes)
                .map(Some)
                .ok_or(ChainStorageError::CorruptRecord {
                    store: store_names::TX_INDEX,
                    message: format!("block hash of {} bytes", bytes.len()),
                })?),
            None => Ok(None),
        }
    }

    /// Walk the stored chain back from `from` collecting block hashes until `expected` is reached. These are
    /// the blocks a reorg must delete. `from == expected` yields an empty list.
    pub fn collect_reorg_deletes(
        &self,
        from: FixedHash,
        expected: FixedHash,
    ) -> Result<Vec<FixedHash>, ChainStorageError> {
        let mut deletes = Vec::new();
        let mut cursor = from;
        while cursor != expected {
            let block = self
                .get_block(&cursor)?
                .ok_or(ChainStorageError::BrokenStoredChain { from, expected })?;
            deletes.push(cursor);
            cursor = block.header.prev_hash;
            if cursor == self.genesis_hash && expected != self.genesis_hash {
                return Err(ChainStorageError::BrokenStoredChain { from, expected });
            }
        }
        Ok(deletes)
    }

    /// Commit one cleaned batch: reorg deletions, block writes, optional transaction-index writes and the
    /// tip update, all in a single engine transaction.
    pub fn write_cleaned_batch(
        &self,
        deletes: &[FixedHash],
        batch: &[Arc<ChainBlock>],
        new_tip: (FixedHash, u64),
    ) -> Result<(), ChainStorageError> {
        let mut txn = WriteTransaction::new();
        for hash in deletes {
            let block = self
                .get_block(hash)?
                .ok_or(ChainStorageError::BlockNotFound(*hash))?;
            self.delete_block_in_txn(&mut txn, hash, &block);
        }
        for entry in batch {
            txn.insert(&self.blocks, entry.hash().to_vec(), entry.block().to_bytes());
            if self.config.tx_index {
                for tx in &entry.block().transactions {
                    txn.insert(&self.tx_index, tx.txid().to_vec(), entry.hash().to_vec());
                }
            }
        }
        let mut tip_bytes = Vec::with_capacity(40);
        tip_bytes.extend_from_slice(new_tip.0.as_bytes());
        tip_bytes.extend_from_slice(&new_tip.1.to_le_bytes());
        txn.insert(&self.metadata, KEY_STORE_TIP.to_vec(), tip_bytes);
        self.engine.commit(txn)?;
        Ok(())
    }

    /// Delete main-chain blocks below (tip - blocks_to_keep), then compact the affected stores. Compaction
    /// completes before this returns. Returns the number of blocks pruned.
    pub fn prune(&self, tree: &SharedHeaderTree) -> Result<usize, ChainStorageError> {
        let Some(keep) = self.config.blocks_to_keep else {
            return Ok(0);
        };
        let (_, tip_height) = self.store_tip()?;
        let target = tip_height.saturating_sub(keep);
        let previous = self.pruned_tip()?;
        if target <= previous {
            return Ok(0);
        }

        let to_prune = {
            let tree = tree.read().expect("header tree lock poisoned");
            tree.main_chain_range(previous.max(1), target)
                .iter()
                .map(|h| *h.hash())
                .collect::<Vec<_>>()
        };
        let mut txn = WriteTransaction::new();
        let mut pruned = 0usize;
        for hash in &to_prune {
            if let Some(block) = self.get_block(hash)? {
                self.delete_block_in_txn(&mut txn, hash, &block);
                pruned += 1;
            }
        }
        txn.insert(&self.metadata, KEY_PRUNED_TIP.to_vec(), target.to_le_bytes().to_vec());
        self.engine.commit(txn)?;

        self.engine.compact(store_names::BLOCKS)?;
        if self.config.tx_index {
            self.engine.compact(store_names::TX_INDEX)?;
        }
        info!(
            target: LOG_TARGET,
            "Pruned {} block(s); pruned tip advanced to height {}", pruned, target
        );
        Ok(pruned)
    }

    fn delete_block_in_txn(&self, txn: &mut WriteTransaction, hash: &FixedHash, block: &Block) {
        txn.delete(&self.blocks, hash.to_vec());
        if self.config.tx_index {
            for tx in &block.transactions {
                txn.delete(&self.tx_index, tx.txid().to_vec());
            }
        }
    }

    fn set_store_tip_standalone(&self, hash: FixedHash, height: u64) -> Result<(), ChainStorageError> {
        let mut bytes = Vec::with_capacity(40);
        bytes.extend_from_slice(hash.as_bytes());
        bytes.extend_from_slice(&height.to_le_bytes());
        self.metadata.insert(KEY_STORE_TIP, &bytes)?;
        Ok(())
    }
}

type PendingMap = Arc<RwLock<HashMap<FixedHash, Arc<ChainBlock>>>>;

/// The queueing facade over [`BlockStoreDatabase`]. Cheap to clone; all clones feed the same writer task.
#[derive(Clone)]
pub struct BlockStoreQueue {
    db: Arc<BlockStoreDatabase>,
    pending: PendingMap,
    queue_tx: mpsc::UnboundedSender<Arc<ChainBlock>>,
    flush_signal: Arc<Notify>,
    tx_index: bool,
}

impl BlockStoreQueue {
    /// Create the queue and start its writer task.
    pub fn spawn(
        db: Arc<BlockStoreDatabase>,
        tree: SharedHeaderTree,
        events: EventBus,
        shutdown: ShutdownSignal,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let pending: PendingMap = Arc::new(RwLock::new(HashMap::new()));
        let flush_signal = Arc::new(Notify::new());
        let tx_index = db.config.tx_index;

        let writer = BlockStoreWriter {
            db: db.clone(),
            pending: pending.clone(),
            tree,
            events,
            max_batch_bytes: db.config.max_batch_bytes,
        };
        tokio::spawn(writer.run(queue_rx, flush_signal.clone(), shutdown));

        Self {
            db,
            pending,
            queue_tx,
            flush_signal,
            tx_index,
        }
    }

    /// Queue a block for durable storage. The block serves reads immediately via the pending map.
    pub fn add_to_pending(&self, entry: Arc<ChainBlock>) {
        self.pending
            .write()
            .expect("block store pending lock poisoned")
            .insert(*entry.hash(), entry.clone());
        // The writer task owning the receiver only exits at shutdown
        let _ = self.queue_tx.send(entry);
    }

    /// Ask the writer to flush the current batch regardless of size or interval.
    pub fn request_flush(&self) {
        self.flush_signal.notify_one();
    }

    pub fn store_tip(&self) -> Result<(FixedHash, u64), ChainStorageError> {
        self.db.store_tip()
    }

    /// Whether the block is available for reads (pending or durable).
    pub fn contains_block(&self, hash: &FixedHash) -> Result<bool, ChainStorageError> {
        if self
            .pending
            .read()
            .expect("block store pending lock poisoned")
            .contains_key(hash)
        {
            return Ok(true);
        }
        self.db.contains_block(hash)
    }

    /// Read a block, preferring the not-yet-persisted pending entry (read-your-writes).
    pub fn get_block(&self, hash: &FixedHash) -> Result<Option<Block>, ChainStorageError> {
        if let Some(entry) = self
            .pending
            .read()
            .expect("block store pending lock poisoned")
            .get(hash)
        {
            return Ok(Some(entry.block().as_ref().clone()));
        }
        self.db.get_block(hash)
    }

    pub fn get_blocks(&self, hashes: &[FixedHash]) -> Result<Vec<Option<Block>>, ChainStorageError> {
        hashes.iter().map(|hash| self.get_block(hash)).collect()
    }

    pub fn get_block_hash_by_transaction(&self, txid: &FixedHash) -> Result<Option<FixedHash>, ChainStorageError> {
        if !self.tx_index {
            return Err(ChainStorageError::TransactionIndexDisabled);
        }
        {
            let pending = self.pending.read().expect("block store pending lock poisoned");
            for entry in pending.values() {
                if entry.block().transactions.iter().any(|tx| tx.txid() == *txid) {
                    return Ok(Some(*entry.hash()));
                }
            }
        }
        self.db.get_block_hash_by_txid(txid)
    }

    pub fn get_transaction(&self, txid: &FixedHash) -> Result<Option<crate::transactions::Transaction>, ChainStorageError> {
        let Some(block_hash) = self.get_block_hash_by_transaction(txid)? else {
            return Ok(None);
        };
        let Some(block) = self.get_block(&block_hash)? else {
            return Ok(None);
        };
        Ok(block.transactions.into_iter().find(|tx| tx.txid() == *txid))
    }
}

struct BlockStoreWriter {
    db: Arc<BlockStoreDatabase>,
    pending: PendingMap,
    tree: SharedHeaderTree,
    events: EventBus,
    max_batch_bytes: usize,
}

impl BlockStoreWriter {
    async fn run(
        self,
        mut queue_rx: mpsc::UnboundedReceiver<Arc<ChainBlock>>,
        flush_signal: Arc<Notify>,
        mut shutdown: ShutdownSignal,
    ) {
        let mut batch: Vec<Arc<ChainBlock>> = Vec::new();
        let mut batch_bytes = 0usize;
        let mut flush_timer = tokio::time::interval(BLOCK_STORE_FLUSH_INTERVAL);
        flush_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        flush_timer.tick().await;

        loop {
            let mut flush_now = false;
            tokio::select! {
                biased;
                _ = shutdown.wait() => {
                    drain_queue(&mut queue_rx, &mut batch);
                    self.flush(&mut batch);
                    break;
                },
                _ = flush_signal.notified() => flush_now = true,
                _ = flush_timer.tick() => flush_now = true,
                maybe_entry = queue_rx.recv() => match maybe_entry {
                    Some(entry) => {
                        batch_bytes += entry.block().encoded_size();
                        batch.push(entry);
                        if batch_bytes >= self.max_batch_bytes {
                            flush_now = true;
                        }
                    },
                    None => {
                        self.flush(&mut batch);
                        break;
                    },
                },
            }
            if flush_now {
                // A flush writes everything enqueued so far, not just what the loop has seen
                drain_queue(&mut queue_rx, &mut batch);
                self.flush(&mut batch);
                batch_bytes = 0;
                flush_timer.reset();
            }
        }
        debug!(target: LOG_TARGET, "Block store writer exited");
    }

    fn flush(&self, batch: &mut Vec<Arc<ChainBlock>>) {
        if batch.is_empty() {
            return;
        }
        let drained = std::mem::take(batch);
        match self.flush_inner(&drained) {
            Ok((tip_hash, tip_height)) => {
                trace!(
                    target: LOG_TARGET,
                    "Flushed {} block(s); store tip is now #{} ({})",
                    drained.len(),
                    tip_height,
                    tip_hash
                );
            },
            Err(err) => {
                // An engine failure here means durable state can no longer advance
                error!(target: LOG_TARGET, "Failed to flush a block batch: {}", err);
            },
        }
        let mut pending = self.pending.write().expect("block store pending lock poisoned");
        for entry in &drained {
            pending.remove(entry.hash());
        }
    }

    fn flush_inner(&self, batch: &[Arc<ChainBlock>]) -> Result<(FixedHash, u64), ChainStorageError> {
        let (cleaned, dropped) = clean_batch(batch);
        for entry in &dropped {
            debug!(
                target: LOG_TARGET,
                "Dropped out-of-chain batch entry {} at height {}",
                entry.hash(),
                entry.height()
            );
        }
        let Some(first) = cleaned.first() else {
            // Everything in the batch was out of chain; nothing to write
            let tip = self.db.store_tip()?;
            return Ok(tip);
        };
        let expected_predecessor = first.chain_header().header().prev_hash;
        let (store_tip, _) = self.db.store_tip()?;

        let deletes = if store_tip == expected_predecessor {
            Vec::new()
        } else {
            self.db.collect_reorg_deletes(store_tip, expected_predecessor)?
        };
        let disconnected = self.load_for_disconnect(&deletes)?;

        let last = cleaned.last().expect("cleaned is non-empty");
        let new_tip = (*last.hash(), last.height());
        self.db.write_cleaned_batch(&deletes, &cleaned, new_tip)?;

        for entry in disconnected {
            self.events.publish(NodeEvent::BlockDisconnected(Arc::new(entry)));
        }
        for entry in &cleaned {
            self.events.publish(NodeEvent::BlockConnected(entry.clone()));
        }
        Ok(new_tip)
    }

    /// Pair each reorged-away block with its chained header (when the tree still has it) so subscribers see
    /// proper disconnect events, newest first.
    fn load_for_disconnect(&self, deletes: &[FixedHash]) -> Result<Vec<ChainBlock>, ChainStorageError> {
        let tree = self.tree.read().expect("header tree lock poisoned");
        let mut disconnected = Vec::with_capacity(deletes.len());
        for hash in deletes {
            let Some(header) = tree.get(hash) else { continue };
            let Some(block) = self.db.get_block(hash)? else { continue };
            disconnected.push(ChainBlock::new(header, Arc::new(block)));
        }
        Ok(disconnected)
    }
}

fn drain_queue(queue_rx: &mut mpsc::UnboundedReceiver<Arc<ChainBlock>>, batch: &mut Vec<Arc<ChainBlock>>) {
    while let Ok(entry) = queue_rx.try_recv() {
        batch.push(entry);
    }
}

/// Clean a batch backwards from its highest entry: keep only the suffix-chain in which every entry is the
/// parent of its successor. Anything else is dropped (never reordered).
fn clean_batch(batch: &[Arc<ChainBlock>]) -> (Vec<Arc<ChainBlock>>, Vec<Arc<ChainBlock>>) {
    let Some(highest) = batch.iter().max_by_key(|e| e.height()) else {
        return (Vec::new(), Vec::new());
    };
    let mut expected = *highest.hash();
    let mut cleaned = std::collections::VecDeque::with_capacity(batch.len());
    let mut dropped = Vec::new();
    for entry in batch.iter().rev() {
        if *entry.hash() == expected {
            expected = entry.chain_header().header().prev_hash;
            cleaned.push_front(entry.clone());
        } else {
            dropped.push(entry.clone());
        }
    }
    (cleaned.into(), dropped)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_helpers::chain;

    #[test]
    fn clean_batch_keeps_a_chained_suffix() {
        let chain = chain::linear_chain(4);
        let batch = chain.blocks[1..=3].to_vec();
        let (cleaned, dropped) = clean_batch(&batch);
        assert_eq!(cleaned.len(), 3);
        assert!(dropped.is_empty());
        assert_eq!(cleaned[0].height(), 1);
        assert_eq!(cleaned[2].height(), 3);
    }

    #[test]
    fn clean_batch_drops_out_of_chain_entries() {
        let mut main = chain::linear_chain(4);
        let stray = chain::extend_fork(&mut main, 1, 1, 99);
        // Batch: 1, 2, stray(2'), 3 — the stray entry does not chain to 3
        let batch = vec![
            main.blocks[1].clone(),
            main.blocks[2].clone(),
            stray[0].clone(),
            main.blocks[3].clone(),
        ];
        let (cleaned, dropped) = clean_batch(&batch);
        assert_eq!(cleaned.len(), 3);
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].hash(), stray[0].hash());
    }

    #[test]
    fn clean_batch_of_unrelated_entries_keeps_only_the_highest() {
        let mut main = chain::linear_chain(3);
        let fork = chain::extend_fork(&mut main, 0, 2, 7);
        let batch = vec![main.blocks[2].clone(), fork[1].clone()];
        let (cleaned, dropped) = clean_batch(&batch);
        // fork[1] is highest by construction order? Both at height 2; max_by_key picks the later equal —
        // either way exactly one survives with its parent absent from the batch
        assert_eq!(cleaned.len(), 1);
        assert_eq!(dropped.len(), 1);
    }
}
