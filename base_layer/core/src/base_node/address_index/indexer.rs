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

use std::{collections::HashSet, sync::Arc};

use log::*;
use sable_shutdown::ShutdownSignal;

use crate::{
    base_node::{
        address_index::{
            config::AddressIndexConfig,
            repository::{AddressBalanceChange, AddressIndexRepository, AddressRewindRecord, OutPointRecord},
            script::ScriptAddressResolver,
            AddressIndexError,
        },
        state::ChainTipState,
    },
    blocks::{Block, ChainHeader, SharedHeaderTree},
    chain_storage::BlockStoreQueue,
    common::FixedHash,
    transactions::OutPoint,
};

const LOG_TARGET: &str = "c::bn::address_index";

const OP_RETURN: u8 = 0x6a;

/// A verbose per-address view for callers that want more than a balance.
#[derive(Debug, Clone)]
pub struct AddressIndexerState {
    pub tip_hash: FixedHash,
    pub tip_height: u64,
    pub entries: Vec<(String, Vec<AddressBalanceChange>)>,
}

/// The query surface, cheap to clone and independent of the indexing task.
#[derive(Clone)]
pub struct AddressIndexHandle {
    repo: Arc<AddressIndexRepository>,
    tip_state: ChainTipState,
    sync_tolerance: u64,
}

impl AddressIndexHandle {
    /// Balances at (indexer tip − `min_confirmations`). Refused while the indexer lags the consensus tip.
    pub fn get_address_balances(
        &self,
        addresses: &[String],
        min_confirmations: u64,
    ) -> Result<Vec<(String, i64)>, AddressIndexError> {
        let (_, tip_height) = self.ensure_synced()?;
        let max_height = tip_height.saturating_sub(min_confirmations);
        addresses
            .iter()
            .map(|address| Ok((address.clone(), self.repo.balance_at(address, max_height)?)))
            .collect()
    }

    pub fn get_address_indexer_state(&self, addresses: &[String]) -> Result<AddressIndexerState, AddressIndexError> {
        let (tip_hash, tip_height) = self.ensure_synced()?;
        let entries = addresses
            .iter()
            .map(|address| Ok((address.clone(), self.repo.balance_changes(address)?)))
            .collect::<Result<Vec<_>, AddressIndexError>>()?;
        Ok(AddressIndexerState {
            tip_hash,
            tip_height,
            entries,
        })
    }

    fn ensure_synced(&self) -> Result<(FixedHash, u64), AddressIndexError> {
        let Some((tip_hash, indexer_height)) = self.repo.indexer_tip() else {
            return Err(AddressIndexError::NotSynced {
                reason: "the address index has not started indexing yet".to_string(),
            });
        };
        let consensus_height = self.tip_state.tip().height();
        let lag = consensus_height.saturating_sub(indexer_height);
        if lag > self.sync_tolerance {
            return Err(AddressIndexError::NotSynced {
                reason: format!(
                    "the address index is {} block(s) behind the chain tip (tolerance {})",
                    lag, self.sync_tolerance
                ),
            });
        }
        Ok((tip_hash, indexer_height))
    }
}

/// The indexing task. Streams the canonical chain block by block, rewinding through rewind records when the
/// chain reorganizes under it.
pub struct AddressIndexer {
    config: AddressIndexConfig,
    repo: Arc<AddressIndexRepository>,
    store: BlockStoreQueue,
    tree: SharedHeaderTree,
    tip_state: ChainTipState,
    resolver: Arc<dyn ScriptAddressResolver>,
    shutdown: ShutdownSignal,
    current: Arc<ChainHeader>,
    prefetched: Option<(FixedHash, Block)>,
}

impl AddressIndexer {
    pub fn new(
        config: AddressIndexConfig,
        repo: Arc<AddressIndexRepository>,
        store: BlockStoreQueue,
        tree: SharedHeaderTree,
        tip_state: ChainTipState,
        resolver: Arc<dyn ScriptAddressResolver>,
        shutdown: ShutdownSignal,
    ) -> Self {
        let current = {
            let tree_guard = tree.read().expect("header tree lock poisoned");
            match repo.indexer_tip().and_then(|(hash, _)| tree_guard.get(&hash)) {
                Some(header) => header,
                None => {
                    // Unknown or absent tip: index from scratch
                    tree_guard.genesis().clone()
                },
            }
        };
        Self {
            config,
            repo,
            store,
            tree,
            tip_state,
            resolver,
            shutdown,
            current,
            prefetched: None,
        }
    }

    pub fn handle(&self) -> AddressIndexHandle {
        AddressIndexHandle {
            repo: self.repo.clone(),
            tip_state: self.tip_state.clone(),
            sync_tolerance: self.config.sync_tolerance,
        }
    }

    /// Drive the indexer tip toward the consensus tip until shutdown. Any error is fatal to the node:
    /// a silently diverging index is worse than a crash.
    pub async fn run(mut self) -> Result<(), AddressIndexError> {
        info!(
            target: LOG_TARGET,
            "Address indexer starting at {} (height {})",
            self.current.hash(),
            self.current.height()
        );
        let mut shutdown = self.shutdown.clone();
        let mut tip_rx = self.tip_state.subscribe();
        let mut last_flush = tokio::time::Instant::now();

        loop {
            if shutdown.is_triggered() {
                break;
            }
            let consensus_tip = self.tip_state.tip();

            if self.current.hash() == consensus_tip.hash() {
                tokio::select! {
                    biased;
                    _ = shutdown.wait() => break,
                    _ = tip_rx.changed() => {},
                    _ = tokio::time::sleep(self.config.flush_interval) => {},
                }
                self.maybe_flush(&mut last_flush)?;
                continue;
            }

            // When the chain moved out from under us, back up to the fork point first
            let on_canonical_chain = consensus_tip
                .ancestor_at_height(self.current.height())
                .map(|h| h.hash() == self.current.hash())
                .unwrap_or(false);
            if !on_canonical_chain {
                let fork = {
                    let tree = self.tree.read().expect("header tree lock poisoned");
                    tree.fork_point(&self.current, &consensus_tip)
                };
                warn!(
                    target: LOG_TARGET,
                    "Chain reorganized; rewinding the address index from {} to fork {}",
                    self.current.height(),
                    fork.height()
                );
                self.rewind_to_fork(fork)?;
                continue;
            }

            let next = consensus_tip
                .ancestor_at_height(self.current.height() + 1)
                .expect("current is a strict ancestor of the consensus tip");
            let block = match self.take_prefetched(next.hash()) {
                Some(block) => Some(block),
                None => self.store.get_block(next.hash())?,
            };
            let Some(block) = block else {
                // The store has not caught up to this height yet
                tokio::select! {
                    biased;
                    _ = shutdown.wait() => break,
                    _ = tokio::time::sleep(self.config.retry_delay) => {},
                }
                continue;
            };

            self.process_block(&next, &block)?;
            self.current = next;
            self.repo.set_indexer_tip(*self.current.hash(), self.current.height());

            // Single-slot prefetch of the following block
            self.prefetched = None;
            if let Some(after) = consensus_tip.ancestor_at_height(self.current.height() + 1) {
                if let Some(block) = self.store.get_block(after.hash())? {
                    self.prefetched = Some((*after.hash(), block));
                }
            }
            self.maybe_flush(&mut last_flush)?;
        }

        self.repo.flush()?;
        info!(target: LOG_TARGET, "Address indexer stopped at height {}", self.current.height());
        Ok(())
    }

    /// Apply one block: record new out-points, consume spent ones (a miss is fatal), write the balance
    /// changes and the block's rewind record, then compact any address that grew past the threshold.
    pub fn process_block(&mut self, header: &Arc<ChainHeader>, block: &Block) -> Result<(), AddressIndexError> {
        let height = header.height();
        let mut rewind = AddressRewindRecord {
            block_hash: *header.hash(),
            height,
            consumed: Vec::new(),
        };
        let mut touched = HashSet::new();

        // New out-points first, so intra-block spends resolve
        for tx in &block.transactions {
            let txid = tx.txid();
            for (index, output) in tx.outputs.iter().enumerate() {
                if !is_indexable(&output.script_pubkey) {
                    continue;
                }
                self.repo.put_outpoint(OutPoint::new(txid, index as u32), OutPointRecord {
                    script_pubkey: output.script_pubkey.clone(),
                    value: output.value,
                })?;
            }
        }

        // Spends become withdrawals and rewind entries
        for tx in &block.transactions {
            if tx.is_coinbase() {
                continue;
            }
            for input in &tx.inputs {
                let record = self
                    .repo
                    .spend_outpoint(&input.prevout)?
                    .ok_or(AddressIndexError::MissingOutPoint(input.prevout))?;
                if let Some(address) = self.resolver.resolve(&record.script_pubkey) {
                    self.repo.record_change(&address, AddressBalanceChange {
                        height,
                        amount: record.value,
                        deposit: false,
                    })?;
                    touched.insert(address);
                }
                rewind.consumed.push((input.prevout, record));
            }
        }

        // Outputs become deposits; unrecognized scripts are skipped silently
        for tx in &block.transactions {
            for output in &tx.outputs {
                if !is_indexable(&output.script_pubkey) {
                    continue;
                }
                if let Some(address) = self.resolver.resolve(&output.script_pubkey) {
                    self.repo.record_change(&address, AddressBalanceChange {
                        height,
                        amount: output.value,
                        deposit: true,
                    })?;
                    touched.insert(address);
                }
            }
        }

        self.repo.save_rewind_record(&rewind)?;

        let consensus_height = self.tip_state.tip().height();
        for address in touched {
            self.repo.compact_address(
                &address,
                consensus_height,
                self.config.compaction_threshold,
                self.config.compaction_trigger_distance,
            )?;
        }
        trace!(target: LOG_TARGET, "Indexed block {} at height {}", header.hash(), height);
        Ok(())
    }

    /// Undo everything above the fork: trim balance changes, restore consumed out-points from the rewind
    /// records, drop those records and move the indexer tip to the fork point.
    pub fn rewind_to_fork(&mut self, fork: Arc<ChainHeader>) -> Result<(), AddressIndexError> {
        // The trim scans the engine, so the ledger must be fully persisted first
        self.repo.flush()?;
        let affected = self.repo.trim_balances_above(fork.height())?;

        let records = self.repo.rewind_records_above(fork.height())?;
        for record in &records {
            for (outpoint, outpoint_record) in &record.consumed {
                self.repo.restore_outpoint(*outpoint, outpoint_record.clone())?;
            }
        }
        self.repo.delete_rewind_records_above(fork.height())?;

        self.prefetched = None;
        self.current = fork;
        self.repo.set_indexer_tip(*self.current.hash(), self.current.height());
        self.repo.flush()?;
        info!(
            target: LOG_TARGET,
            "Address index rewound to height {} ({} address(es) trimmed, {} block(s) undone)",
            self.current.height(),
            affected,
            records.len()
        );
        Ok(())
    }

    fn take_prefetched(&mut self, hash: &FixedHash) -> Option<Block> {
        match self.prefetched.take() {
            Some((prefetched_hash, block)) if prefetched_hash == *hash => Some(block),
            _ => None,
        }
    }

    fn maybe_flush(&mut self, last_flush: &mut tokio::time::Instant) -> Result<(), AddressIndexError> {
        if last_flush.elapsed() < self.config.flush_interval {
            return Ok(());
        }
        self.repo.flush()?;
        // Rewind records older than the compaction trigger distance are final and can go, but never past
        // what has actually been persisted
        let consensus_height = self.tip_state.tip().height();
        let saved_height = self.repo.indexer_tip().map(|(_, h)| h).unwrap_or(0);
        let floor = consensus_height
            .saturating_sub(self.config.compaction_trigger_distance)
            .min(saved_height);
        if floor > 0 {
            self.repo.purge_rewind_records_below(floor)?;
        }
        *last_flush = tokio::time::Instant::now();
        Ok(())
    }
}

fn is_indexable(script_pubkey: &[u8]) -> bool {
    !script_pubkey.is_empty() && script_pubkey[0] != OP_RETURN
}
