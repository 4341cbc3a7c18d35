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

//! The chain coordinator drives forward progress: it ingests header announcements into the tree, asks the
//! puller for the blocks the canonical chain is missing, hands deliveries to the external validator in
//! height order, applies accepted blocks to the coinview, feeds the store queue, maintains the single
//! authoritative tip (including reorg rewinds), serves header/block requests from peers, and keeps the IBD
//! flag and status line current.

use std::{
    collections::HashMap,
    sync::Arc,
    time::Duration,
};

use log::*;
use num_format::{Locale, ToFormattedString};
use sable_comms::{
    clock::Clock,
    Command,
    ConnectivityEvent,
    ConnectivityRequester,
    InboundMessage,
    MessageFrame,
    PeerId,
};
use sable_shutdown::ShutdownSignal;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{
    base_node::{
        block_puller::{BlockDeliveryCallback, BlockPuller, DownloadPriority},
        messages::{GetHeadersMessage, HeadersMessage, MAX_HEADERS_PER_MESSAGE},
        state::ChainTipState,
    },
    blocks::{Block, BlockError, ChainBlock, ChainHeader, SharedHeaderTree},
    chain_storage::{
        BlockStoreQueue,
        ChainStorageError,
        CoinView,
        CoinViewChanges,
        CoinsRecord,
        HeaderStore,
        RewindRecord,
    },
    common::FixedHash,
    consensus::ConsensusConstants,
    events::{EventBus, NodeEvent},
    transactions::OutPoint,
    validation::{BlockValidator, ValidationError},
};

const LOG_TARGET: &str = "c::bn::coordinator";

/// Misbehavior-free cap on how many block downloads one scheduling pass requests.
const DOWNLOAD_BATCH: usize = 512;

#[derive(Debug, Clone)]
pub struct ChainCoordinatorConfig {
    /// Cadence of the status line, IBD re-evaluation and fork pruning.
    pub status_interval: Duration,
    /// Long ban applied for invalid blocks.
    pub ban_period: Duration,
}

impl Default for ChainCoordinatorConfig {
    fn default() -> Self {
        Self {
            status_interval: Duration::from_secs(30),
            ban_period: Duration::from_secs(16 * 60 * 60),
        }
    }
}

/// Failures that leave chain state unable to advance. The node treats these as fatal and shuts down.
#[derive(Debug, Error)]
pub enum ChainCoordinatorError {
    #[error("Chain storage error: {0}")]
    ChainStorageError(#[from] ChainStorageError),
    #[error("Block {0} spends out-point {1} that is not in the coinview")]
    MissingCoin(FixedHash, OutPoint),
    #[error("The header tree has no entry for {0}")]
    UnknownHeader(FixedHash),
    #[error("Validation task panicked: {0}")]
    ValidationTaskFailed(String),
}

pub struct ChainCoordinator {
    config: ChainCoordinatorConfig,
    constants: ConsensusConstants,
    clock: Arc<dyn Clock>,
    tree: SharedHeaderTree,
    tip_state: ChainTipState,
    store: BlockStoreQueue,
    header_store: HeaderStore,
    coinview: Arc<CoinView>,
    validator: Arc<dyn BlockValidator>,
    puller: Arc<BlockPuller>,
    connectivity: ConnectivityRequester,
    events: EventBus,
    inbound_rx: mpsc::Receiver<InboundMessage>,
    delivery_rx: mpsc::UnboundedReceiver<(FixedHash, Option<Block>, PeerId)>,
    /// Delivered blocks awaiting their turn to connect in height order.
    pending_blocks: HashMap<FixedHash, (Block, PeerId)>,
    /// Highest chain height each connected peer has claimed.
    peer_best_heights: HashMap<PeerId, u64>,
    last_persisted_best: Arc<ChainHeader>,
    shutdown: ShutdownSignal,
}

impl ChainCoordinator {
    /// The delivery side of the puller: the callback the puller invokes and the receiver the coordinator
    /// consumes. Created first because the puller is constructed before the coordinator.
    pub fn delivery_channel() -> (
        BlockDeliveryCallback,
        mpsc::UnboundedReceiver<(FixedHash, Option<Block>, PeerId)>,
    ) {
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
        let callback: BlockDeliveryCallback = Arc::new(move |hash, block, peer| {
            let _ = delivery_tx.send((hash, block, peer));
        });
        (callback, delivery_rx)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ChainCoordinatorConfig,
        constants: ConsensusConstants,
        clock: Arc<dyn Clock>,
        tree: SharedHeaderTree,
        tip_state: ChainTipState,
        store: BlockStoreQueue,
        header_store: HeaderStore,
        coinview: Arc<CoinView>,
        validator: Arc<dyn BlockValidator>,
        puller: Arc<BlockPuller>,
        connectivity: ConnectivityRequester,
        events: EventBus,
        inbound_rx: mpsc::Receiver<InboundMessage>,
        delivery_rx: mpsc::UnboundedReceiver<(FixedHash, Option<Block>, PeerId)>,
        shutdown: ShutdownSignal,
    ) -> Self {
        let last_persisted_best = {
            let tree = tree.read().expect("header tree lock poisoned");
            tree.best_tip().clone()
        };
        Self {
            config,
            constants,
            clock,
            tree,
            tip_state,
            store,
            header_store,
            coinview,
            validator,
            puller,
            connectivity,
            events,
            inbound_rx,
            delivery_rx,
            pending_blocks: HashMap::new(),
            peer_best_heights: HashMap::new(),
            last_persisted_best,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<(), ChainCoordinatorError> {
        let mut shutdown = self.shutdown.clone();
        let mut connectivity_events = self.connectivity.subscribe_events();
        let mut status_tick = tokio::time::interval(self.config.status_interval);
        status_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        status_tick.tick().await;

        info!(
            target: LOG_TARGET,
            "Chain coordinator started at tip {}",
            self.tip_state.tip()
        );
        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                Some(message) = self.inbound_rx.recv() => self.handle_inbound(message).await?,
                Some((hash, block, peer)) = self.delivery_rx.recv() => {
                    self.handle_delivery(hash, block, peer).await?;
                },
                event = connectivity_events.recv() => match event {
                    Ok(event) => self.handle_connectivity_event(event).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(target: LOG_TARGET, "Dropped {} connectivity event(s)", skipped);
                    },
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                _ = status_tick.tick() => self.periodic_maintenance().await,
            }
        }

        // One final durable batch before the engines close
        self.store.request_flush();
        info!(target: LOG_TARGET, "Chain coordinator shut down");
        Ok(())
    }

    async fn handle_inbound(&mut self, message: InboundMessage) -> Result<(), ChainCoordinatorError> {
        let peer_id = message.peer_id;
        match message.command {
            Command::Headers => {
                let Ok(headers) = HeadersMessage::from_payload(message.payload) else {
                    self.punish_malformed(peer_id).await;
                    return Ok(());
                };
                self.ingest_headers(peer_id, headers.headers).await?;
            },
            Command::Inv => {
                let Ok(inv) = sable_comms::protocol::InvMessage::from_payload(message.payload) else {
                    self.punish_malformed(peer_id).await;
                    return Ok(());
                };
                let unknown = {
                    let tree = self.tree.read().expect("header tree lock poisoned");
                    inv.items
                        .iter()
                        .any(|item| !tree.contains(&FixedHash::from(item.hash)))
                };
                if unknown {
                    self.send_getheaders(peer_id).await;
                }
            },
            Command::Block => {
                match Block::from_bytes(&message.payload) {
                    Ok(block) => {
                        let hash = block.hash();
                        self.puller.push_block(hash, block, peer_id);
                    },
                    Err(_) => self.punish_malformed(peer_id).await,
                }
            },
            Command::GetHeaders => {
                let Ok(request) = GetHeadersMessage::from_payload(message.payload) else {
                    self.punish_malformed(peer_id).await;
                    return Ok(());
                };
                self.serve_headers(peer_id, request).await;
            },
            Command::GetBlocks => {
                let Ok(request) = GetHeadersMessage::from_payload(message.payload) else {
                    self.punish_malformed(peer_id).await;
                    return Ok(());
                };
                self.serve_block_inventory(peer_id, request).await;
            },
            Command::GetData => {
                let Ok(request) = sable_comms::protocol::InvMessage::from_payload(message.payload) else {
                    self.punish_malformed(peer_id).await;
                    return Ok(());
                };
                self.serve_blocks(peer_id, request).await?;
            },
            Command::SendHeaders => {
                // Direct header announcement is what this node does anyway
                trace!(target: LOG_TARGET, "{} prefers header announcements", peer_id);
            },
            Command::Tx => {
                // Mempool relay is outside this node's scope
                trace!(target: LOG_TARGET, "Ignoring transaction relay from {}", peer_id);
            },
            other => {
                trace!(target: LOG_TARGET, "Ignoring '{}' from {}", other, peer_id);
            },
        }
        Ok(())
    }

    /// Link announced headers into the tree, persist any new canonical suffix, update the peer's claim and
    /// schedule downloads for what the chain is now missing.
    async fn ingest_headers(&mut self, peer_id: PeerId, headers: Vec<crate::blocks::BlockHeader>) -> Result<(), ChainCoordinatorError> {
        if headers.is_empty() {
            return Ok(());
        }
        let mut added = 0usize;
        let mut last_linked: Option<Arc<ChainHeader>> = None;
        let mut saw_orphan = false;
        {
            let mut tree = self.tree.write().expect("header tree lock poisoned");
            for header in headers {
                match tree.add_header(header) {
                    Ok(chained) => {
                        added += 1;
                        last_linked = Some(chained);
                    },
                    Err(BlockError::OrphanHeader { .. }) => {
                        saw_orphan = true;
                    },
                    Err(err) => {
                        debug!(target: LOG_TARGET, "Rejected header from {}: {}", peer_id, err);
                    },
                }
            }
        }
        if saw_orphan {
            // We are missing the ancestry; ask the peer to fill the gap
            self.send_getheaders(peer_id).await;
        }
        if let Some(tip) = last_linked {
            self.peer_best_heights
                .entry(peer_id)
                .and_modify(|h| *h = (*h).max(tip.height()))
                .or_insert(tip.height());
            self.puller.peer_tip_claimed(peer_id, tip);
        }
        if added > 0 {
            debug!(target: LOG_TARGET, "Linked {} header(s) from {}", added, peer_id);
            self.persist_canonical_headers()?;
            self.schedule_missing_blocks()?;
        }
        Ok(())
    }

    /// A delivery from the puller. Blocks connect strictly in height order; arrivals from the future wait
    /// in the pending map.
    async fn handle_delivery(
        &mut self,
        hash: FixedHash,
        block: Option<Block>,
        peer: PeerId,
    ) -> Result<(), ChainCoordinatorError> {
        match block {
            Some(block) => {
                self.pending_blocks.insert(hash, (block, peer));
                self.connect_pending_blocks().await?;
            },
            None => {
                // No peer could serve the header; a later scheduling pass retries once peers change
                trace!(target: LOG_TARGET, "Download of {} failed with no eligible peer", hash);
            },
        }
        Ok(())
    }

    async fn connect_pending_blocks(&mut self) -> Result<(), ChainCoordinatorError> {
        loop {
            let tip = self.tip_state.tip();
            let best = {
                let tree = self.tree.read().expect("header tree lock poisoned");
                tree.best_tip().clone()
            };
            if best.hash() == tip.hash() {
                break;
            }

            // The heaviest chain does not extend the tip: rewind to the fork point first
            let tip_on_best = best
                .ancestor_at_height(tip.height())
                .map(|h| h.hash() == tip.hash())
                .unwrap_or(false);
            if !tip_on_best {
                let fork = {
                    let tree = self.tree.read().expect("header tree lock poisoned");
                    tree.fork_point(&tip, &best)
                };
                warn!(
                    target: LOG_TARGET,
                    "Reorganizing: rewinding from {} to fork {}", tip, fork
                );
                while self.tip_state.tip().height() > fork.height() {
                    let previous = self.coinview.rewind()?;
                    let previous_header = {
                        let tree = self.tree.read().expect("header tree lock poisoned");
                        tree.get(&previous)
                    }
                    .ok_or(ChainCoordinatorError::UnknownHeader(previous))?;
                    self.tip_state.set_tip(previous_header);
                }
                continue;
            }

            let Some(next) = best.ancestor_at_height(tip.height() + 1) else {
                break;
            };
            let Some((block, from_peer)) = self.pending_blocks.remove(next.hash()) else {
                break;
            };

            // The external rule engine gets the final say, off the async thread
            let validator = self.validator.clone();
            let task_block = block.clone();
            let height = next.height();
            let verdict = tokio::task::spawn_blocking(move || validator.validate_block(&task_block, height))
                .await
                .map_err(|e| ChainCoordinatorError::ValidationTaskFailed(e.to_string()))?;

            match verdict {
                Ok(()) => {
                    self.connect_block_to_coinview(&next, &block)?;
                    let entry = Arc::new(ChainBlock::new(next.clone(), Arc::new(block)));
                    self.store.add_to_pending(entry);
                    self.tip_state.set_tip(next.clone());
                    self.puller.set_consensus_height(next.height());
                    debug!(target: LOG_TARGET, "Connected block {}", next);
                },
                Err(err @ ValidationError::FatalStorageError(_)) => {
                    return Err(ChainCoordinatorError::ChainStorageError(
                        ChainStorageError::CorruptRecord {
                            store: "coinview",
                            message: err.to_string(),
                        },
                    ));
                },
                Err(err) => {
                    warn!(
                        target: LOG_TARGET,
                        "Block {} from {} failed validation: {}", next, from_peer, err
                    );
                    if let Some(ban) = err.get_ban_reason(self.config.ban_period) {
                        let _ = self
                            .connectivity
                            .ban_peer_id_until(from_peer, Some(ban.ban_duration), ban.reason)
                            .await;
                    }
                    break;
                },
            }
        }
        Ok(())
    }

    /// Apply one accepted block to the coinview: spend its inputs, add its outputs, and record the undo log.
    fn connect_block_to_coinview(
        &self,
        header: &Arc<ChainHeader>,
        block: &Block,
    ) -> Result<(), ChainCoordinatorError> {
        let height = header.height();
        let old_tip = self.coinview.get_tip_hash()?;

        // Working set: the block's own creations first, so intra-block spends resolve
        let mut working: std::collections::BTreeMap<FixedHash, CoinsRecord> = block
            .transactions
            .iter()
            .map(|tx| {
                let record = CoinsRecord::from_transaction(tx, height);
                (record.txid, record)
            })
            .collect();
        let created_txids = working.keys().copied().collect::<Vec<_>>();

        let funding_txids = block
            .transactions
            .iter()
            .flat_map(|tx| tx.inputs.iter())
            .filter(|input| !input.prevout.is_null())
            .map(|input| input.prevout.txid)
            .filter(|txid| !working.contains_key(txid))
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect::<Vec<_>>();
        let (_, fetched) = self.coinview.fetch_coins(&funding_txids)?;
        let mut originals = Vec::new();
        for (txid, record) in funding_txids.iter().zip(fetched) {
            let record = record.ok_or_else(|| {
                ChainCoordinatorError::MissingCoin(*header.hash(), OutPoint::new(*txid, 0))
            })?;
            originals.push(record.clone());
            working.insert(*txid, record);
        }

        let mut restored = Vec::new();
        for tx in &block.transactions {
            for input in &tx.inputs {
                if input.prevout.is_null() {
                    continue;
                }
                let record = working
                    .get_mut(&input.prevout.txid)
                    .ok_or(ChainCoordinatorError::MissingCoin(*header.hash(), input.prevout))?;
                let coin = record
                    .spend(input.prevout.index)
                    .ok_or(ChainCoordinatorError::MissingCoin(*header.hash(), input.prevout))?;
                restored.push((input.prevout, coin));
            }
        }

        let changes = CoinViewChanges {
            modified: working.into_values().collect(),
            originals,
            rewind_records: vec![RewindRecord {
                height,
                previous_tip: old_tip,
                removed_txids: created_txids,
                restored,
            }],
        };
        self.coinview.save_changes(changes, old_tip, *header.hash(), height)?;
        Ok(())
    }

    async fn handle_connectivity_event(&mut self, event: ConnectivityEvent) {
        match event {
            ConnectivityEvent::PeerConnected {
                peer_id,
                address,
                direction,
                claimed_height,
            } => {
                self.peer_best_heights.insert(peer_id, claimed_height);
                self.events.publish(NodeEvent::PeerConnected {
                    address,
                    inbound: direction.is_inbound(),
                });
                // Announce our preference and ask where the peer's chain is
                let _ = self
                    .connectivity
                    .send_message(peer_id, MessageFrame::empty(Command::SendHeaders))
                    .await;
                self.send_getheaders(peer_id).await;
            },
            ConnectivityEvent::PeerDisconnected { peer_id, address, reason } => {
                self.peer_best_heights.remove(&peer_id);
                self.puller.peer_disconnected(peer_id);
                self.events.publish(NodeEvent::PeerDisconnected { address, reason });
            },
            ConnectivityEvent::PeerBanned { address, reason, until } => {
                self.events.publish(NodeEvent::PeerBanned { address, reason, until });
            },
            ConnectivityEvent::ConnectionFailed { address, reason } => {
                self.events
                    .publish(NodeEvent::PeerConnectionAttemptFailed { address, reason });
            },
        }
    }

    async fn send_getheaders(&self, peer_id: PeerId) {
        let best = {
            let tree = self.tree.read().expect("header tree lock poisoned");
            tree.best_tip().clone()
        };
        let request = GetHeadersMessage::with_locator_from(&best);
        let _ = self
            .connectivity
            .send_message(peer_id, MessageFrame::new(Command::GetHeaders, request.to_payload()))
            .await;
    }

    async fn serve_headers(&self, peer_id: PeerId, request: GetHeadersMessage) {
        let headers = self.headers_after_locator(&request, MAX_HEADERS_PER_MESSAGE);
        let reply = HeadersMessage {
            headers: headers.iter().map(|h| *h.header()).collect(),
        };
        let _ = self
            .connectivity
            .send_message(peer_id, MessageFrame::new(Command::Headers, reply.to_payload()))
            .await;
    }

    async fn serve_block_inventory(&self, peer_id: PeerId, request: GetHeadersMessage) {
        let headers = self.headers_after_locator(&request, sable_comms::protocol::MAX_INV_PER_MESSAGE.min(500));
        let inv = sable_comms::protocol::InvMessage::blocks(headers.iter().map(|h| **h.hash()));
        let _ = self
            .connectivity
            .send_message(peer_id, MessageFrame::new(Command::Inv, inv.to_payload()))
            .await;
    }

    async fn serve_blocks(
        &self,
        peer_id: PeerId,
        request: sable_comms::protocol::InvMessage,
    ) -> Result<(), ChainCoordinatorError> {
        for item in request.items {
            if item.kind != sable_comms::protocol::InvKind::Block {
                continue;
            }
            let hash = FixedHash::from(item.hash);
            if let Some(block) = self.store.get_block(&hash)? {
                let frame = MessageFrame::new(Command::Block, bytes::Bytes::from(block.to_bytes()));
                if self.connectivity.send_message(peer_id, frame).await.is_err() {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Main-chain headers following the most recent locator entry we recognize.
    fn headers_after_locator(&self, request: &GetHeadersMessage, limit: usize) -> Vec<Arc<ChainHeader>> {
        let tree = self.tree.read().expect("header tree lock poisoned");
        let best = tree.best_tip().clone();
        let mut start_height = 0u64;
        for hash in &request.locator {
            if let Some(header) = tree.get(hash) {
                if tree.is_ancestor_or_equal(hash, &best) {
                    start_height = header.height() + 1;
                    break;
                }
            }
        }
        let mut end_height = best.height();
        if let Some(stop) = tree.get(&request.stop) {
            end_height = end_height.min(stop.height());
        }
        end_height = end_height.min(start_height.saturating_add(limit as u64).saturating_sub(1));
        tree.main_chain_range(start_height, end_height)
    }

    /// Ask the puller for canonical blocks between the consensus tip and the best header, skipping what is
    /// already stored, buffered or in flight.
    fn schedule_missing_blocks(&mut self) -> Result<(), ChainCoordinatorError> {
        let tip = self.tip_state.tip();
        let headers = {
            let tree = self.tree.read().expect("header tree lock poisoned");
            tree.main_chain_range(tip.height() + 1, tip.height() + DOWNLOAD_BATCH as u64)
        };
        let mut wanted = Vec::new();
        for header in headers {
            if self.pending_blocks.contains_key(header.hash()) {
                continue;
            }
            if self.store.contains_block(header.hash())? {
                continue;
            }
            wanted.push(header);
        }
        if !wanted.is_empty() {
            trace!(target: LOG_TARGET, "Requesting {} block download(s)", wanted.len());
            self.puller.request_download(wanted, DownloadPriority::Normal);
        }
        Ok(())
    }

    /// Persist the canonical header suffix (truncating first if the best chain switched branches).
    fn persist_canonical_headers(&mut self) -> Result<(), ChainCoordinatorError> {
        let best = {
            let tree = self.tree.read().expect("header tree lock poisoned");
            tree.best_tip().clone()
        };
        if best.hash() == self.last_persisted_best.hash() {
            return Ok(());
        }
        let fork = {
            let tree = self.tree.read().expect("header tree lock poisoned");
            tree.fork_point(&self.last_persisted_best, &best)
        };
        if fork.hash() != self.last_persisted_best.hash() {
            self.header_store.truncate_above(fork.height())?;
        }
        let to_save = {
            let tree = self.tree.read().expect("header tree lock poisoned");
            tree.main_chain_range(fork.height() + 1, best.height())
        };
        for header in &to_save {
            self.header_store.save(header.height(), header.header())?;
        }
        self.last_persisted_best = best;
        Ok(())
    }

    async fn periodic_maintenance(&mut self) {
        let tip = self.tip_state.tip();
        let best_claimed = self.peer_best_heights.values().copied().max().unwrap_or(0);

        // IBD: the tip is stale, or the network is clearly ahead
        let tip_age = self
            .clock
            .now()
            .saturating_sub(u64::from(tip.header().timestamp));
        let is_ibd = tip_age > self.constants.ibd_max_tip_age_secs ||
            best_claimed > tip.height().saturating_add(self.constants.ibd_lag_threshold);
        if is_ibd != self.tip_state.is_ibd() {
            info!(target: LOG_TARGET, "Initial block download {}", if is_ibd { "started" } else { "complete" });
            self.tip_state.set_ibd(is_ibd);
            let _ = self.connectivity.set_ibd_state(is_ibd).await;
            self.puller.ibd_state_changed(is_ibd);
        }

        {
            let mut tree = self.tree.write().expect("header tree lock poisoned");
            tree.prune_stale_forks(self.constants.max_reorg_depth);
        }
        if let Err(err) = self.schedule_missing_blocks() {
            error!(target: LOG_TARGET, "Failed to schedule block downloads: {}", err);
        }

        let peers = self.peer_best_heights.len();
        info!(
            target: LOG_TARGET,
            "Tip #{} {} | work {} | {} peer(s) | {} download(s) in flight{}",
            tip.height().to_formatted_string(&Locale::en),
            tip.hash(),
            tip.total_work(),
            peers,
            self.puller.in_flight(),
            if self.tip_state.is_ibd() { " | IBD" } else { "" }
        );
    }

    async fn punish_malformed(&self, peer_id: PeerId) {
        debug!(target: LOG_TARGET, "{} sent a malformed payload", peer_id);
        let _ = self
            .connectivity
            .disconnect_peer(peer_id, "malformed payload".to_string())
            .await;
    }
}
