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

//! Wires every component together and runs the node until shutdown: storage engine, header tree, block
//! store queue, coinview, connection manager, discovery, block puller, chain coordinator and (optionally)
//! the address indexer. Fatal component errors trigger a node-wide shutdown and surface as the process exit
//! code.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
    Mutex,
};

use log::*;
use sable_comms::{
    clock::SystemClock,
    discovery::PeerDiscovery,
    peer_manager::{BanRegistry, PeerAddressBook},
    ConnectionManager,
};
use sable_core::{
    base_node::{
        address_index::{AddressIndexConfig, AddressIndexRepository, AddressIndexer, Base58AddressResolver},
        block_puller::{BlockPuller, BlockPullerConfig},
        ChainCoordinator,
        ChainCoordinatorConfig,
        ChainTipState,
    },
    blocks::HeaderTree,
    chain_storage::{
        store_names,
        BlockStoreDatabase,
        BlockStoreQueue,
        CachedCoinView,
        CoinView,
        HeaderStore,
        PersistentCoinView,
    },
    consensus::{self, ConsensusConstants},
    events::EventBus,
    validation::MockValidator,
};
use sable_shutdown::Shutdown;
use sable_storage::StoreBuilder;

use crate::{
    config::ApplicationConfig,
    exit_codes::{ExitCode, ExitError},
};

const LOG_TARGET: &str = "sable::node::builder";

/// The store holding the persisted peer address book.
const PEER_BOOK_STORE: &str = "peers";

/// Coinview read-cache capacity (records).
const COINVIEW_CACHE_SIZE: usize = 100_000;

pub async fn run_node(config: ApplicationConfig, shutdown: Arc<Shutdown>) -> Result<(), ExitError> {
    let node = &config.base_node;
    let constants = ConsensusConstants::default();

    // Storage engine with every namespace
    let mut engine_builder = StoreBuilder::new(node.data_dir.join("db"));
    for name in store_names::all() {
        engine_builder = engine_builder.add_store(name);
    }
    engine_builder = engine_builder.add_store(PEER_BOOK_STORE);
    let engine = engine_builder.build()?;

    // Header tree, replayed from the persisted canonical chain
    let genesis = consensus::genesis_block();
    let tree = HeaderTree::shared(genesis.header);
    let header_store = HeaderStore::new(engine.get_handle(store_names::HEADERS)?);
    let mut replayed = 0usize;
    for (height, header) in header_store.load_all()? {
        if height == 0 {
            continue;
        }
        match tree.write().expect("header tree lock poisoned").add_header(header) {
            Ok(_) => replayed += 1,
            Err(err) => {
                warn!(target: LOG_TARGET, "Skipping unusable persisted header at height {}: {}", height, err);
                break;
            },
        }
    }
    if replayed > 0 {
        info!(target: LOG_TARGET, "Replayed {} persisted header(s)", replayed);
    }

    // Block store (recovery must run before the consensus tip is established)
    let store_db = Arc::new(BlockStoreDatabase::new(
        &engine,
        consensus::genesis_hash(),
        config.block_store_config(),
    )?);
    store_db.initialize(&tree, false)?;

    // Coinview stack: persistent layer with the rewind-data window, wrapped by a read cache
    let persistent = PersistentCoinView::new(&engine, consensus::genesis_hash(), Some(constants.max_reorg_depth))?;
    let coinview = Arc::new(CoinView::Cached(CachedCoinView::new(
        CoinView::Persistent(persistent),
        COINVIEW_CACHE_SIZE,
    )));

    // The authoritative tip starts wherever the coinview is consistent
    let coin_tip = coinview.get_tip_hash()?;
    let tip_header = {
        let tree_guard = tree.read().expect("header tree lock poisoned");
        tree_guard.get(&coin_tip).unwrap_or_else(|| tree_guard.genesis().clone())
    };
    info!(target: LOG_TARGET, "Starting from chain tip {}", tip_header);
    let tip_state = ChainTipState::new(tip_header.clone());
    let local_height = Arc::new(AtomicU64::new(tip_header.height()));

    // Comms: peer book, bans, connection manager, discovery
    let clock = Arc::new(SystemClock);
    let comms_config = config.comms_config()?;
    preflight_bind_check(&comms_config)?;
    let book = Arc::new(
        PeerAddressBook::new(engine.get_handle(PEER_BOOK_STORE)?, clock.clone())
            .map_err(|e| ExitError::new(ExitCode::StorageError, e))?,
    );
    let bans = Arc::new(BanRegistry::new(clock.clone()));
    let (manager, connectivity, inbound_rx) = ConnectionManager::new(
        comms_config.clone(),
        clock.clone(),
        book.clone(),
        bans.clone(),
        local_height.clone(),
        shutdown.to_signal(),
    );

    let fatal: Arc<Mutex<Option<ExitError>>> = Arc::new(Mutex::new(None));
    {
        let fatal = fatal.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = manager.run().await {
                error!(target: LOG_TARGET, "Connection manager failed: {}", err);
                *fatal.lock().expect("fatal flag lock poisoned") =
                    Some(ExitError::new(ExitCode::NetworkError, err));
                shutdown.trigger();
            }
        });
    }

    PeerDiscovery::new(
        comms_config,
        config.discovery_config(),
        connectivity.clone(),
        book,
        bans,
        clock.clone(),
        local_height.clone(),
        shutdown.to_signal(),
    )
    .spawn();

    // The data pipeline: store queue, puller, coordinator
    let events = EventBus::new();
    let store = BlockStoreQueue::spawn(store_db, tree.clone(), events.clone(), shutdown.to_signal());

    let (delivery_callback, delivery_rx) = ChainCoordinator::delivery_channel();
    let puller = BlockPuller::new(
        BlockPullerConfig::default(),
        clock.clone(),
        connectivity.clone(),
        delivery_callback,
        shutdown.to_signal(),
    );
    puller.spawn();
    puller.set_consensus_height(tip_header.height());

    // Keep the height advertised in handshakes current
    {
        let mut tip_rx = tip_state.subscribe();
        let local_height = local_height.clone();
        let mut signal = shutdown.to_signal();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = signal.wait() => break,
                    changed = tip_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let height = tip_rx.borrow().tip.height();
                        local_height.store(height, Ordering::SeqCst);
                    },
                }
            }
        });
    }

    // The optional address indexer follows the tip
    if node.address_index {
        let repo = Arc::new(
            AddressIndexRepository::new(&engine, AddressIndexConfig::default().outpoint_cache_size)
                .map_err(|e| ExitError::new(ExitCode::StorageError, e))?,
        );
        let indexer = AddressIndexer::new(
            AddressIndexConfig::default(),
            repo,
            store.clone(),
            tree.clone(),
            tip_state.clone(),
            Arc::new(Base58AddressResolver::default()),
            shutdown.to_signal(),
        );
        let fatal = fatal.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = indexer.run().await {
                error!(target: LOG_TARGET, "Address indexer failed: {}", err);
                *fatal.lock().expect("fatal flag lock poisoned") =
                    Some(ExitError::new(ExitCode::StorageError, err));
                shutdown.trigger();
            }
        });
        info!(target: LOG_TARGET, "Address indexer enabled");
    }

    // The external rule engine seam; a permissive placeholder until one is attached
    let validator = Arc::new(MockValidator::new(true));

    let coordinator = ChainCoordinator::new(
        ChainCoordinatorConfig::default(),
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
        shutdown.to_signal(),
    );
    {
        let fatal = fatal.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = coordinator.run().await {
                error!(target: LOG_TARGET, "Chain coordinator failed: {}", err);
                *fatal.lock().expect("fatal flag lock poisoned") =
                    Some(ExitError::new(ExitCode::FatalRuntimeError, err));
                shutdown.trigger();
            }
        });
    }

    info!(target: LOG_TARGET, "Sable node is running");
    let mut signal = shutdown.to_signal();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!(target: LOG_TARGET, "Interrupt received; shutting down");
            shutdown.trigger();
        },
        _ = signal.wait() => {},
    }

    // Bounded grace period: queues drain their final batches and the book flushes
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;

    let fatal_error = fatal.lock().expect("fatal flag lock poisoned").take();
    match fatal_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Fail fast (with a clear exit code) when a listen endpoint is unavailable, before any task starts.
fn preflight_bind_check(config: &sable_comms::CommsConfig) -> Result<(), ExitError> {
    for address in &config.listen_addresses {
        std::net::TcpListener::bind(address)
            .map_err(|e| ExitError::new(ExitCode::NetworkError, format!("cannot listen on {}: {}", address, e)))?;
    }
    Ok(())
}
