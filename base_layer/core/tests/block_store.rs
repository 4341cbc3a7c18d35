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

use std::{sync::Arc, time::Duration};

use sable_core::{
    chain_storage::{store_names, BlockStoreConfig, BlockStoreDatabase, BlockStoreQueue, ChainStorageError},
    common::FixedHash,
    consensus,
    events::{EventBus, NodeEvent, NodeEventKind},
    test_helpers::chain::{self, TestChain},
};
use sable_shutdown::Shutdown;
use sable_storage::{KeyValStore, StoreBuilder};
use tempfile::TempDir;

fn open_engine(dir: &TempDir) -> KeyValStore {
    let mut builder = StoreBuilder::new(dir.path());
    for name in store_names::all() {
        builder = builder.add_store(name);
    }
    builder.build().unwrap()
}

fn open_db(engine: &KeyValStore, config: BlockStoreConfig) -> Arc<BlockStoreDatabase> {
    Arc::new(BlockStoreDatabase::new(engine, consensus::genesis_hash(), config).unwrap())
}

fn spawn_queue(db: Arc<BlockStoreDatabase>, chain: &TestChain, shutdown: &Shutdown) -> (BlockStoreQueue, EventBus) {
    let events = EventBus::new();
    let queue = BlockStoreQueue::spawn(db, chain.tree.clone(), events.clone(), shutdown.to_signal());
    (queue, events)
}

async fn wait_for_tip(queue: &BlockStoreQueue, expected: FixedHash) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if queue.store_tip().unwrap().0 == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for the store tip");
}

#[tokio::test]
async fn linear_sync_persists_and_chains() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir);
    let db = open_db(&engine, BlockStoreConfig::default());
    let chain = chain::linear_chain(3);
    db.initialize(&chain.tree, false).unwrap();

    let shutdown = Shutdown::new();
    let (queue, _) = spawn_queue(db, &chain, &shutdown);

    for entry in &chain.blocks[1..=3] {
        queue.add_to_pending(entry.clone());
    }
    // Pending entries serve reads before anything is durable
    assert!(queue.get_block(chain.blocks[1].hash()).unwrap().is_some());

    queue.request_flush();
    wait_for_tip(&queue, *chain.blocks[3].hash()).await;

    // Every stored adjacent pair chains: block(h+1).prev == hash(block(h))
    let b1 = queue.get_block(chain.blocks[1].hash()).unwrap().unwrap();
    let b2 = queue.get_block(chain.blocks[2].hash()).unwrap().unwrap();
    let b3 = queue.get_block(chain.blocks[3].hash()).unwrap().unwrap();
    assert_eq!(b2.header.prev_hash, b1.hash());
    assert_eq!(b3.header.prev_hash, b2.hash());

    // Byte-identical roundtrip through the store
    assert_eq!(b2.to_bytes(), chain.blocks[2].block().to_bytes());
}

#[tokio::test]
async fn reorg_on_flush_deletes_the_abandoned_suffix() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir);
    let db = open_db(&engine, BlockStoreConfig::default());
    let mut chain = chain::linear_chain(3);
    db.initialize(&chain.tree, false).unwrap();

    let shutdown = Shutdown::new();
    let (queue, events) = spawn_queue(db, &chain, &shutdown);
    let mut disconnects = events.subscribe(NodeEventKind::BlockDisconnected);

    // First flush: A1, A2, A3
    for entry in &chain.blocks[1..=3] {
        queue.add_to_pending(entry.clone());
    }
    queue.request_flush();
    wait_for_tip(&queue, *chain.blocks[3].hash()).await;

    // A competing heavier branch B2..B4 off A1
    let fork = chain::extend_fork(&mut chain, 1, 3, 9);
    for entry in &fork {
        queue.add_to_pending(entry.clone());
    }
    queue.request_flush();
    wait_for_tip(&queue, *fork[2].hash()).await;

    // A1 plus the fork survive; A2 and A3 are gone
    assert!(queue.get_block(chain.blocks[1].hash()).unwrap().is_some());
    for entry in &fork {
        assert!(queue.get_block(entry.hash()).unwrap().is_some());
    }
    assert!(queue.get_block(chain.blocks[2].hash()).unwrap().is_none());
    assert!(queue.get_block(chain.blocks[3].hash()).unwrap().is_none());

    // Disconnect events carried the abandoned blocks
    let mut disconnected = Vec::new();
    while let Ok(event) = disconnects.try_recv() {
        if let NodeEvent::BlockDisconnected(entry) = event {
            disconnected.push(*entry.hash());
        }
    }
    assert!(disconnected.contains(chain.blocks[2].hash()));
    assert!(disconnected.contains(chain.blocks[3].hash()));
}

#[tokio::test]
async fn empty_flush_is_a_noop() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir);
    let db = open_db(&engine, BlockStoreConfig::default());
    let chain = chain::genesis_chain();
    db.initialize(&chain.tree, false).unwrap();

    let shutdown = Shutdown::new();
    let (queue, _) = spawn_queue(db, &chain, &shutdown);
    queue.request_flush();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(queue.store_tip().unwrap(), (consensus::genesis_hash(), 0));
}

#[test]
fn recovery_walks_back_to_a_known_header() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir);
    let db = BlockStoreDatabase::new(&engine, consensus::genesis_hash(), BlockStoreConfig::default()).unwrap();
    let chain = chain::linear_chain(3);

    // Persist A1..A3 directly
    db.write_cleaned_batch(&[], &chain.blocks[1..=3].to_vec(), (*chain.blocks[3].hash(), 3))
        .unwrap();

    // A fresh tree that only knows genesis and A1 (the rest of the headers were lost)
    let partial = chain::genesis_chain();
    partial
        .tree
        .write()
        .unwrap()
        .add_header(chain.blocks[1].block().header)
        .unwrap();

    db.initialize(&partial.tree, false).unwrap();
    assert_eq!(db.store_tip().unwrap(), (*chain.blocks[1].hash(), 1));
    assert!(db.get_block(chain.blocks[2].hash()).unwrap().is_none());
    assert!(db.get_block(chain.blocks[3].hash()).unwrap().is_none());
    assert!(db.get_block(chain.blocks[1].hash()).unwrap().is_some());
}

#[test]
fn initialization_after_the_consensus_tip_is_fatal() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir);
    let db = BlockStoreDatabase::new(&engine, consensus::genesis_hash(), BlockStoreConfig::default()).unwrap();
    let chain = chain::genesis_chain();
    let err = db.initialize(&chain.tree, true).unwrap_err();
    assert!(matches!(err, ChainStorageError::InitializationFailed(_)));
}

#[test]
fn toggling_the_tx_index_on_a_non_empty_store_is_rejected() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir);
    let chain = chain::linear_chain(1);

    let with_index = BlockStoreDatabase::new(&engine, consensus::genesis_hash(), BlockStoreConfig {
        tx_index: true,
        ..Default::default()
    })
    .unwrap();
    with_index.initialize(&chain.tree, false).unwrap();
    with_index
        .write_cleaned_batch(&[], &chain.blocks[1..=1].to_vec(), (*chain.blocks[1].hash(), 1))
        .unwrap();

    let without_index =
        BlockStoreDatabase::new(&engine, consensus::genesis_hash(), BlockStoreConfig::default()).unwrap();
    let err = without_index.initialize(&chain.tree, false).unwrap_err();
    assert!(matches!(err, ChainStorageError::InitializationFailed(_)));
}

#[test]
fn tx_index_maps_transactions_to_their_block() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir);
    let db = BlockStoreDatabase::new(&engine, consensus::genesis_hash(), BlockStoreConfig {
        tx_index: true,
        ..Default::default()
    })
    .unwrap();
    let chain = chain::linear_chain(2);
    db.initialize(&chain.tree, false).unwrap();
    db.write_cleaned_batch(&[], &chain.blocks[1..=2].to_vec(), (*chain.blocks[2].hash(), 2))
        .unwrap();

    let txid = chain.blocks[2].block().transactions[0].txid();
    assert_eq!(db.get_block_hash_by_txid(&txid).unwrap(), Some(*chain.blocks[2].hash()));
    assert_eq!(db.get_block_hash_by_txid(&FixedHash::from([5u8; 32])).unwrap(), None);
}

#[test]
fn tx_index_lookup_without_the_index_errors() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir);
    let db = BlockStoreDatabase::new(&engine, consensus::genesis_hash(), BlockStoreConfig::default()).unwrap();
    assert!(matches!(
        db.get_block_hash_by_txid(&FixedHash::zero()).unwrap_err(),
        ChainStorageError::TransactionIndexDisabled
    ));
}

#[test]
fn pruning_keeps_only_the_recent_window() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir);
    let db = BlockStoreDatabase::new(&engine, consensus::genesis_hash(), BlockStoreConfig {
        blocks_to_keep: Some(2),
        ..Default::default()
    })
    .unwrap();
    let chain = chain::linear_chain(6);
    db.initialize(&chain.tree, false).unwrap();
    db.write_cleaned_batch(&[], &chain.blocks[1..=6].to_vec(), (*chain.blocks[6].hash(), 6))
        .unwrap();

    let pruned = db.prune(&chain.tree).unwrap();
    assert_eq!(pruned, 4);
    assert_eq!(db.pruned_tip().unwrap(), 4);
    for entry in &chain.blocks[1..=4] {
        assert!(db.get_block(entry.hash()).unwrap().is_none());
    }
    for entry in &chain.blocks[5..=6] {
        assert!(db.get_block(entry.hash()).unwrap().is_some());
    }

    // Re-running with nothing new to prune is a no-op
    assert_eq!(db.prune(&chain.tree).unwrap(), 0);
}
