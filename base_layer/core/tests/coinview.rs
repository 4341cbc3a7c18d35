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

use std::sync::Arc;

use sable_core::{
    chain_storage::{
        store_names,
        CachedCoinView,
        ChainStorageError,
        Coin,
        CoinView,
        CoinViewChanges,
        CoinsRecord,
        PersistentCoinView,
        RewindRecord,
    },
    common::FixedHash,
    transactions::OutPoint,
};
use sable_storage::{KeyValStore, StoreBuilder};
use tempfile::TempDir;

fn open_engine(dir: &TempDir) -> KeyValStore {
    let mut builder = StoreBuilder::new(dir.path());
    for name in store_names::all() {
        builder = builder.add_store(name);
    }
    builder.build().unwrap()
}

fn genesis() -> FixedHash {
    FixedHash::from([0xaa; 32])
}

fn tip(n: u8) -> FixedHash {
    FixedHash::from([n; 32])
}

fn coin(value: u64, height: u64) -> Coin {
    Coin {
        value,
        script_pubkey: vec![0x51],
        height,
        is_reward: false,
    }
}

fn record(tag: u8, coins: Vec<Option<Coin>>) -> CoinsRecord {
    CoinsRecord {
        txid: FixedHash::from([tag; 32]),
        outputs: coins,
    }
}

/// Changes for a block at `height` creating `created` and spending `spent`.
fn changes(height: u64, previous_tip: FixedHash, created: Vec<CoinsRecord>, spent: Vec<(OutPoint, Coin)>) -> CoinViewChanges {
    CoinViewChanges {
        rewind_records: vec![RewindRecord {
            height,
            previous_tip,
            removed_txids: created.iter().map(|r| r.txid).collect(),
            restored: spent,
        }],
        originals: Vec::new(),
        modified: created,
    }
}

#[test]
fn save_then_rewind_returns_the_old_tip() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir);
    let view = PersistentCoinView::new(&engine, genesis(), None).unwrap();
    assert_eq!(view.get_tip_hash().unwrap(), genesis());

    let created = vec![record(1, vec![Some(coin(100, 1))])];
    view.save_changes(changes(1, genesis(), created, vec![]), genesis(), tip(1), 1)
        .unwrap();
    assert_eq!(view.get_tip_hash().unwrap(), tip(1));

    let previous = view.rewind().unwrap();
    assert_eq!(previous, genesis());
    assert_eq!(view.get_tip_hash().unwrap(), genesis());
}

#[test]
fn stale_old_tip_is_rejected_and_does_not_mutate() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir);
    let view = PersistentCoinView::new(&engine, genesis(), None).unwrap();

    let first = changes(1, genesis(), vec![record(1, vec![Some(coin(100, 1))])], vec![]);
    view.save_changes(first, genesis(), tip(1), 1).unwrap();

    // A second writer raced and still believes the tip is genesis
    let second = changes(1, genesis(), vec![record(2, vec![Some(coin(7, 1))])], vec![]);
    let err = view.save_changes(second, genesis(), tip(2), 1).unwrap_err();
    assert!(matches!(err, ChainStorageError::InvalidOldTip { .. }));

    assert_eq!(view.get_tip_hash().unwrap(), tip(1));
    let (_, records) = view.fetch_coins(&[FixedHash::from([2u8; 32])]).unwrap();
    assert!(records[0].is_none());
}

#[test]
fn concurrent_saves_admit_exactly_one_writer() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir);
    let view = Arc::new(PersistentCoinView::new(&engine, genesis(), None).unwrap());

    let mut handles = Vec::new();
    for tag in 1..=2u8 {
        let view = view.clone();
        handles.push(std::thread::spawn(move || {
            let attempt = changes(1, genesis(), vec![record(tag, vec![Some(coin(1, 1))])], vec![]);
            view.save_changes(attempt, genesis(), tip(tag), 1)
        }));
    }
    let results = handles.into_iter().map(|h| h.join().unwrap()).collect::<Vec<_>>();
    let succeeded = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(succeeded, 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(ChainStorageError::InvalidOldTip { .. }))));
}

#[test]
fn rewind_restores_exactly_one_block_of_state() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir);
    let view = PersistentCoinView::new(&engine, genesis(), None).unwrap();

    // Block 1 creates tx1 with two outputs
    let tx1 = record(1, vec![Some(coin(100, 1)), Some(coin(50, 1))]);
    view.save_changes(changes(1, genesis(), vec![tx1.clone()], vec![]), genesis(), tip(1), 1)
        .unwrap();

    // Block 2 spends tx1:0 and creates tx2
    let spent_outpoint = OutPoint::new(tx1.txid, 0);
    let spent_coin = coin(100, 1);
    let tx1_after = record(1, vec![None, Some(coin(50, 1))]);
    let tx2 = record(2, vec![Some(coin(99, 2))]);
    let mut block2 = changes(2, tip(1), vec![tx2.clone()], vec![(spent_outpoint, spent_coin.clone())]);
    block2.modified.push(tx1_after);
    view.save_changes(block2, tip(1), tip(2), 2).unwrap();

    let (_, records) = view.fetch_coins(&[tx1.txid, tx2.txid]).unwrap();
    assert_eq!(records[0].as_ref().unwrap().coin(0), None);
    assert!(records[1].is_some());

    // Applying rewind(2) to coinview(2) yields coinview(1)
    assert_eq!(view.rewind().unwrap(), tip(1));
    let (after_tip, records) = view.fetch_coins(&[tx1.txid, tx2.txid]).unwrap();
    assert_eq!(after_tip, tip(1));
    assert_eq!(records[0], Some(tx1));
    assert_eq!(records[1], None);
}

#[test]
fn fully_spent_records_are_pruned() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir);
    let view = PersistentCoinView::new(&engine, genesis(), None).unwrap();

    let tx1 = record(1, vec![Some(coin(10, 1))]);
    view.save_changes(changes(1, genesis(), vec![tx1.clone()], vec![]), genesis(), tip(1), 1)
        .unwrap();

    let spent = record(1, vec![None]);
    let mut block2 = changes(2, tip(1), vec![], vec![(OutPoint::new(tx1.txid, 0), coin(10, 1))]);
    block2.modified.push(spent);
    view.save_changes(block2, tip(1), tip(2), 2).unwrap();

    let (_, records) = view.fetch_coins(&[tx1.txid]).unwrap();
    assert!(records[0].is_none());
}

#[test]
fn fetch_coins_of_nothing_returns_the_tip_and_an_empty_list() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir);
    let view = PersistentCoinView::new(&engine, genesis(), None).unwrap();
    let (tip_hash, records) = view.fetch_coins(&[]).unwrap();
    assert_eq!(tip_hash, genesis());
    assert!(records.is_empty());
}

#[test]
fn rewind_at_genesis_resets_to_genesis() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir);
    let view = PersistentCoinView::new(&engine, genesis(), None).unwrap();
    assert_eq!(view.rewind().unwrap(), genesis());
    assert_eq!(view.get_tip_hash().unwrap(), genesis());
}

#[test]
fn rewind_data_index_tracks_the_sliding_window() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir);
    let view = PersistentCoinView::new(&engine, genesis(), Some(10)).unwrap();

    let tx1 = record(1, vec![Some(coin(10, 1))]);
    view.save_changes(changes(1, genesis(), vec![tx1.clone()], vec![]), genesis(), tip(1), 1)
        .unwrap();

    let outpoint = OutPoint::new(tx1.txid, 0);
    let mut block2 = changes(2, tip(1), vec![], vec![(outpoint, coin(10, 1))]);
    block2.modified.push(record(1, vec![None]));
    view.save_changes(block2, tip(1), tip(2), 2).unwrap();

    assert_eq!(view.rewind_data_height(&outpoint), Some(2));

    // Rewinding removes the entry for the undone block
    view.rewind().unwrap();
    assert_eq!(view.rewind_data_height(&outpoint), None);
}

#[test]
fn cached_layer_delegates_and_stays_consistent() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir);
    let persistent = PersistentCoinView::new(&engine, genesis(), None).unwrap();
    let view = CoinView::Cached(CachedCoinView::new(CoinView::Persistent(persistent), 1024));

    // The stack walks down to the persistent layer
    assert!(view.inner().is_some());
    assert!(view.inner().unwrap().inner().is_none());
    assert_eq!(view.get_tip_hash().unwrap(), genesis());

    let tx1 = record(1, vec![Some(coin(42, 1))]);
    view.save_changes(changes(1, genesis(), vec![tx1.clone()], vec![]), genesis(), tip(1), 1)
        .unwrap();

    // Served from cache and from the engine identically
    let (_, first) = view.fetch_coins(&[tx1.txid]).unwrap();
    let (_, second) = view.fetch_coins(&[tx1.txid]).unwrap();
    assert_eq!(first, second);
    assert_eq!(first[0].as_ref().unwrap().coin(0).unwrap().value, 42);

    // Rewind invalidates the cache
    view.rewind().unwrap();
    let (_, after) = view.fetch_coins(&[tx1.txid]).unwrap();
    assert!(after[0].is_none());
}
