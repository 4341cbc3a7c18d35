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

use sable_storage::{KeyValStore, StoreBuilder, WriteTransaction};
use tempfile::TempDir;

fn init(dir: &TempDir) -> KeyValStore {
    StoreBuilder::new(dir.path())
        .add_store("blocks")
        .add_store("headers")
        .build()
        .unwrap()
}

#[test]
fn insert_get_delete_roundtrip() {
    let dir = TempDir::new().unwrap();
    let engine = init(&dir);
    let blocks = engine.get_handle("blocks").unwrap();

    assert!(blocks.get(b"k1").unwrap().is_none());
    blocks.insert(b"k1", b"v1").unwrap();
    assert_eq!(blocks.get(b"k1").unwrap().unwrap(), b"v1");
    assert!(blocks.exists(b"k1").unwrap());

    blocks.delete(b"k1").unwrap();
    assert!(blocks.get(b"k1").unwrap().is_none());
}

#[test]
fn unknown_store_is_rejected() {
    let dir = TempDir::new().unwrap();
    let engine = init(&dir);
    assert!(engine.get_handle("nope").is_err());
}

#[test]
fn transaction_commits_atomically_across_stores() {
    let dir = TempDir::new().unwrap();
    let engine = init(&dir);
    let blocks = engine.get_handle("blocks").unwrap();
    let headers = engine.get_handle("headers").unwrap();

    blocks.insert(b"old", b"x").unwrap();

    let mut txn = WriteTransaction::new();
    txn.insert(&blocks, b"b1".to_vec(), b"block-one".to_vec())
        .insert(&headers, b"h1".to_vec(), b"header-one".to_vec())
        .delete(&blocks, b"old".to_vec());
    engine.commit(txn).unwrap();

    assert_eq!(blocks.get(b"b1").unwrap().unwrap(), b"block-one");
    assert_eq!(headers.get(b"h1").unwrap().unwrap(), b"header-one");
    assert!(blocks.get(b"old").unwrap().is_none());
}

#[test]
fn empty_transaction_is_a_noop() {
    let dir = TempDir::new().unwrap();
    let engine = init(&dir);
    engine.commit(WriteTransaction::new()).unwrap();
}

#[test]
fn scan_prefix_returns_ordered_matches_only() {
    let dir = TempDir::new().unwrap();
    let engine = init(&dir);
    let headers = engine.get_handle("headers").unwrap();

    headers.insert(b"a/3", b"3").unwrap();
    headers.insert(b"a/1", b"1").unwrap();
    headers.insert(b"b/1", b"x").unwrap();
    headers.insert(b"a/2", b"2").unwrap();

    let entries = headers.scan_prefix(b"a/").unwrap();
    let keys = entries.iter().map(|(k, _)| k.as_slice()).collect::<Vec<_>>();
    assert_eq!(keys, vec![&b"a/1"[..], &b"a/2"[..], &b"a/3"[..]]);
}

#[test]
fn first_and_last_follow_key_order() {
    let dir = TempDir::new().unwrap();
    let engine = init(&dir);
    let headers = engine.get_handle("headers").unwrap();
    assert!(headers.is_empty().unwrap());

    for height in [3u32, 1, 7, 5] {
        headers.insert(&height.to_be_bytes(), &height.to_le_bytes()).unwrap();
    }

    let (first, _) = headers.first().unwrap().unwrap();
    let (last, _) = headers.last().unwrap().unwrap();
    assert_eq!(first, 1u32.to_be_bytes());
    assert_eq!(last, 7u32.to_be_bytes());
}

#[test]
fn values_survive_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let engine = init(&dir);
        let blocks = engine.get_handle("blocks").unwrap();
        blocks.insert(b"persisted", b"yes").unwrap();
    }
    let engine = init(&dir);
    let blocks = engine.get_handle("blocks").unwrap();
    assert_eq!(blocks.get(b"persisted").unwrap().unwrap(), b"yes");
}

#[test]
fn compaction_completes_synchronously() {
    let dir = TempDir::new().unwrap();
    let engine = init(&dir);
    let blocks = engine.get_handle("blocks").unwrap();
    for i in 0u32..512 {
        blocks.insert(&i.to_be_bytes(), &[0u8; 128]).unwrap();
    }
    for i in 0u32..512 {
        blocks.delete(&i.to_be_bytes()).unwrap();
    }
    engine.compact("blocks").unwrap();
    assert!(blocks.is_empty().unwrap());
}
