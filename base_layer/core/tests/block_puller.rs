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

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use sable_comms::{
    clock::ManualClock,
    protocol::InvMessage,
    test_utils::{create_connectivity_mock, ConnectivityManagerMockState},
    Command,
    PeerId,
};
use sable_core::{
    base_node::block_puller::{BlockPuller, BlockPullerConfig, DownloadPriority, UNASSIGNED_PEER},
    blocks::Block,
    common::FixedHash,
    test_helpers::chain::{self, TestChain},
};
use sable_shutdown::Shutdown;

type Deliveries = Arc<Mutex<Vec<(FixedHash, Option<Block>, PeerId)>>>;

struct TestHarness {
    puller: Arc<BlockPuller>,
    deliveries: Deliveries,
    mock_state: ConnectivityManagerMockState,
    clock: Arc<ManualClock>,
    chain: TestChain,
    _shutdown: Shutdown,
}

fn config() -> BlockPullerConfig {
    BlockPullerConfig {
        max_block_delivery_time: Duration::from_secs(30),
        ..Default::default()
    }
}

async fn setup(chain_length: usize) -> TestHarness {
    let chain = chain::linear_chain(chain_length);
    let (connectivity, mock) = create_connectivity_mock();
    let mock_state = mock.spawn();
    let clock = Arc::new(ManualClock::new(1_000_000));
    let shutdown = Shutdown::new();

    let deliveries: Deliveries = Arc::new(Mutex::new(Vec::new()));
    let callback_log = deliveries.clone();
    let puller = BlockPuller::new(
        config(),
        clock.clone(),
        connectivity,
        Arc::new(move |hash, block, peer| {
            callback_log.lock().unwrap().push((hash, block, peer));
        }),
        shutdown.to_signal(),
    );
    puller.set_rng_seed(42);
    puller.spawn();

    TestHarness {
        puller,
        deliveries,
        mock_state,
        clock,
        chain,
        _shutdown: shutdown,
    }
}

async fn settle() {
    // Let the assigner drain its queues
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
}

/// Every (peer, hash) pair currently requested over the wire.
fn requested_hashes(state: &ConnectivityManagerMockState) -> HashMap<FixedHash, Vec<PeerId>> {
    let mut requested: HashMap<FixedHash, Vec<PeerId>> = HashMap::new();
    for (peer, frame) in state.take_sent_messages() {
        assert_eq!(frame.command, Command::GetData);
        let inv = InvMessage::from_payload(frame.payload).unwrap();
        for item in inv.items {
            requested.entry(FixedHash::from(item.hash)).or_default().push(peer);
        }
    }
    requested
}

#[tokio::test(start_paused = true)]
async fn zero_peers_results_in_null_callbacks_for_every_header() {
    let harness = setup(5).await;
    let headers = harness.chain.blocks[1..=5]
        .iter()
        .map(|b| b.chain_header().clone())
        .collect::<Vec<_>>();
    harness.puller.request_download(headers, DownloadPriority::Normal);
    settle().await;

    let deliveries = harness.deliveries.lock().unwrap();
    assert_eq!(deliveries.len(), 5);
    for (_, block, peer) in deliveries.iter() {
        assert!(block.is_none());
        assert_eq!(*peer, UNASSIGNED_PEER);
    }
}

#[tokio::test(start_paused = true)]
async fn every_header_is_assigned_to_exactly_one_peer() {
    let harness = setup(5).await;
    let tip = harness.chain.blocks[5].chain_header().clone();
    harness.puller.peer_tip_claimed(PeerId(1), tip.clone());
    harness.puller.peer_tip_claimed(PeerId(2), tip);

    let headers = harness.chain.blocks[1..=5]
        .iter()
        .map(|b| b.chain_header().clone())
        .collect::<Vec<_>>();
    harness.puller.request_download(headers, DownloadPriority::Normal);
    settle().await;

    let requested = requested_hashes(&harness.mock_state);
    assert_eq!(requested.len(), 5);
    for (hash, peers) in requested {
        assert_eq!(peers.len(), 1, "{} was assigned to more than one peer", hash);
    }
    assert_eq!(harness.puller.in_flight(), 5);
    assert!(harness.deliveries.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn peers_behind_a_header_are_not_eligible_for_it() {
    let harness = setup(6).await;
    // The only peer claims height 3; headers 4..6 have no eligible peer
    let claimed = harness.chain.blocks[3].chain_header().clone();
    harness.puller.peer_tip_claimed(PeerId(1), claimed);

    let headers = harness.chain.blocks[1..=6]
        .iter()
        .map(|b| b.chain_header().clone())
        .collect::<Vec<_>>();
    harness.puller.request_download(headers, DownloadPriority::Normal);
    settle().await;

    let requested = requested_hashes(&harness.mock_state);
    assert_eq!(requested.len(), 3);
    let deliveries = harness.deliveries.lock().unwrap();
    let nulls = deliveries.iter().filter(|(_, block, _)| block.is_none()).count();
    assert_eq!(nulls, 3);
}

#[tokio::test(start_paused = true)]
async fn delivery_fires_the_callback_once_and_drops_wrong_peers() {
    let harness = setup(3).await;
    let tip = harness.chain.blocks[3].chain_header().clone();
    harness.puller.peer_tip_claimed(PeerId(1), tip);

    let header = harness.chain.blocks[1].chain_header().clone();
    let block = harness.chain.blocks[1].block().as_ref().clone();
    let hash = *header.hash();
    harness.puller.request_download(vec![header], DownloadPriority::Normal);
    settle().await;
    assert_eq!(harness.puller.in_flight(), 1);

    // A delivery from a peer that was never assigned the block is ignored
    harness.puller.push_block(hash, block.clone(), PeerId(9));
    assert_eq!(harness.puller.in_flight(), 1);
    assert!(harness.deliveries.lock().unwrap().is_empty());

    harness.clock.advance_millis(800);
    harness.puller.push_block(hash, block.clone(), PeerId(1));
    assert_eq!(harness.puller.in_flight(), 0);

    // A repeat delivery is no longer expected and is dropped
    harness.puller.push_block(hash, block, PeerId(1));

    let deliveries = harness.deliveries.lock().unwrap();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].0, hash);
    assert!(deliveries[0].1.is_some());
    assert_eq!(deliveries[0].2, PeerId(1));
}

#[tokio::test(start_paused = true)]
async fn stalled_important_work_is_released_and_reassigned() {
    let harness = setup(5).await;
    let tip = harness.chain.blocks[5].chain_header().clone();
    harness.puller.peer_tip_claimed(PeerId(1), tip.clone());
    harness.puller.peer_tip_claimed(PeerId(2), tip);
    harness.puller.set_consensus_height(0);

    let headers = harness.chain.blocks[1..=5]
        .iter()
        .map(|b| b.chain_header().clone())
        .collect::<Vec<_>>();
    harness.puller.request_download(headers, DownloadPriority::Normal);
    settle().await;

    let first_round = requested_hashes(&harness.mock_state);
    assert_eq!(first_round.len(), 5);
    let slow_peer = *first_round.values().next().unwrap().first().unwrap();
    let fast_peer = if slow_peer == PeerId(1) { PeerId(2) } else { PeerId(1) };

    // The fast peer delivers everything it was assigned; the slow peer delivers nothing
    for (hash, peers) in &first_round {
        if peers[0] == fast_peer {
            let entry = harness
                .chain
                .blocks
                .iter()
                .find(|b| b.hash() == hash)
                .expect("requested hash comes from the chain");
            harness.clock.advance_millis(5);
            harness.puller.push_block(*hash, entry.block().as_ref().clone(), fast_peer);
        }
    }

    // Pass the delivery deadline; the stall sweep runs on virtual time
    harness.clock.advance_secs(31);
    tokio::time::sleep(Duration::from_millis(600)).await;
    settle().await;

    // Released work went out again, and only to the fast peer (the stalled one is penalized to ~zero)
    let second_round = requested_hashes(&harness.mock_state);
    assert!(!second_round.is_empty());
    for (hash, peers) in &second_round {
        assert_eq!(peers, &vec![fast_peer], "{} was reassigned to the stalled peer", hash);
    }

    // The reassigned block can now be delivered by the new assignee, exactly once
    let (hash, _) = second_round.iter().next().unwrap();
    let entry = harness.chain.blocks.iter().find(|b| b.hash() == hash).unwrap();
    harness.clock.advance_millis(5);
    harness.puller.push_block(*hash, entry.block().as_ref().clone(), fast_peer);

    let deliveries = harness.deliveries.lock().unwrap();
    let delivered_for_hash = deliveries.iter().filter(|(h, _, _)| h == hash).collect::<Vec<_>>();
    assert_eq!(delivered_for_hash.len(), 1);
    assert_eq!(delivered_for_hash[0].2, fast_peer);
}

#[tokio::test(start_paused = true)]
async fn disconnecting_a_peer_releases_its_assignments() {
    let harness = setup(4).await;
    let tip = harness.chain.blocks[4].chain_header().clone();
    harness.puller.peer_tip_claimed(PeerId(1), tip);

    let headers = harness.chain.blocks[1..=4]
        .iter()
        .map(|b| b.chain_header().clone())
        .collect::<Vec<_>>();
    harness.puller.request_download(headers, DownloadPriority::Normal);
    settle().await;
    assert_eq!(harness.puller.in_flight(), 4);
    harness.mock_state.take_sent_messages();

    // With the only peer gone, the released work has no eligible peer: null callbacks for all four
    harness.puller.peer_disconnected(PeerId(1));
    settle().await;

    assert_eq!(harness.puller.in_flight(), 0);
    let deliveries = harness.deliveries.lock().unwrap();
    assert_eq!(deliveries.len(), 4);
    assert!(deliveries.iter().all(|(_, block, _)| block.is_none()));
}

#[tokio::test(start_paused = true)]
async fn failed_batch_requests_disconnect_the_peer() {
    let harness = setup(2).await;
    let tip = harness.chain.blocks[2].chain_header().clone();
    harness.puller.peer_tip_claimed(PeerId(1), tip);
    harness.mock_state.set_peer_send_failure(PeerId(1));

    let headers = vec![harness.chain.blocks[1].chain_header().clone()];
    harness.puller.request_download(headers, DownloadPriority::Normal);
    settle().await;

    // The send failure removed the peer; reassignment found nobody, so the header failed
    let deliveries = harness.deliveries.lock().unwrap();
    assert_eq!(deliveries.len(), 1);
    assert!(deliveries[0].1.is_none());
    let disconnects = harness.mock_state.get_disconnected_peers();
    assert!(disconnects.iter().any(|(id, _)| *id == PeerId(1)));
}
