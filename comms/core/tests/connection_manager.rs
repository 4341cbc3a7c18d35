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
    net::SocketAddr,
    sync::{atomic::AtomicU64, Arc},
    time::Duration,
};

use bytes::Bytes;
use sable_comms::{
    connection_manager::REASON_NON_WHITELISTED_DURING_IBD,
    peer_manager::{BanRegistry, PeerAddressBook},
    Command,
    CommsConfig,
    ConnectionManager,
    ConnectivityEvent,
    ConnectivityRequester,
    InboundMessage,
    MessageFrame,
    SystemClock,
};
use sable_shutdown::Shutdown;
use sable_storage::StoreBuilder;
use tempfile::TempDir;
use tokio::sync::mpsc;

const MAGIC: [u8; 4] = *b"tst0";

struct TestNode {
    requester: ConnectivityRequester,
    inbound_rx: mpsc::Receiver<InboundMessage>,
    address: SocketAddr,
    _dir: TempDir,
}

fn free_local_address() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

async fn spawn_node(listen: Option<SocketAddr>, shutdown: &Shutdown) -> TestNode {
    let dir = TempDir::new().unwrap();
    let engine = StoreBuilder::new(dir.path()).add_store("peers").build().unwrap();
    let clock = Arc::new(SystemClock);
    let book = Arc::new(PeerAddressBook::new(engine.get_handle("peers").unwrap(), clock.clone()).unwrap());
    let bans = Arc::new(BanRegistry::new(clock.clone()));

    let address = listen.unwrap_or_else(free_local_address);
    let config = CommsConfig {
        network_magic: MAGIC,
        listen_addresses: vec![address],
        handshake_timeout: Duration::from_secs(2),
        ..Default::default()
    };

    let (manager, requester, inbound_rx) = ConnectionManager::new(
        config,
        clock,
        book,
        bans,
        Arc::new(AtomicU64::new(0)),
        shutdown.to_signal(),
    );
    tokio::spawn(manager.run());
    // Give the listener a beat to bind
    tokio::time::sleep(Duration::from_millis(100)).await;

    TestNode {
        requester,
        inbound_rx,
        address,
        _dir: dir,
    }
}

async fn wait_for_event<F>(events: &mut sable_comms::connectivity::ConnectivityEventRx, mut predicate: F) -> ConnectivityEvent
where F: FnMut(&ConnectivityEvent) -> bool {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn inbound_is_refused_during_ibd_on_a_non_whitelisted_endpoint() {
    let shutdown = Shutdown::new();
    let node = spawn_node(None, &shutdown).await;
    let mut events = node.requester.subscribe_events();

    // The node starts in IBD; a raw inbound connection must be accepted then refused
    let stream = tokio::net::TcpStream::connect(node.address).await.unwrap();

    let event = wait_for_event(&mut events, |e| matches!(e, ConnectivityEvent::ConnectionFailed { .. })).await;
    match event {
        ConnectivityEvent::ConnectionFailed { reason, .. } => {
            assert_eq!(reason, REASON_NON_WHITELISTED_DURING_IBD);
        },
        other => panic!("unexpected event {:?}", other),
    }
    drop(stream);
}

#[tokio::test]
async fn peers_connect_and_data_frames_reach_the_domain_layer() {
    let shutdown = Shutdown::new();
    let mut listener_node = spawn_node(None, &shutdown).await;
    let dialer_node = spawn_node(None, &shutdown).await;

    listener_node.requester.set_ibd_state(false).await.unwrap();
    let mut listener_events = listener_node.requester.subscribe_events();

    let peer_id = dialer_node.requester.dial_peer(listener_node.address).await.unwrap();
    wait_for_event(&mut listener_events, |e| {
        matches!(e, ConnectivityEvent::PeerConnected { .. })
    })
    .await;

    let payload = Bytes::from_static(b"\x01\x02\x03\x04");
    dialer_node
        .requester
        .send_message(peer_id, MessageFrame::new(Command::Inv, payload.clone()))
        .await
        .unwrap();

    let inbound = tokio::time::timeout(Duration::from_secs(5), listener_node.inbound_rx.recv())
        .await
        .expect("timed out waiting for inbound message")
        .expect("inbound channel closed");
    assert_eq!(inbound.command, Command::Inv);
    assert_eq!(inbound.payload, payload);
}

#[tokio::test]
async fn banning_disconnects_and_blocks_reconnection() {
    let shutdown = Shutdown::new();
    let listener_node = spawn_node(None, &shutdown).await;
    let dialer_node = spawn_node(None, &shutdown).await;

    listener_node.requester.set_ibd_state(false).await.unwrap();
    let mut listener_events = listener_node.requester.subscribe_events();

    dialer_node.requester.dial_peer(listener_node.address).await.unwrap();
    wait_for_event(&mut listener_events, |e| {
        matches!(e, ConnectivityEvent::PeerConnected { .. })
    })
    .await;

    listener_node
        .requester
        .ban_peer_until("127.0.0.1".parse().unwrap(), None, "test ban".to_string())
        .await
        .unwrap();

    wait_for_event(&mut listener_events, |e| matches!(e, ConnectivityEvent::PeerBanned { .. })).await;
    wait_for_event(&mut listener_events, |e| {
        matches!(e, ConnectivityEvent::PeerDisconnected { .. })
    })
    .await;

    // A fresh inbound attempt from the banned endpoint is refused
    let _stream = tokio::net::TcpStream::connect(listener_node.address).await.unwrap();
    let event = wait_for_event(&mut listener_events, |e| {
        matches!(e, ConnectivityEvent::ConnectionFailed { .. })
    })
    .await;
    match event {
        ConnectivityEvent::ConnectionFailed { reason, .. } => assert!(reason.contains("banned")),
        other => panic!("unexpected event {:?}", other),
    }
}
