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

//! Mocks for downstream tests. The connectivity mock services [`ConnectivityRequester`] calls without any
//! networking, recording what was asked of it.

use std::{
    net::{IpAddr, SocketAddr},
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::sync::{broadcast, mpsc};

use crate::{
    connectivity::{ConnectivityRequest, ConnectivityRequester, PeerInfo},
    peer_manager::PeerId,
    protocol::MessageFrame,
};

pub fn create_connectivity_mock() -> (ConnectivityRequester, ConnectivityManagerMock) {
    let (tx, rx) = mpsc::channel(64);
    let (event_tx, _) = broadcast::channel(64);
    (
        ConnectivityRequester::new(tx, event_tx),
        ConnectivityManagerMock {
            rx,
            state: ConnectivityManagerMockState::default(),
        },
    )
}

#[derive(Debug, Default)]
struct MockState {
    dialed_peers: Vec<SocketAddr>,
    sent_messages: Vec<(PeerId, MessageFrame)>,
    broadcasts: Vec<MessageFrame>,
    banned_peers: Vec<(IpAddr, Option<Duration>, String)>,
    disconnected_peers: Vec<(PeerId, String)>,
    connected_peers: Vec<PeerInfo>,
    /// Peer ids for which SendMessage replies with an error (simulating a failed request).
    failing_peers: Vec<PeerId>,
    is_ibd: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectivityManagerMockState {
    inner: Arc<Mutex<MockState>>,
}

impl ConnectivityManagerMockState {
    pub fn set_connected_peers(&self, peers: Vec<PeerInfo>) {
        self.with(|s| s.connected_peers = peers);
    }

    pub fn set_peer_send_failure(&self, peer_id: PeerId) {
        self.with(|s| s.failing_peers.push(peer_id));
    }

    pub fn take_sent_messages(&self) -> Vec<(PeerId, MessageFrame)> {
        self.with(|s| s.sent_messages.drain(..).collect())
    }

    pub fn sent_message_count(&self) -> usize {
        self.with(|s| s.sent_messages.len())
    }

    pub fn get_dialed_peers(&self) -> Vec<SocketAddr> {
        self.with(|s| s.dialed_peers.clone())
    }

    pub fn get_banned_peers(&self) -> Vec<(IpAddr, Option<Duration>, String)> {
        self.with(|s| s.banned_peers.clone())
    }

    pub fn get_disconnected_peers(&self) -> Vec<(PeerId, String)> {
        self.with(|s| s.disconnected_peers.clone())
    }

    pub fn get_ibd_state(&self) -> Option<bool> {
        self.with(|s| s.is_ibd)
    }

    fn with<T, F: FnOnce(&mut MockState) -> T>(&self, f: F) -> T {
        f(&mut self.inner.lock().expect("mock state lock poisoned"))
    }
}

pub struct ConnectivityManagerMock {
    rx: mpsc::Receiver<ConnectivityRequest>,
    state: ConnectivityManagerMockState,
}

impl ConnectivityManagerMock {
    pub fn get_shared_state(&self) -> ConnectivityManagerMockState {
        self.state.clone()
    }

    pub fn spawn(self) -> ConnectivityManagerMockState {
        let state = self.state.clone();
        tokio::spawn(self.run());
        state
    }

    async fn run(mut self) {
        while let Some(request) = self.rx.recv().await {
            self.handle(request);
        }
    }

    fn handle(&self, request: ConnectivityRequest) {
        use ConnectivityRequest::*;
        match request {
            Dial(address, reply) => {
                let peer_id = self.state.with(|s| {
                    s.dialed_peers.push(address);
                    PeerId(s.dialed_peers.len() as u64)
                });
                let _ = reply.send(Ok(peer_id));
            },
            SendMessage(peer_id, frame, reply) => {
                let failing = self.state.with(|s| {
                    if s.failing_peers.contains(&peer_id) {
                        true
                    } else {
                        s.sent_messages.push((peer_id, frame));
                        false
                    }
                });
                let result = if failing {
                    Err(crate::connection_manager::ConnectionManagerError::PeerNotFound(peer_id))
                } else {
                    Ok(())
                };
                let _ = reply.send(result);
            },
            BroadcastMessage(frame) => self.state.with(|s| s.broadcasts.push(frame)),
            DisconnectPeer(peer_id, reason) => self.state.with(|s| s.disconnected_peers.push((peer_id, reason))),
            BanPeer(address, duration, reason) => {
                self.state.with(|s| s.banned_peers.push((address, duration, reason)))
            },
            BanPeerId(peer_id, duration, reason) => self.state.with(|s| {
                s.banned_peers
                    .push((std::net::Ipv4Addr::new(127, 0, 0, 1).into(), duration, format!("{}: {}", peer_id, reason)))
            }),
            UnbanPeer(_) | ClearBans => {},
            GetConnectedPeers(reply) => {
                let peers = self.state.with(|s| s.connected_peers.clone());
                let _ = reply.send(peers);
            },
            SetIbdState(is_ibd) => self.state.with(|s| s.is_ibd = Some(is_ibd)),
        }
    }
}
