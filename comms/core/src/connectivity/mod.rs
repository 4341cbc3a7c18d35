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

//! The requester half of the connection manager actor. Components hold a cheap [`ConnectivityRequester`]
//! clone and never the manager itself; peer lifetime stays owned by the actor.

use std::{net::IpAddr, net::SocketAddr, time::Duration};

use tokio::sync::{broadcast, mpsc, oneshot};

use crate::{
    connection_manager::ConnectionManagerError,
    peer_manager::{ConnectionDirection, PeerId},
    protocol::MessageFrame,
};

pub type ConnectivityEventTx = broadcast::Sender<ConnectivityEvent>;
pub type ConnectivityEventRx = broadcast::Receiver<ConnectivityEvent>;

/// Events published by the connection manager. Subscribers must not block.
#[derive(Debug, Clone)]
pub enum ConnectivityEvent {
    PeerConnected {
        peer_id: PeerId,
        address: SocketAddr,
        direction: ConnectionDirection,
        claimed_height: u64,
    },
    PeerDisconnected {
        peer_id: PeerId,
        address: SocketAddr,
        reason: String,
    },
    PeerBanned {
        address: IpAddr,
        reason: String,
        until: u64,
    },
    /// An inbound or outbound connection attempt was refused before it became a peer.
    ConnectionFailed {
        address: SocketAddr,
        reason: String,
    },
}

/// A snapshot of one connected peer, safe to hold outside the actor.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub id: PeerId,
    pub address: SocketAddr,
    pub direction: ConnectionDirection,
    pub claimed_height: u64,
    pub user_agent: String,
}

#[derive(Debug)]
pub(crate) enum ConnectivityRequest {
    Dial(SocketAddr, oneshot::Sender<Result<PeerId, ConnectionManagerError>>),
    SendMessage(PeerId, MessageFrame, oneshot::Sender<Result<(), ConnectionManagerError>>),
    BroadcastMessage(MessageFrame),
    DisconnectPeer(PeerId, String),
    BanPeer(IpAddr, Option<Duration>, String),
    BanPeerId(PeerId, Option<Duration>, String),
    UnbanPeer(IpAddr),
    ClearBans,
    GetConnectedPeers(oneshot::Sender<Vec<PeerInfo>>),
    SetIbdState(bool),
}

#[derive(Clone)]
pub struct ConnectivityRequester {
    tx: mpsc::Sender<ConnectivityRequest>,
    event_tx: ConnectivityEventTx,
}

impl ConnectivityRequester {
    pub(crate) fn new(tx: mpsc::Sender<ConnectivityRequest>, event_tx: ConnectivityEventTx) -> Self {
        Self { tx, event_tx }
    }

    pub fn subscribe_events(&self) -> ConnectivityEventRx {
        self.event_tx.subscribe()
    }

    pub async fn dial_peer(&self, address: SocketAddr) -> Result<PeerId, ConnectionManagerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(ConnectivityRequest::Dial(address, reply_tx)).await?;
        reply_rx.await.map_err(|_| ConnectionManagerError::ChannelClosed)?
    }

    /// Queue a message to a peer. An error means the peer is gone or cannot keep up and has been dropped;
    /// callers should treat it as a disconnect.
    pub async fn send_message(&self, peer_id: PeerId, frame: MessageFrame) -> Result<(), ConnectionManagerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(ConnectivityRequest::SendMessage(peer_id, frame, reply_tx))
            .await?;
        reply_rx.await.map_err(|_| ConnectionManagerError::ChannelClosed)?
    }

    pub async fn broadcast_message(&self, frame: MessageFrame) -> Result<(), ConnectionManagerError> {
        self.send(ConnectivityRequest::BroadcastMessage(frame)).await
    }

    pub async fn disconnect_peer(&self, peer_id: PeerId, reason: String) -> Result<(), ConnectionManagerError> {
        self.send(ConnectivityRequest::DisconnectPeer(peer_id, reason)).await
    }

    /// Ban the endpoint and tear down any connection to it. `duration = None` applies the configured default.
    pub async fn ban_peer_until(
        &self,
        address: IpAddr,
        duration: Option<Duration>,
        reason: String,
    ) -> Result<(), ConnectionManagerError> {
        self.send(ConnectivityRequest::BanPeer(address, duration, reason)).await
    }

    /// Ban the endpoint behind a connected peer id. A no-op if the peer has already gone.
    pub async fn ban_peer_id_until(
        &self,
        peer_id: PeerId,
        duration: Option<Duration>,
        reason: String,
    ) -> Result<(), ConnectionManagerError> {
        self.send(ConnectivityRequest::BanPeerId(peer_id, duration, reason)).await
    }

    pub async fn unban_peer(&self, address: IpAddr) -> Result<(), ConnectionManagerError> {
        self.send(ConnectivityRequest::UnbanPeer(address)).await
    }

    pub async fn clear_bans(&self) -> Result<(), ConnectionManagerError> {
        self.send(ConnectivityRequest::ClearBans).await
    }

    pub async fn get_connected_peers(&self) -> Result<Vec<PeerInfo>, ConnectionManagerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(ConnectivityRequest::GetConnectedPeers(reply_tx)).await?;
        reply_rx.await.map_err(|_| ConnectionManagerError::ChannelClosed)
    }

    /// Tell the listener whether initial block download is still in progress (it gates inbound acceptance).
    pub async fn set_ibd_state(&self, is_ibd: bool) -> Result<(), ConnectionManagerError> {
        self.send(ConnectivityRequest::SetIbdState(is_ibd)).await
    }

    async fn send(&self, request: ConnectivityRequest) -> Result<(), ConnectionManagerError> {
        self.tx
            .send(request)
            .await
            .map_err(|_| ConnectionManagerError::ChannelClosed)
    }
}
