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

use thiserror::Error;

use crate::{peer_manager::PeerId, protocol::ProtocolError};

#[derive(Debug, Error)]
pub enum ConnectionManagerError {
    #[error("Protocol error: {0}")]
    ProtocolError(#[from] ProtocolError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Storage error: {0}")]
    StorageError(#[from] sable_storage::StorageError),
    #[error("Peer book error: {0}")]
    PeerManagerError(#[from] crate::peer_manager::PeerManagerError),
    #[error("The endpoint is banned")]
    Banned,
    #[error("The inbound connection ceiling has been reached")]
    MaxInboundReached,
    #[error("The outbound connection ceiling has been reached")]
    MaxOutboundReached,
    #[error("Peer {0} is not connected")]
    PeerNotFound(PeerId),
    #[error("Dial to {0} timed out")]
    DialTimedOut(std::net::SocketAddr),
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("The peer's send queue is full")]
    SendQueueFull,
    #[error("Connected to self")]
    ConnectedToSelf,
    #[error("The connection manager has shut down")]
    ChannelClosed,
}
