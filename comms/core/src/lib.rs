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

//! The peer-to-peer layer of the Sable node: wire framing and handshake, connection management with IP-range and
//! ban policy, a persisted peer address book, and seed/gossip peer discovery. The layer is chain-agnostic: block
//! and transaction payloads pass through as opaque frames consumed by the domain layer.

pub mod clock;
pub mod config;
pub mod connection_manager;
pub mod connectivity;
pub mod discovery;
pub mod peer_manager;
pub mod protocol;
pub mod test_utils;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CommsConfig, DiscoveryConfig};
pub use connection_manager::{ConnectionManager, ConnectionManagerError, InboundMessage};
pub use connectivity::{ConnectivityEvent, ConnectivityRequester, PeerInfo};
pub use peer_manager::{ConnectionDirection, Peer, PeerId, PeerServices};
pub use protocol::{Command, MessageFrame};
