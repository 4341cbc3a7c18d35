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

use std::{fmt, net::SocketAddr};

use bitflags::bitflags;

/// Accumulated misbehavior at or above this score triggers a ban.
pub const MISBEHAVIOR_BAN_THRESHOLD: u32 = 100;

/// A small integer identity for a connected peer. Ids are allocated by the connection manager and never
/// reused within a process lifetime; every other component refers to peers by id only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionDirection {
    Inbound,
    Outbound,
}

impl ConnectionDirection {
    pub fn is_inbound(&self) -> bool {
        matches!(self, ConnectionDirection::Inbound)
    }
}

impl fmt::Display for ConnectionDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionDirection::Inbound => f.write_str("inbound"),
            ConnectionDirection::Outbound => f.write_str("outbound"),
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PeerServices: u64 {
        const NETWORK = 1;
    }
}

/// Runtime state for one connected peer. The connection manager owns these records; the download scheduler
/// and the coordinator only ever see the id.
#[derive(Debug, Clone)]
pub struct Peer {
    pub id: PeerId,
    pub address: SocketAddr,
    pub direction: ConnectionDirection,
    pub protocol_version: u32,
    pub services: PeerServices,
    pub user_agent: String,
    /// Chain height the peer claimed during the handshake or in later announcements.
    pub claimed_height: u64,
    /// Hash of the peer's claimed tip once a header announcement revealed it.
    pub claimed_tip: Option<[u8; 32]>,
    pub connected_at: u64,
    pub last_seen: u64,
    misbehavior_score: u32,
}

impl Peer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: PeerId,
        address: SocketAddr,
        direction: ConnectionDirection,
        protocol_version: u32,
        services: PeerServices,
        user_agent: String,
        claimed_height: u64,
        now: u64,
    ) -> Self {
        Self {
            id,
            address,
            direction,
            protocol_version,
            services,
            user_agent,
            claimed_height,
            claimed_tip: None,
            connected_at: now,
            last_seen: now,
            misbehavior_score: 0,
        }
    }

    /// Add misbehavior points. Returns true when the accumulated score crosses the ban threshold.
    pub fn add_misbehavior(&mut self, points: u32) -> bool {
        let before = self.misbehavior_score;
        self.misbehavior_score = self.misbehavior_score.saturating_add(points);
        before < MISBEHAVIOR_BAN_THRESHOLD && self.misbehavior_score >= MISBEHAVIOR_BAN_THRESHOLD
    }

    pub fn misbehavior_score(&self) -> u32 {
        self.misbehavior_score
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {})", self.id, self.address, self.direction)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn misbehavior_crosses_the_threshold_exactly_once() {
        let mut peer = Peer::new(
            PeerId(1),
            "127.0.0.1:1".parse().unwrap(),
            ConnectionDirection::Inbound,
            70012,
            PeerServices::NETWORK,
            String::new(),
            0,
            0,
        );
        assert!(!peer.add_misbehavior(50));
        assert!(peer.add_misbehavior(50));
        // Already over the threshold; does not re-trigger
        assert!(!peer.add_misbehavior(50));
    }
}
