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

use std::{net::SocketAddr, time::Duration};

use cidr::AnyIpCidr;

#[derive(Debug, Clone)]
pub struct CommsConfig {
    /// The 4-byte network magic prefixed to every frame.
    pub network_magic: [u8; 4],
    /// Local endpoints to accept inbound connections on. Empty disables the listener.
    pub listen_addresses: Vec<SocketAddr>,
    /// The endpoint advertised to peers in `version`/`addr` messages, if any.
    pub external_address: Option<SocketAddr>,
    /// Protocol version advertised during the handshake.
    pub protocol_version: u32,
    /// Service bits advertised during the handshake.
    pub services: u64,
    pub user_agent: String,
    /// Inbound connection ceiling.
    pub max_inbound: usize,
    /// Outbound connection ceiling shared by the discovery connector.
    pub max_outbound: usize,
    /// Endpoints/ranges exempt from IP-range filtering and the inbound-IBD rejection.
    pub whitelist: Vec<AnyIpCidr>,
    /// Endpoints an operator wants a standing outbound connection to, in addition to discovery.
    pub add_node: Vec<SocketAddr>,
    /// When non-empty, outbound connections are made to exactly these endpoints and discovery is disabled.
    pub connect: Vec<SocketAddr>,
    /// Enforce at most one connected peer per /16-equivalent address group.
    pub ip_range_filtering: bool,
    /// Ranges exempt from the /16 uniqueness rule.
    pub ip_range_exclusions: Vec<AnyIpCidr>,
    /// Ban duration applied when no explicit duration is given.
    pub default_ban_duration: Duration,
    pub handshake_timeout: Duration,
    pub ping_interval: Duration,
    /// A peer that has not answered a ping within this window is disconnected.
    pub pong_timeout: Duration,
    /// Frames with a larger payload are a protocol violation.
    pub max_frame_size: usize,
    /// How often the peer address book is flushed to disk.
    pub book_flush_interval: Duration,
}

impl Default for CommsConfig {
    fn default() -> Self {
        Self {
            network_magic: *b"SBLE",
            listen_addresses: vec!["0.0.0.0:38333".parse().expect("valid constant address")],
            external_address: None,
            protocol_version: 70012,
            services: 1,
            user_agent: format!("/sable:{}/", env!("CARGO_PKG_VERSION")),
            max_inbound: 117,
            max_outbound: 16,
            whitelist: Vec::new(),
            add_node: Vec::new(),
            connect: Vec::new(),
            ip_range_filtering: true,
            ip_range_exclusions: Vec::new(),
            default_ban_duration: Duration::from_secs(16 * 60 * 60),
            handshake_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(120),
            pong_timeout: Duration::from_secs(300),
            max_frame_size: 8 * 1024 * 1024,
            book_flush_interval: Duration::from_secs(5 * 60),
        }
    }
}

impl CommsConfig {
    pub fn is_whitelisted(&self, addr: &std::net::IpAddr) -> bool {
        self.whitelist.iter().any(|range| range.contains(addr))
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// DNS names resolved for bootstrap peers when the address book has gone cold.
    pub dns_seeds: Vec<String>,
    /// Fixed bootstrap endpoints used alongside the DNS seeds.
    pub seed_nodes: Vec<SocketAddr>,
    /// Discovery loops stop contributing once the book holds this many entries.
    pub peer_book_target: usize,
    pub dns_loop_interval: Duration,
    pub p2p_loop_interval: Duration,
    /// Lifetime ceiling of a throwaway address-collection connection.
    pub collect_timeout: Duration,
    /// Upper bound on candidates considered per p2p loop pass.
    pub p2p_batch_size: usize,
    /// Delay between discovery-connector dial attempts.
    pub dial_interval: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            dns_seeds: Vec::new(),
            seed_nodes: Vec::new(),
            peer_book_target: 2000,
            dns_loop_interval: Duration::from_secs(60 * 60),
            p2p_loop_interval: Duration::from_secs(10),
            collect_timeout: Duration::from_secs(5),
            p2p_batch_size: 1000,
            dial_interval: Duration::from_secs(2),
        }
    }
}
