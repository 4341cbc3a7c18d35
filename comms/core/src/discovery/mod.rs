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

//! Peer discovery. Three outbound connectors run concurrently: the add-node connector keeps standing
//! connections to operator-supplied endpoints, the connect-node connector (when a `connect` list is set)
//! restricts the node to exactly that list and disables discovery, and the discovery connector fills the
//! remaining outbound budget from the address book. Two gossip loops keep the book warm: an hourly DNS/seed
//! bootstrap used only when the book has gone cold, and a 10-second peer-to-peer sweep of short-lived
//! collect-and-disconnect connections. Both loops idle once the book reaches its target size.

use std::{
    collections::HashSet,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
        Mutex,
    },
};

use futures::{stream, StreamExt};
use log::*;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use sable_shutdown::ShutdownSignal;
use tokio::net::TcpStream;

use crate::{
    clock::Clock,
    config::{CommsConfig, DiscoveryConfig},
    connection_manager::ip_range::ip_group,
    connectivity::ConnectivityRequester,
    peer_manager::{BanRegistry, ConnectionDirection, PeerAddressBook, PeerSource},
    protocol::{handshake, read_frame, write_frame, AddrMessage, Command, MessageFrame, NetAddress, VersionMessage},
};

const LOG_TARGET: &str = "comms::discovery";

/// How many throwaway collection connections run at once during a gossip sweep.
const COLLECT_CONCURRENCY: usize = 8;
/// Reconnect cadence for the add-node and connect-node connectors.
const STATIC_CONNECTOR_INTERVAL_SECS: u64 = 30;

struct Inner {
    comms_config: CommsConfig,
    config: DiscoveryConfig,
    requester: ConnectivityRequester,
    book: Arc<PeerAddressBook>,
    bans: Arc<BanRegistry>,
    clock: Arc<dyn Clock>,
    local_height: Arc<AtomicU64>,
    rng: Mutex<StdRng>,
    shutdown: ShutdownSignal,
}

pub struct PeerDiscovery {
    inner: Arc<Inner>,
}

impl PeerDiscovery {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        comms_config: CommsConfig,
        config: DiscoveryConfig,
        requester: ConnectivityRequester,
        book: Arc<PeerAddressBook>,
        bans: Arc<BanRegistry>,
        clock: Arc<dyn Clock>,
        local_height: Arc<AtomicU64>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                comms_config,
                config,
                requester,
                book,
                bans,
                clock,
                local_height,
                rng: Mutex::new(StdRng::from_entropy()),
                shutdown,
            }),
        }
    }

    pub fn spawn(self) {
        let inner = self.inner;
        if !inner.comms_config.add_node.is_empty() {
            let list = inner.comms_config.add_node.clone();
            tokio::spawn(run_static_connector(inner.clone(), list, "add-node"));
        }
        if !inner.comms_config.connect.is_empty() {
            // An explicit connect list pins the outbound set and disables all discovery
            info!(
                target: LOG_TARGET,
                "Outbound restricted to {} configured endpoint(s); discovery disabled",
                inner.comms_config.connect.len()
            );
            let list = inner.comms_config.connect.clone();
            tokio::spawn(run_static_connector(inner.clone(), list, "connect-node"));
            return;
        }
        tokio::spawn(run_discovery_connector(inner.clone()));
        tokio::spawn(run_dns_seed_loop(inner.clone()));
        tokio::spawn(run_p2p_loop(inner));
    }
}

/// Keep a standing outbound connection to every endpoint in `list`.
async fn run_static_connector(inner: Arc<Inner>, list: Vec<SocketAddr>, label: &'static str) {
    let mut shutdown = inner.shutdown.clone();
    let mut tick = tokio::time::interval(std::time::Duration::from_secs(STATIC_CONNECTOR_INTERVAL_SECS));
    loop {
        tokio::select! {
            biased;
            _ = shutdown.wait() => break,
            _ = tick.tick() => {},
        }
        let connected = match inner.requester.get_connected_peers().await {
            Ok(peers) => peers.into_iter().map(|p| p.address).collect::<HashSet<_>>(),
            Err(_) => break,
        };
        for address in list.iter().filter(|a| !connected.contains(a)) {
            match inner.requester.dial_peer(*address).await {
                Ok(peer_id) => debug!(target: LOG_TARGET, "{} connector connected {} as {}", label, address, peer_id),
                Err(err) => debug!(target: LOG_TARGET, "{} connector failed to reach {}: {}", label, address, err),
            }
        }
    }
}

/// Fill the outbound budget from the address book, biased toward fresh, rarely-attempted entries.
async fn run_discovery_connector(inner: Arc<Inner>) {
    let mut shutdown = inner.shutdown.clone();
    let mut tick = tokio::time::interval(inner.config.dial_interval);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.wait() => break,
            _ = tick.tick() => {},
        }
        let peers = match inner.requester.get_connected_peers().await {
            Ok(peers) => peers,
            Err(_) => break,
        };
        let outbound = peers
            .iter()
            .filter(|p| p.direction == ConnectionDirection::Outbound)
            .count();
        if outbound >= inner.comms_config.max_outbound {
            continue;
        }

        let mut exclude = peers.iter().map(|p| p.address).collect::<HashSet<_>>();
        exclude.extend(inner.comms_config.add_node.iter().copied());
        exclude.extend(inner.comms_config.connect.iter().copied());

        let connected_groups = peers.iter().map(|p| ip_group(&p.address.ip())).collect::<HashSet<_>>();

        let candidates = {
            let mut rng = inner.rng.lock().expect("discovery rng lock poisoned");
            inner.book.select_candidates(8, &exclude, &mut *rng)
        };
        let candidate = candidates.into_iter().find(|addr| {
            if inner.bans.is_banned(&addr.ip()) {
                return false;
            }
            if inner.comms_config.ip_range_filtering && connected_groups.contains(&ip_group(&addr.ip())) {
                return false;
            }
            true
        });
        let Some(address) = candidate else { continue };
        if let Err(err) = inner.requester.dial_peer(address).await {
            debug!(target: LOG_TARGET, "Discovery dial to {} failed: {}", address, err);
        }
    }
}

/// Hourly bootstrap from DNS seeds and fixed seed nodes, used only while the book is cold (everything
/// attempted, nothing ever connected).
async fn run_dns_seed_loop(inner: Arc<Inner>) {
    let mut shutdown = inner.shutdown.clone();
    let mut tick = tokio::time::interval(inner.config.dns_loop_interval);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.wait() => break,
            _ = tick.tick() => {},
        }
        if inner.book.len() >= inner.config.peer_book_target {
            continue;
        }
        if !inner.book.needs_seeding() {
            continue;
        }

        let mut endpoints = Vec::new();
        for seed in &inner.config.dns_seeds {
            match tokio::net::lookup_host(seed.as_str()).await {
                Ok(resolved) => endpoints.extend(resolved),
                Err(err) => debug!(target: LOG_TARGET, "DNS seed '{}' failed to resolve: {}", seed, err),
            }
        }
        endpoints.extend(inner.config.seed_nodes.iter().copied());
        {
            let mut rng = inner.rng.lock().expect("discovery rng lock poisoned");
            endpoints.shuffle(&mut *rng);
        }
        info!(
            target: LOG_TARGET,
            "Seeding the peer book from {} bootstrap endpoint(s)",
            endpoints.len()
        );
        collect_from_many(&inner, endpoints, PeerSource::DnsSeed).await;
    }
}

/// The 10-second gossip sweep: short-lived connections to known peers, collecting their `addr` gossip.
async fn run_p2p_loop(inner: Arc<Inner>) {
    let mut shutdown = inner.shutdown.clone();
    let mut tick = tokio::time::interval(inner.config.p2p_loop_interval);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.wait() => break,
            _ = tick.tick() => {},
        }
        if inner.book.len() >= inner.config.peer_book_target {
            continue;
        }
        let batch = {
            let mut rng = inner.rng.lock().expect("discovery rng lock poisoned");
            inner.book.select_random(inner.config.p2p_batch_size, &mut *rng)
        };
        collect_from_many(&inner, batch, PeerSource::Gossip).await;
    }
}

async fn collect_from_many(inner: &Arc<Inner>, endpoints: Vec<SocketAddr>, source: PeerSource) {
    let shutdown = inner.shutdown.clone();
    stream::iter(endpoints)
        .for_each_concurrent(COLLECT_CONCURRENCY, |endpoint| {
            let inner = inner.clone();
            let mut shutdown = shutdown.clone();
            async move {
                if shutdown.is_triggered() || inner.book.len() >= inner.config.peer_book_target {
                    return;
                }
                tokio::select! {
                    biased;
                    _ = shutdown.wait() => {},
                    _ = collect_addresses(&inner, endpoint, source) => {},
                }
            }
        })
        .await;
}

/// Open a throwaway connection solely to gather peer announcements, then disconnect. The whole exchange is
/// bounded by the collect timeout.
async fn collect_addresses(inner: &Arc<Inner>, endpoint: SocketAddr, source: PeerSource) {
    inner.book.mark_attempted(&endpoint);
    let result = tokio::time::timeout(inner.config.collect_timeout, async {
        let mut stream = TcpStream::connect(endpoint).await?;
        let magic = inner.comms_config.network_magic;
        let max_frame = inner.comms_config.max_frame_size;
        let version = build_collect_version(inner, endpoint);
        handshake::initiate(&mut stream, magic, max_frame, version, inner.config.collect_timeout).await?;
        inner.book.mark_connected(&endpoint);

        write_frame(&mut stream, magic, &MessageFrame::empty(Command::GetAddr)).await?;
        loop {
            let raw = read_frame(&mut stream, magic, max_frame).await?;
            match raw.command() {
                Ok(Command::Addr) => {
                    let message = AddrMessage::from_payload(raw.payload)?;
                    let added = inner.book.add_addresses(&message.addresses, source);
                    debug!(
                        target: LOG_TARGET,
                        "Collected {} address(es) from {} ({} new)",
                        message.addresses.len(),
                        endpoint,
                        added
                    );
                    return Ok::<_, crate::protocol::ProtocolError>(());
                },
                // Any other traffic (ping, inv gossip) is ignored on a collection connection
                _ => continue,
            }
        }
    })
    .await;

    match result {
        Ok(Ok(())) => {},
        Ok(Err(err)) => trace!(target: LOG_TARGET, "Address collection from {} failed: {}", endpoint, err),
        Err(_) => trace!(target: LOG_TARGET, "Address collection from {} timed out", endpoint),
    }
}

fn build_collect_version(inner: &Arc<Inner>, remote: SocketAddr) -> VersionMessage {
    let unspecified: SocketAddr = "0.0.0.0:0".parse().expect("valid constant address");
    VersionMessage {
        protocol_version: inner.comms_config.protocol_version,
        services: inner.comms_config.services,
        timestamp: inner.clock.now() as i64,
        receiver: NetAddress::new(0, remote),
        sender: NetAddress::new(
            inner.comms_config.services,
            inner.comms_config.external_address.unwrap_or(unspecified),
        ),
        nonce: rand::random(),
        user_agent: inner.comms_config.user_agent.clone(),
        start_height: inner.local_height.load(Ordering::SeqCst).min(u64::from(u32::MAX)) as u32,
    }
}
