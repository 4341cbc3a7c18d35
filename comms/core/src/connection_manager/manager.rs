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

//! The connection manager actor. Owns every peer lifetime: inbound admission (IBD gating, ceilings, bans,
//! IP-range uniqueness), outbound dialing, handshakes, per-peer I/O task supervision, misbehavior scoring
//! and ban escalation. All other components interact with it through [`ConnectivityRequester`].

use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use log::*;
use rand::{rngs::StdRng, Rng, SeedableRng};
use sable_shutdown::ShutdownSignal;
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc, oneshot},
};

use crate::{
    clock::Clock,
    config::CommsConfig,
    connection_manager::{
        dialer,
        error::ConnectionManagerError,
        ip_range::{ip_group, is_local},
        listener,
        listener::AcceptedConnection,
        peer_connection::{spawn_peer_io, InboundMessage, InternalEvent, IoConfig, PeerConnection},
    },
    connectivity::{ConnectivityEvent, ConnectivityEventTx, ConnectivityRequest, ConnectivityRequester, PeerInfo},
    peer_manager::{BanRegistry, ConnectionDirection, Peer, PeerAddressBook, PeerId, PeerServices, PeerSource},
    protocol::{handshake, AddrMessage, Command, MessageFrame, NetAddress, TimestampedAddress, VersionMessage},
};

const LOG_TARGET: &str = "comms::connection_manager";

const EVENT_CHANNEL_DEPTH: usize = 256;
const REQUEST_CHANNEL_DEPTH: usize = 128;
const INBOUND_CHANNEL_DEPTH: usize = 1024;

/// Refusal reason used while the node is still in initial block download. The exact wording is part of the
/// observable behavior (it appears in `ConnectionFailed` events and logs).
pub const REASON_NON_WHITELISTED_DURING_IBD: &str = "Non-Whitelisted endpoint during IBD";

struct PeerEntry {
    peer: Peer,
    connection: PeerConnection,
}

enum HandshakeOutcome {
    Success {
        stream: TcpStream,
        address: SocketAddr,
        direction: ConnectionDirection,
        remote_version: VersionMessage,
    },
    Failed {
        address: SocketAddr,
        direction: ConnectionDirection,
        reason: String,
    },
}

pub struct ConnectionManager {
    config: CommsConfig,
    clock: Arc<dyn Clock>,
    book: Arc<PeerAddressBook>,
    bans: Arc<BanRegistry>,
    local_height: Arc<AtomicU64>,
    session_nonce: u64,
    request_rx: mpsc::Receiver<ConnectivityRequest>,
    internal_tx: mpsc::Sender<InternalEvent>,
    internal_rx: mpsc::Receiver<InternalEvent>,
    accept_tx: mpsc::Sender<AcceptedConnection>,
    accept_rx: mpsc::Receiver<AcceptedConnection>,
    handshake_tx: mpsc::Sender<HandshakeOutcome>,
    handshake_rx: mpsc::Receiver<HandshakeOutcome>,
    event_tx: ConnectivityEventTx,
    inbound_tx: mpsc::Sender<InboundMessage>,
    peers: HashMap<PeerId, PeerEntry>,
    pending_dials: HashMap<SocketAddr, Vec<oneshot::Sender<Result<PeerId, ConnectionManagerError>>>>,
    next_peer_id: u64,
    is_ibd: bool,
    rng: StdRng,
    shutdown: ShutdownSignal,
}

impl ConnectionManager {
    pub fn new(
        config: CommsConfig,
        clock: Arc<dyn Clock>,
        book: Arc<PeerAddressBook>,
        bans: Arc<BanRegistry>,
        local_height: Arc<AtomicU64>,
        shutdown: ShutdownSignal,
    ) -> (Self, ConnectivityRequester, mpsc::Receiver<InboundMessage>) {
        let (request_tx, request_rx) = mpsc::channel(REQUEST_CHANNEL_DEPTH);
        let (internal_tx, internal_rx) = mpsc::channel(REQUEST_CHANNEL_DEPTH);
        let (accept_tx, accept_rx) = mpsc::channel(REQUEST_CHANNEL_DEPTH);
        let (handshake_tx, handshake_rx) = mpsc::channel(REQUEST_CHANNEL_DEPTH);
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_DEPTH);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_DEPTH);

        let requester = ConnectivityRequester::new(request_tx, event_tx.clone());
        let mut rng = StdRng::from_entropy();
        let session_nonce = rng.gen();

        let manager = Self {
            config,
            clock,
            book,
            bans,
            local_height,
            session_nonce,
            request_rx,
            internal_tx,
            internal_rx,
            accept_tx,
            accept_rx,
            handshake_tx,
            handshake_rx,
            event_tx,
            inbound_tx,
            peers: HashMap::new(),
            pending_dials: HashMap::new(),
            next_peer_id: 0,
            is_ibd: true,
            rng,
            shutdown,
        };
        (manager, requester, inbound_rx)
    }

    /// Bind the configured listeners and run the actor until shutdown. A bind failure is a fatal startup
    /// error surfaced to the caller.
    pub async fn run(mut self) -> Result<(), ConnectionManagerError> {
        for address in self.config.listen_addresses.clone() {
            let listener = listener::bind(address).await?;
            tokio::spawn(listener::run_accept_loop(
                listener,
                self.accept_tx.clone(),
                self.shutdown.clone(),
            ));
        }

        let mut book_flush = tokio::time::interval(self.config.book_flush_interval);
        book_flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        book_flush.tick().await;

        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                Some(request) = self.request_rx.recv() => self.handle_request(request),
                Some(accepted) = self.accept_rx.recv() => self.handle_accepted(accepted),
                Some(outcome) = self.handshake_rx.recv() => self.handle_handshake_outcome(outcome),
                Some(event) = self.internal_rx.recv() => self.handle_internal_event(event),
                _ = book_flush.tick() => {
                    if let Err(err) = self.book.flush() {
                        warn!(target: LOG_TARGET, "Failed to flush the peer book: {}", err);
                    }
                },
            }
        }

        // Orderly teardown: stop every peer and persist the book one last time
        let ids = self.peers.keys().copied().collect::<Vec<_>>();
        for peer_id in ids {
            self.disconnect_peer(peer_id, "node shutting down".to_string());
        }
        if let Err(err) = self.book.flush() {
            warn!(target: LOG_TARGET, "Failed to flush the peer book during shutdown: {}", err);
        }
        info!(target: LOG_TARGET, "Connection manager shut down");
        Ok(())
    }

    fn handle_request(&mut self, request: ConnectivityRequest) {
        use ConnectivityRequest::*;
        match request {
            Dial(address, reply) => self.handle_dial(address, reply),
            SendMessage(peer_id, frame, reply) => {
                let result = self.send_to_peer(peer_id, frame);
                let _ = reply.send(result);
            },
            BroadcastMessage(frame) => {
                for entry in self.peers.values() {
                    let _ = entry.connection.send(frame.clone());
                }
            },
            DisconnectPeer(peer_id, reason) => self.disconnect_peer(peer_id, reason),
            BanPeer(address, duration, reason) => self.ban_and_disconnect(address, duration, reason),
            BanPeerId(peer_id, duration, reason) => {
                if let Some(entry) = self.peers.get(&peer_id) {
                    let address = entry.peer.address.ip();
                    self.ban_and_disconnect(address, duration, reason);
                }
            },
            UnbanPeer(address) => {
                self.bans.unban(&address);
            },
            ClearBans => self.bans.clear(),
            GetConnectedPeers(reply) => {
                let infos = self
                    .peers
                    .values()
                    .map(|entry| PeerInfo {
                        id: entry.peer.id,
                        address: entry.peer.address,
                        direction: entry.peer.direction,
                        claimed_height: entry.peer.claimed_height,
                        user_agent: entry.peer.user_agent.clone(),
                    })
                    .collect();
                let _ = reply.send(infos);
            },
            SetIbdState(is_ibd) => {
                if self.is_ibd != is_ibd {
                    info!(target: LOG_TARGET, "Initial block download state changed to {}", is_ibd);
                }
                self.is_ibd = is_ibd;
            },
        }
    }

    fn handle_dial(&mut self, address: SocketAddr, reply: oneshot::Sender<Result<PeerId, ConnectionManagerError>>) {
        if let Some(entry) = self.peers.values().find(|e| e.peer.address == address) {
            let _ = reply.send(Ok(entry.peer.id));
            return;
        }
        if self.bans.is_banned(&address.ip()) {
            let _ = reply.send(Err(ConnectionManagerError::Banned));
            return;
        }
        let is_privileged = self.config.add_node.contains(&address) || self.config.connect.contains(&address);
        if !is_privileged && self.outbound_count() >= self.config.max_outbound {
            let _ = reply.send(Err(ConnectionManagerError::MaxOutboundReached));
            return;
        }
        if let Some(pending) = self.pending_dials.get_mut(&address) {
            pending.push(reply);
            return;
        }
        self.pending_dials.insert(address, vec![reply]);
        self.book.mark_attempted(&address);

        let magic = self.config.network_magic;
        let max_frame = self.config.max_frame_size;
        let window = self.config.handshake_timeout;
        let version = self.build_version(address);
        let outcome_tx = self.handshake_tx.clone();
        tokio::spawn(async move {
            let outcome = match dialer::dial(address, window).await {
                Ok(mut stream) => match handshake::initiate(&mut stream, magic, max_frame, version, window).await {
                    Ok(remote_version) => HandshakeOutcome::Success {
                        stream,
                        address,
                        direction: ConnectionDirection::Outbound,
                        remote_version,
                    },
                    Err(err) => HandshakeOutcome::Failed {
                        address,
                        direction: ConnectionDirection::Outbound,
                        reason: err.to_string(),
                    },
                },
                Err(err) => HandshakeOutcome::Failed {
                    address,
                    direction: ConnectionDirection::Outbound,
                    reason: err.to_string(),
                },
            };
            let _ = outcome_tx.send(outcome).await;
        });
    }

    fn handle_accepted(&mut self, accepted: AcceptedConnection) {
        let remote = accepted.remote_address;
        let local_ip = accepted.local_address.ip();

        if self.is_ibd && !self.config.is_whitelisted(&local_ip) {
            debug!(
                target: LOG_TARGET,
                "Refusing inbound connection from {}: {}", remote, REASON_NON_WHITELISTED_DURING_IBD
            );
            self.publish(ConnectivityEvent::ConnectionFailed {
                address: remote,
                reason: REASON_NON_WHITELISTED_DURING_IBD.to_string(),
            });
            return;
        }
        if self.inbound_count() >= self.config.max_inbound {
            self.publish(ConnectivityEvent::ConnectionFailed {
                address: remote,
                reason: "inbound connection ceiling reached".to_string(),
            });
            return;
        }
        if self.bans.is_banned(&remote.ip()) && !self.config.is_whitelisted(&remote.ip()) {
            debug!(target: LOG_TARGET, "Refusing inbound connection from banned endpoint {}", remote);
            self.publish(ConnectivityEvent::ConnectionFailed {
                address: remote,
                reason: "endpoint is banned".to_string(),
            });
            return;
        }

        let magic = self.config.network_magic;
        let max_frame = self.config.max_frame_size;
        let window = self.config.handshake_timeout;
        let version = self.build_version(remote);
        let outcome_tx = self.handshake_tx.clone();
        tokio::spawn(async move {
            let mut stream = accepted.stream;
            let outcome = match handshake::respond(&mut stream, magic, max_frame, version, window).await {
                Ok(remote_version) => HandshakeOutcome::Success {
                    stream,
                    address: remote,
                    direction: ConnectionDirection::Inbound,
                    remote_version,
                },
                Err(err) => HandshakeOutcome::Failed {
                    address: remote,
                    direction: ConnectionDirection::Inbound,
                    reason: err.to_string(),
                },
            };
            let _ = outcome_tx.send(outcome).await;
        });
    }

    fn handle_handshake_outcome(&mut self, outcome: HandshakeOutcome) {
        match outcome {
            HandshakeOutcome::Failed {
                address,
                direction,
                reason,
            } => {
                debug!(target: LOG_TARGET, "{} handshake with {} failed: {}", direction, address, reason);
                self.publish(ConnectivityEvent::ConnectionFailed {
                    address,
                    reason: reason.clone(),
                });
                self.resolve_pending_dials(address, Err(ConnectionManagerError::HandshakeFailed(reason)));
            },
            HandshakeOutcome::Success {
                stream,
                address,
                direction,
                remote_version,
            } => self.admit_peer(stream, address, direction, remote_version),
        }
    }

    fn admit_peer(
        &mut self,
        stream: TcpStream,
        address: SocketAddr,
        direction: ConnectionDirection,
        remote_version: VersionMessage,
    ) {
        if remote_version.nonce == self.session_nonce {
            debug!(target: LOG_TARGET, "Dropped a connection to self via {}", address);
            self.publish(ConnectivityEvent::ConnectionFailed {
                address,
                reason: "connected to self".to_string(),
            });
            self.resolve_pending_dials(address, Err(ConnectionManagerError::ConnectedToSelf));
            return;
        }
        if let Some(existing) = self.peers.values().find(|e| e.peer.address == address) {
            let id = existing.peer.id;
            self.resolve_pending_dials(address, Ok(id));
            return;
        }
        if direction.is_inbound() && self.inbound_count() >= self.config.max_inbound {
            self.publish(ConnectivityEvent::ConnectionFailed {
                address,
                reason: "inbound connection ceiling reached".to_string(),
            });
            return;
        }
        if self.violates_ip_range_policy(&address.ip()) {
            debug!(
                target: LOG_TARGET,
                "Refusing {}: another peer from the same /16 group is connected", address
            );
            self.publish(ConnectivityEvent::ConnectionFailed {
                address,
                reason: "address group already has a connected peer".to_string(),
            });
            self.resolve_pending_dials(
                address,
                Err(ConnectionManagerError::HandshakeFailed(
                    "address group already has a connected peer".to_string(),
                )),
            );
            return;
        }

        let peer_id = PeerId(self.next_peer_id);
        self.next_peer_id += 1;
        let now = self.clock.now();
        let peer = Peer::new(
            peer_id,
            address,
            direction,
            remote_version.protocol_version,
            PeerServices::from_bits_truncate(remote_version.services),
            remote_version.user_agent.clone(),
            u64::from(remote_version.start_height),
            now,
        );

        let connection = spawn_peer_io(
            stream,
            peer_id,
            address,
            IoConfig {
                magic: self.config.network_magic,
                max_frame_size: self.config.max_frame_size,
                ping_interval: self.config.ping_interval,
                pong_timeout: self.config.pong_timeout,
            },
            self.internal_tx.clone(),
            self.inbound_tx.clone(),
        );

        info!(
            target: LOG_TARGET,
            "Connected to {} ({}, {}, height {})", peer, remote_version.user_agent, direction, peer.claimed_height
        );
        if !direction.is_inbound() {
            self.book.mark_connected(&address);
        }
        self.publish(ConnectivityEvent::PeerConnected {
            peer_id,
            address,
            direction,
            claimed_height: peer.claimed_height,
        });
        self.peers.insert(peer_id, PeerEntry { peer, connection });
        self.resolve_pending_dials(address, Ok(peer_id));
    }

    fn handle_internal_event(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::Disconnected { peer_id, reason } => self.disconnect_peer(peer_id, reason),
            InternalEvent::Misbehavior { peer_id, points, reason } => {
                let Some(entry) = self.peers.get_mut(&peer_id) else { return };
                let address = entry.peer.address;
                let crossed = entry.peer.add_misbehavior(points);
                debug!(
                    target: LOG_TARGET,
                    "{} misbehaved (+{} -> {}): {}",
                    peer_id,
                    points,
                    entry.peer.misbehavior_score(),
                    reason
                );
                if crossed {
                    self.ban_and_disconnect(address.ip(), None, format!("misbehavior threshold reached: {}", reason));
                }
            },
            InternalEvent::AddrReceived { peer_id, message } => {
                let added = self.book.add_addresses(&message.addresses, PeerSource::Gossip);
                trace!(
                    target: LOG_TARGET,
                    "{} gossiped {} address(es) ({} new)",
                    peer_id,
                    message.addresses.len(),
                    added
                );
                if let Some(entry) = self.peers.get_mut(&peer_id) {
                    entry.peer.last_seen = self.clock.now();
                }
            },
            InternalEvent::GetAddrReceived { peer_id } => {
                let mut sample = self
                    .book
                    .sample_for_gossip(crate::protocol::MAX_ADDR_PER_MESSAGE - 1, &mut self.rng);
                if let Some(external) = self.config.external_address {
                    sample.push(TimestampedAddress {
                        last_seen: self.clock.now().min(u64::from(u32::MAX)) as u32,
                        address: NetAddress::new(self.config.services, external),
                    });
                }
                let frame = MessageFrame::new(Command::Addr, AddrMessage { addresses: sample }.to_payload());
                let _ = self.send_to_peer(peer_id, frame);
            },
            InternalEvent::PongReceived { peer_id } => {
                if let Some(entry) = self.peers.get_mut(&peer_id) {
                    entry.peer.last_seen = self.clock.now();
                    self.book.mark_seen(&entry.peer.address);
                }
            },
        }
    }

    fn send_to_peer(&mut self, peer_id: PeerId, frame: MessageFrame) -> Result<(), ConnectionManagerError> {
        let entry = self
            .peers
            .get(&peer_id)
            .ok_or(ConnectionManagerError::PeerNotFound(peer_id))?;
        match entry.connection.send(frame) {
            Ok(()) => Ok(()),
            Err(err @ ConnectionManagerError::SendQueueFull) => {
                // The peer cannot drain its queue; drop it rather than buffering without bound
                self.disconnect_peer(peer_id, "send queue overflow".to_string());
                Err(err)
            },
            Err(err) => Err(err),
        }
    }

    fn disconnect_peer(&mut self, peer_id: PeerId, reason: String) {
        if let Some(mut entry) = self.peers.remove(&peer_id) {
            entry.connection.disconnect();
            debug!(target: LOG_TARGET, "Disconnected {}: {}", entry.peer, reason);
            self.publish(ConnectivityEvent::PeerDisconnected {
                peer_id,
                address: entry.peer.address,
                reason,
            });
        }
    }

    fn ban_and_disconnect(&mut self, address: IpAddr, duration: Option<Duration>, reason: String) {
        let duration = duration.unwrap_or(self.config.default_ban_duration);
        let entry = self.bans.ban(address, duration, reason.clone());
        self.publish(ConnectivityEvent::PeerBanned {
            address,
            reason: reason.clone(),
            until: entry.until,
        });
        let to_drop = self
            .peers
            .values()
            .filter(|e| e.peer.address.ip() == address)
            .map(|e| e.peer.id)
            .collect::<Vec<_>>();
        for peer_id in to_drop {
            self.disconnect_peer(peer_id, format!("banned: {}", reason));
        }
    }

    fn violates_ip_range_policy(&self, ip: &IpAddr) -> bool {
        if !self.config.ip_range_filtering || self.is_ip_range_exempt(ip) {
            return false;
        }
        let group = ip_group(ip);
        self.peers.values().any(|e| ip_group(&e.peer.address.ip()) == group)
    }

    fn is_ip_range_exempt(&self, ip: &IpAddr) -> bool {
        is_local(ip) ||
            self.config.is_whitelisted(ip) ||
            self.config.add_node.iter().any(|a| a.ip() == *ip) ||
            self.config.connect.iter().any(|a| a.ip() == *ip) ||
            self.config.ip_range_exclusions.iter().any(|range| range.contains(ip))
    }

    fn resolve_pending_dials(&mut self, address: SocketAddr, result: Result<PeerId, ConnectionManagerError>) {
        let Some(pending) = self.pending_dials.remove(&address) else {
            return;
        };
        for reply in pending {
            let per_reply = match &result {
                Ok(id) => Ok(*id),
                Err(ConnectionManagerError::ConnectedToSelf) => Err(ConnectionManagerError::ConnectedToSelf),
                Err(ConnectionManagerError::Banned) => Err(ConnectionManagerError::Banned),
                Err(err) => Err(ConnectionManagerError::HandshakeFailed(err.to_string())),
            };
            let _ = reply.send(per_reply);
        }
    }

    fn build_version(&self, remote: SocketAddr) -> VersionMessage {
        let unspecified: SocketAddr = "0.0.0.0:0".parse().expect("valid constant address");
        VersionMessage {
            protocol_version: self.config.protocol_version,
            services: self.config.services,
            timestamp: self.clock.now() as i64,
            receiver: NetAddress::new(0, remote),
            sender: NetAddress::new(self.config.services, self.config.external_address.unwrap_or(unspecified)),
            nonce: self.session_nonce,
            user_agent: self.config.user_agent.clone(),
            start_height: self.local_height.load(Ordering::SeqCst).min(u64::from(u32::MAX)) as u32,
        }
    }

    fn publish(&self, event: ConnectivityEvent) {
        let _ = self.event_tx.send(event);
    }

    fn inbound_count(&self) -> usize {
        self.peers.values().filter(|e| e.peer.direction.is_inbound()).count()
    }

    fn outbound_count(&self) -> usize {
        self.peers.values().filter(|e| !e.peer.direction.is_inbound()).count()
    }
}
