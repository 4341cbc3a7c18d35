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

//! Per-peer I/O. Each connected peer gets one reader task that owns the read half and one writer task that
//! owns the write half; outbound frames are serialized through the writer's channel. The writer also runs the
//! ping keepalive and tears the connection down when a pong deadline lapses.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use bytes::Bytes;
use log::*;
use sable_shutdown::{Shutdown, ShutdownSignal};
use tokio::{
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::mpsc,
};

use crate::{
    connection_manager::ConnectionManagerError,
    peer_manager::PeerId,
    protocol::{read_frame, write_frame, AddrMessage, Command, MessageFrame, PingPongMessage},
};

const LOG_TARGET: &str = "comms::connection_manager::peer_connection";

const SEND_QUEUE_DEPTH: usize = 1024;
const MISBEHAVIOR_MALFORMED_FRAME: u32 = 10;
const MISBEHAVIOR_UNSOLICITED_HANDSHAKE: u32 = 10;

/// A message surfaced to the domain layer (block/header/tx plane). Control-plane traffic never reaches here.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub peer_id: PeerId,
    pub command: Command,
    pub payload: Bytes,
}

/// Events the I/O tasks report back to the connection manager actor.
#[derive(Debug)]
pub(crate) enum InternalEvent {
    Disconnected { peer_id: PeerId, reason: String },
    Misbehavior { peer_id: PeerId, points: u32, reason: String },
    AddrReceived { peer_id: PeerId, message: AddrMessage },
    GetAddrReceived { peer_id: PeerId },
    PongReceived { peer_id: PeerId },
}

/// The sending half of a peer connection, held by the manager.
#[derive(Debug)]
pub(crate) struct PeerConnection {
    pub peer_id: PeerId,
    pub address: SocketAddr,
    msg_tx: mpsc::Sender<MessageFrame>,
    shutdown: Shutdown,
}

impl PeerConnection {
    /// Queue a frame for the writer task. Fails when the peer is gone or cannot drain its queue.
    pub fn send(&self, frame: MessageFrame) -> Result<(), ConnectionManagerError> {
        self.msg_tx.try_send(frame).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => ConnectionManagerError::SendQueueFull,
            mpsc::error::TrySendError::Closed(_) => ConnectionManagerError::PeerNotFound(self.peer_id),
        })
    }

    pub fn disconnect(&mut self) {
        self.shutdown.trigger();
    }
}

pub(crate) struct IoConfig {
    pub magic: [u8; 4],
    pub max_frame_size: usize,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
}

/// Split the stream and start the reader and writer tasks for an admitted peer.
pub(crate) fn spawn_peer_io(
    stream: TcpStream,
    peer_id: PeerId,
    address: SocketAddr,
    config: IoConfig,
    internal_tx: mpsc::Sender<InternalEvent>,
    inbound_tx: mpsc::Sender<InboundMessage>,
) -> PeerConnection {
    let (msg_tx, msg_rx) = mpsc::channel(SEND_QUEUE_DEPTH);
    let shutdown = Shutdown::new();
    let last_pong = Arc::new(Mutex::new(Instant::now()));

    let (read_half, write_half) = stream.into_split();

    tokio::spawn(run_reader(ReaderContext {
        read_half,
        peer_id,
        magic: config.magic,
        max_frame_size: config.max_frame_size,
        internal_tx: internal_tx.clone(),
        inbound_tx,
        pong_reply_tx: msg_tx.clone(),
        last_pong: last_pong.clone(),
        shutdown: shutdown.to_signal(),
    }));

    tokio::spawn(run_writer(WriterContext {
        write_half,
        peer_id,
        magic: config.magic,
        msg_rx,
        internal_tx,
        ping_interval: config.ping_interval,
        pong_timeout: config.pong_timeout,
        last_pong,
        shutdown: shutdown.to_signal(),
    }));

    PeerConnection {
        peer_id,
        address,
        msg_tx,
        shutdown,
    }
}

struct ReaderContext {
    read_half: OwnedReadHalf,
    peer_id: PeerId,
    magic: [u8; 4],
    max_frame_size: usize,
    internal_tx: mpsc::Sender<InternalEvent>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    pong_reply_tx: mpsc::Sender<MessageFrame>,
    last_pong: Arc<Mutex<Instant>>,
    shutdown: ShutdownSignal,
}

async fn run_reader(mut ctx: ReaderContext) {
    let peer_id = ctx.peer_id;
    loop {
        let raw = tokio::select! {
            biased;
            _ = ctx.shutdown.wait() => break,
            result = read_frame(&mut ctx.read_half, ctx.magic, ctx.max_frame_size) => match result {
                Ok(raw) => raw,
                Err(err) => {
                    handle_read_error(&ctx, err).await;
                    break;
                },
            },
        };

        let command = match raw.command() {
            Ok(command) => command,
            Err(_) => {
                debug!(target: LOG_TARGET, "{} sent unknown command '{}'; ignoring", peer_id, raw.command_label());
                continue;
            },
        };

        match command {
            Command::Ping => match PingPongMessage::from_payload(raw.payload) {
                Ok(ping) => {
                    let pong = MessageFrame::new(Command::Pong, PingPongMessage { nonce: ping.nonce }.to_payload());
                    let _ = ctx.pong_reply_tx.try_send(pong);
                },
                Err(_) => report_misbehavior(&ctx.internal_tx, peer_id, "malformed ping").await,
            },
            Command::Pong => {
                *ctx.last_pong.lock().expect("last_pong lock poisoned") = Instant::now();
                let _ = ctx.internal_tx.send(InternalEvent::PongReceived { peer_id }).await;
            },
            Command::Addr => match AddrMessage::from_payload(raw.payload) {
                Ok(message) => {
                    let _ = ctx
                        .internal_tx
                        .send(InternalEvent::AddrReceived { peer_id, message })
                        .await;
                },
                Err(_) => report_misbehavior(&ctx.internal_tx, peer_id, "malformed addr").await,
            },
            Command::GetAddr => {
                let _ = ctx.internal_tx.send(InternalEvent::GetAddrReceived { peer_id }).await;
            },
            Command::Version | Command::Verack => {
                let _ = ctx
                    .internal_tx
                    .send(InternalEvent::Misbehavior {
                        peer_id,
                        points: MISBEHAVIOR_UNSOLICITED_HANDSHAKE,
                        reason: format!("unsolicited '{}' after handshake", command),
                    })
                    .await;
            },
            command => {
                // Data plane: hand off to the domain layer
                if ctx
                    .inbound_tx
                    .send(InboundMessage {
                        peer_id,
                        command,
                        payload: raw.payload,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            },
        }
    }
    trace!(target: LOG_TARGET, "Reader for {} exited", peer_id);
}

async fn handle_read_error(ctx: &ReaderContext, err: crate::protocol::ProtocolError) {
    use crate::protocol::ProtocolError::*;
    let peer_id = ctx.peer_id;
    match &err {
        BadChecksum { .. } | PayloadTooLarge { .. } | MalformedPayload(_) | BadMagic { .. } => {
            // Framing integrity is gone (or the peer is garbling messages); score it and drop the connection
            let _ = ctx
                .internal_tx
                .send(InternalEvent::Misbehavior {
                    peer_id,
                    points: MISBEHAVIOR_MALFORMED_FRAME,
                    reason: err.to_string(),
                })
                .await;
            let _ = ctx
                .internal_tx
                .send(InternalEvent::Disconnected {
                    peer_id,
                    reason: err.to_string(),
                })
                .await;
        },
        _ => {
            let _ = ctx
                .internal_tx
                .send(InternalEvent::Disconnected {
                    peer_id,
                    reason: err.to_string(),
                })
                .await;
        },
    }
}

async fn report_misbehavior(internal_tx: &mpsc::Sender<InternalEvent>, peer_id: PeerId, reason: &str) {
    let _ = internal_tx
        .send(InternalEvent::Misbehavior {
            peer_id,
            points: MISBEHAVIOR_MALFORMED_FRAME,
            reason: reason.to_string(),
        })
        .await;
}

struct WriterContext {
    write_half: OwnedWriteHalf,
    peer_id: PeerId,
    magic: [u8; 4],
    msg_rx: mpsc::Receiver<MessageFrame>,
    internal_tx: mpsc::Sender<InternalEvent>,
    ping_interval: Duration,
    pong_timeout: Duration,
    last_pong: Arc<Mutex<Instant>>,
    shutdown: ShutdownSignal,
}

async fn run_writer(mut ctx: WriterContext) {
    let peer_id = ctx.peer_id;
    let mut ping_timer = tokio::time::interval(ctx.ping_interval);
    ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately
    ping_timer.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = ctx.shutdown.wait() => break,
            maybe_frame = ctx.msg_rx.recv() => match maybe_frame {
                Some(frame) => {
                    if let Err(err) = write_frame(&mut ctx.write_half, ctx.magic, &frame).await {
                        let _ = ctx.internal_tx.send(InternalEvent::Disconnected {
                            peer_id,
                            reason: format!("write failed: {}", err),
                        }).await;
                        break;
                    }
                },
                None => break,
            },
            _ = ping_timer.tick() => {
                let idle = ctx.last_pong.lock().expect("last_pong lock poisoned").elapsed();
                if idle > ctx.pong_timeout {
                    let _ = ctx.internal_tx.send(InternalEvent::Disconnected {
                        peer_id,
                        reason: format!("no pong for {:.0?}", idle),
                    }).await;
                    break;
                }
                let ping = MessageFrame::new(Command::Ping, PingPongMessage { nonce: rand::random() }.to_payload());
                if let Err(err) = write_frame(&mut ctx.write_half, ctx.magic, &ping).await {
                    let _ = ctx.internal_tx.send(InternalEvent::Disconnected {
                        peer_id,
                        reason: format!("write failed: {}", err),
                    }).await;
                    break;
                }
            },
        }
    }
    trace!(target: LOG_TARGET, "Writer for {} exited", peer_id);
}
