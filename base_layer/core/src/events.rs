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

//! The process-internal event bus. Subscriptions are keyed by event kind, so publishing costs only the
//! subscribers of that kind. Subscribers run on the publisher's task and must hand long work to their own
//! tasks.

use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::{Arc, RwLock},
};

use tokio::sync::broadcast;

use crate::blocks::ChainBlock;

const EVENT_CHANNEL_DEPTH: usize = 256;

#[derive(Debug, Clone)]
pub enum NodeEvent {
    BlockConnected(Arc<ChainBlock>),
    BlockDisconnected(Arc<ChainBlock>),
    PeerConnected {
        address: SocketAddr,
        inbound: bool,
    },
    PeerDisconnected {
        address: SocketAddr,
        reason: String,
    },
    PeerBanned {
        address: IpAddr,
        reason: String,
        until: u64,
    },
    PeerConnectionAttemptFailed {
        address: SocketAddr,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeEventKind {
    BlockConnected,
    BlockDisconnected,
    PeerConnected,
    PeerDisconnected,
    PeerBanned,
    PeerConnectionAttemptFailed,
}

impl NodeEvent {
    pub fn kind(&self) -> NodeEventKind {
        match self {
            NodeEvent::BlockConnected(_) => NodeEventKind::BlockConnected,
            NodeEvent::BlockDisconnected(_) => NodeEventKind::BlockDisconnected,
            NodeEvent::PeerConnected { .. } => NodeEventKind::PeerConnected,
            NodeEvent::PeerDisconnected { .. } => NodeEventKind::PeerDisconnected,
            NodeEvent::PeerBanned { .. } => NodeEventKind::PeerBanned,
            NodeEvent::PeerConnectionAttemptFailed { .. } => NodeEventKind::PeerConnectionAttemptFailed,
        }
    }
}

#[derive(Clone, Default)]
pub struct EventBus {
    channels: Arc<RwLock<HashMap<NodeEventKind, broadcast::Sender<NodeEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn subscribe(&self, kind: NodeEventKind) -> broadcast::Receiver<NodeEvent> {
        let mut channels = self.channels.write().expect("event bus lock poisoned");
        channels
            .entry(kind)
            .or_insert_with(|| broadcast::channel(EVENT_CHANNEL_DEPTH).0)
            .subscribe()
    }

    /// Publish to the subscribers of this event's kind. Slow subscribers lag and drop events rather than
    /// blocking the publisher.
    pub fn publish(&self, event: NodeEvent) {
        let channels = self.channels.read().expect("event bus lock poisoned");
        if let Some(sender) = channels.get(&event.kind()) {
            let _ = sender.send(event);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{blocks::ChainHeader, consensus};

    fn sample_block_event() -> NodeEvent {
        let genesis = consensus::genesis_block().clone();
        let header = ChainHeader::genesis(genesis.header);
        NodeEvent::BlockConnected(Arc::new(ChainBlock::new(header, Arc::new(genesis))))
    }

    #[tokio::test]
    async fn subscribers_only_see_their_kind() {
        let bus = EventBus::new();
        let mut blocks = bus.subscribe(NodeEventKind::BlockConnected);
        let mut bans = bus.subscribe(NodeEventKind::PeerBanned);

        bus.publish(sample_block_event());
        let received = blocks.recv().await.unwrap();
        assert!(matches!(received, NodeEvent::BlockConnected(_)));
        assert!(bans.try_recv().is_err());
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_a_noop() {
        let bus = EventBus::new();
        bus.publish(sample_block_event());
    }
}
