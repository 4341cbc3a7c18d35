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

//! The single authoritative chain tip, set by the coordinator once blocks validate, and the IBD flag.
//! Every follower (the puller, the indexer, the connection manager's inbound gate) watches this state.

use std::sync::Arc;

use tokio::sync::watch;

use crate::blocks::ChainHeader;

#[derive(Debug, Clone)]
pub struct TipSnapshot {
    pub tip: Arc<ChainHeader>,
    pub is_ibd: bool,
}

#[derive(Debug, Clone)]
pub struct ChainTipState {
    tx: Arc<watch::Sender<TipSnapshot>>,
}

impl ChainTipState {
    pub fn new(genesis: Arc<ChainHeader>) -> Self {
        let (tx, _) = watch::channel(TipSnapshot {
            tip: genesis,
            is_ibd: true,
        });
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> watch::Receiver<TipSnapshot> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> TipSnapshot {
        self.tx.borrow().clone()
    }

    pub fn tip(&self) -> Arc<ChainHeader> {
        self.tx.borrow().tip.clone()
    }

    pub fn is_ibd(&self) -> bool {
        self.tx.borrow().is_ibd
    }

    pub fn set_tip(&self, tip: Arc<ChainHeader>) {
        self.tx.send_modify(|snapshot| snapshot.tip = tip);
    }

    pub fn set_ibd(&self, is_ibd: bool) {
        self.tx.send_modify(|snapshot| snapshot.is_ibd = is_ibd);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::consensus;

    #[tokio::test]
    async fn watchers_observe_tip_updates() {
        let genesis = ChainHeader::genesis(consensus::genesis_block().header);
        let state = ChainTipState::new(genesis.clone());
        let mut watcher = state.subscribe();

        assert_eq!(state.tip().hash(), genesis.hash());
        assert!(state.is_ibd());

        state.set_ibd(false);
        watcher.changed().await.unwrap();
        assert!(!watcher.borrow().is_ibd);
    }
}
