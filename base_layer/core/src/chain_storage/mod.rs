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

//! Durable chain state: the batched block store with its write queue, the persisted main-chain headers, the
//! coinview with per-height rewind records, and the rewind-data lookup window.

mod block_store;
mod coinview;
mod error;
mod header_store;
mod rewind_index;

pub use block_store::{BlockStoreConfig, BlockStoreDatabase, BlockStoreQueue, BLOCK_STORE_FLUSH_INTERVAL};
pub use coinview::{CachedCoinView, Coin, CoinView, CoinViewChanges, CoinsRecord, PersistentCoinView, RewindRecord};
pub use error::ChainStorageError;
pub use header_store::HeaderStore;
pub use rewind_index::RewindDataIndex;

/// The named stores this crate keeps inside the shared key-value engine. The application opens the engine
/// with all of them (plus the comms peer book).
pub mod store_names {
    pub const BLOCKS: &str = "blocks";
    pub const HEADERS: &str = "headers";
    pub const TX_INDEX: &str = "tx_index";
    pub const COINS: &str = "coins";
    pub const REWIND: &str = "rewind";
    pub const METADATA: &str = "metadata";
    pub const ADDR_BALANCES: &str = "addr_balances";
    pub const ADDR_OUTPOINTS: &str = "addr_outpoints";
    pub const ADDR_REWIND: &str = "addr_rewind";

    pub fn all() -> [&'static str; 9] {
        [
            BLOCKS,
            HEADERS,
            TX_INDEX,
            COINS,
            REWIND,
            METADATA,
            ADDR_BALANCES,
            ADDR_OUTPOINTS,
            ADDR_REWIND,
        ]
    }
}
