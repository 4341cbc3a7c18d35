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

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AddressIndexConfig {
    /// Queries are refused while the indexer tip is more than this many blocks behind the consensus tip.
    pub sync_tolerance: u64,
    /// An address keeps at most this many balance changes before its older history is compacted.
    pub compaction_threshold: usize,
    /// History older than (consensus tip − this distance) may be compacted and its rewind records purged.
    /// Compaction is irreversible, so this must exceed the maximum reorg depth.
    pub compaction_trigger_distance: u64,
    /// How often dirty state is persisted.
    pub flush_interval: Duration,
    /// Wait before retrying when the next block has not reached the store yet.
    pub retry_delay: Duration,
    /// Ceiling on cached out-point entries; dirty entries write through on eviction.
    pub outpoint_cache_size: usize,
}

impl Default for AddressIndexConfig {
    fn default() -> Self {
        Self {
            sync_tolerance: 50,
            compaction_threshold: 500,
            compaction_trigger_distance: 600,
            flush_interval: Duration::from_secs(30),
            retry_delay: Duration::from_millis(250),
            outpoint_cache_size: 60_000,
        }
    }
}
