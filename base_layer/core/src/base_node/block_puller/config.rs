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
pub struct BlockPullerConfig {
    /// An assignment older than this for an important header counts as stalled.
    pub max_block_delivery_time: Duration,
    /// Headers up to this far above the consensus tip are "important": their stalls are acted on.
    pub important_height_margin: u64,
    /// Cadence of the stall sweep.
    pub stall_check_interval: Duration,
    /// Lower clamp on the in-flight download budget.
    pub min_in_flight: usize,
    /// Multiplier over measured throughput when sizing the in-flight budget.
    pub headroom_factor: f64,
    /// Outside initial block download, one peer's effective speed is capped at this many bytes/second so a
    /// single fast peer cannot monopolize assignment.
    pub max_peer_speed_non_ibd: f64,
    /// Normal-priority jobs are only scheduled while free slots are at least this fraction of the budget.
    pub queue_slot_fraction: f64,
    /// Weight of the newest sample in the per-peer speed average.
    pub speed_ema_alpha: f64,
    /// Weight of the newest sample in the average-block-size estimate.
    pub block_size_ema_alpha: f64,
    /// Assumed bytes/second for a peer with no samples yet.
    pub initial_peer_speed: f64,
    /// The speed a stalled peer is reset to.
    pub stall_penalty_speed: f64,
    /// Assumed block size before any block has been delivered.
    pub initial_avg_block_size: f64,
}

impl Default for BlockPullerConfig {
    fn default() -> Self {
        Self {
            max_block_delivery_time: Duration::from_secs(30),
            important_height_margin: 10,
            stall_check_interval: Duration::from_millis(500),
            min_in_flight: 32,
            headroom_factor: 1.1,
            max_peer_speed_non_ibd: 1024.0 * 1024.0,
            queue_slot_fraction: 0.1,
            speed_ema_alpha: 0.25,
            block_size_ema_alpha: 0.1,
            initial_peer_speed: 100.0 * 1024.0,
            stall_penalty_speed: 1.0,
            initial_avg_block_size: 250.0 * 1024.0,
        }
    }
}
