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

use crate::{blocks::ChainHeader, common::rolling_avg::ExponentialMovingAverage};
use std::sync::Arc;

/// Per-peer download bookkeeping: the smoothed speed measurement, the derived quality score used as the
/// selection weight, and the peer's claimed tip.
#[derive(Debug, Clone)]
pub struct PeerPerformance {
    speed: ExponentialMovingAverage,
    initial_speed: f64,
    alpha: f64,
    /// Derived from speed relative to the fastest peer; always in [0, 1].
    pub quality_score: f64,
    pub claimed_tip: Option<Arc<ChainHeader>>,
}

impl PeerPerformance {
    pub fn new(initial_speed: f64, alpha: f64) -> Self {
        Self {
            speed: ExponentialMovingAverage::new(alpha),
            initial_speed,
            alpha,
            quality_score: 1.0,
            claimed_tip: None,
        }
    }

    pub fn add_speed_sample(&mut self, bytes_per_sec: f64) {
        self.speed.add_sample(bytes_per_sec);
    }

    /// Forget the history and treat the peer as running at `bytes_per_sec` (stall penalty).
    pub fn reset_speed(&mut self, bytes_per_sec: f64) {
        self.speed = ExponentialMovingAverage::new(self.alpha);
        self.speed.add_sample(bytes_per_sec);
    }

    pub fn speed(&self) -> f64 {
        self.speed.value_or(self.initial_speed)
    }

    /// The speed used for scoring and capacity: capped outside initial block download so one very fast peer
    /// does not monopolize assignment.
    pub fn effective_speed(&self, is_ibd: bool, cap: f64) -> f64 {
        let speed = self.speed();
        if is_ibd {
            speed
        } else {
            speed.min(cap)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unmeasured_peers_use_the_initial_speed() {
        let perf = PeerPerformance::new(1000.0, 0.25);
        assert_eq!(perf.speed(), 1000.0);
        assert_eq!(perf.quality_score, 1.0);
    }

    #[test]
    fn effective_speed_is_capped_only_outside_ibd() {
        let mut perf = PeerPerformance::new(1000.0, 0.25);
        perf.reset_speed(10_000.0);
        assert_eq!(perf.effective_speed(true, 2000.0), 10_000.0);
        assert_eq!(perf.effective_speed(false, 2000.0), 2000.0);
    }

    #[test]
    fn reset_discards_history() {
        let mut perf = PeerPerformance::new(1000.0, 0.25);
        perf.add_speed_sample(50_000.0);
        assert!(perf.speed() > 1000.0);
        perf.reset_speed(1.0);
        assert_eq!(perf.speed(), 1.0);
    }

    #[test]
    fn reset_keeps_the_configured_smoothing_constant() {
        let mut perf = PeerPerformance::new(1000.0, 0.5);
        perf.reset_speed(100.0);
        perf.add_speed_sample(0.0);
        // With alpha 0.5 the next sample halves the average; a reset must not change that weight
        assert_eq!(perf.speed(), 50.0);
    }
}
