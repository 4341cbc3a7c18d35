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

//! Smoothed measurements used by the download scheduler: a bounded rolling average over recent samples and
//! an exponential moving average for rates that must react to the newest observation.

use std::{collections::VecDeque, time::Duration};

/// A rolling average over the most recent `num_samples` durations.
#[derive(Debug, Clone)]
pub struct RollingAverageTime {
    samples: VecDeque<Duration>,
    num_samples: usize,
}

impl RollingAverageTime {
    pub fn new(num_samples: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(num_samples),
            num_samples,
        }
    }

    pub fn add_sample(&mut self, sample: Duration) {
        if self.samples.len() == self.num_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn calculate_average(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let total: Duration = self.samples.iter().sum();
        Some(total / self.samples.len() as u32)
    }

    pub fn calculate_average_with_min_samples(&self, min_samples: usize) -> Option<Duration> {
        if self.samples.len() < min_samples {
            return None;
        }
        self.calculate_average()
    }
}

/// An exponential moving average. `alpha` is the weight of the newest sample.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialMovingAverage {
    alpha: f64,
    value: Option<f64>,
}

impl ExponentialMovingAverage {
    pub fn new(alpha: f64) -> Self {
        debug_assert!(alpha > 0.0 && alpha <= 1.0);
        Self { alpha, value: None }
    }

    pub fn add_sample(&mut self, sample: f64) {
        self.value = Some(match self.value {
            Some(current) => self.alpha * sample + (1.0 - self.alpha) * current,
            None => sample,
        });
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }

    pub fn value_or(&self, default: f64) -> f64 {
        self.value.unwrap_or(default)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rolling_average_is_bounded() {
        let mut avg = RollingAverageTime::new(3);
        assert!(avg.calculate_average().is_none());
        for secs in [1, 2, 3, 10] {
            avg.add_sample(Duration::from_secs(secs));
        }
        // Only the last three samples (2, 3, 10) survive
        assert_eq!(avg.calculate_average().unwrap(), Duration::from_secs(5));
    }

    #[test]
    fn min_samples_gate() {
        let mut avg = RollingAverageTime::new(5);
        avg.add_sample(Duration::from_secs(1));
        assert!(avg.calculate_average_with_min_samples(2).is_none());
        avg.add_sample(Duration::from_secs(3));
        assert_eq!(
            avg.calculate_average_with_min_samples(2).unwrap(),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn ema_tracks_new_samples() {
        let mut ema = ExponentialMovingAverage::new(0.5);
        assert!(ema.value().is_none());
        ema.add_sample(100.0);
        assert_eq!(ema.value().unwrap(), 100.0);
        ema.add_sample(0.0);
        assert_eq!(ema.value().unwrap(), 50.0);
    }
}
