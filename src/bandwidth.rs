// Copyright 2026 The prismvnc Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Per-client bandwidth estimation.
//!
//! The estimator keeps a ring of recent transfer samples and derives two
//! candidate throughputs on every feed: one assuming the link was idle
//! between packets (per-sample queueing delays) and one assuming the packets
//! were back to back (whole-window timing). The reported estimate is the
//! larger of the two. The minimum round-trip time is measured elsewhere and
//! fed in; no clamping happens here.

const SAMPLES_MAX: usize = 16;

/// One transfer observation.
#[derive(Debug, Clone, Copy, Default)]
pub struct BweSample {
    /// Payload size in bytes.
    pub bytes: u64,
    /// Send completion time, microseconds on a monotonic clock.
    pub departure_time: u64,
    /// Acknowledgement time, microseconds on the same clock.
    pub arrival_time: u64,
}

/// Bandwidth estimator over a sliding window of transfer samples.
#[derive(Debug, Default)]
pub struct BandwidthEstimator {
    rtt_min: u64,
    n_samples: usize,
    index: usize,
    estimate: f64,
    samples: [BweSample; SAMPLES_MAX],
}

impl BandwidthEstimator {
    /// Creates an estimator with no samples and an rtt floor of zero.
    ///
    /// Callers are expected to feed a measured rtt through
    /// [`Self::update_rtt_min`] before the estimate is meaningful.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn sample(&self, index: usize) -> &BweSample {
        let head = (self.index + index + SAMPLES_MAX - self.n_samples) % SAMPLES_MAX;
        &self.samples[head]
    }

    // Under non-congested circumstances there is idle time between packets,
    // so per-sample queueing delays add up to the transfer time.
    fn estimate_non_congested(&self) -> f64 {
        let mut bytes_total: u64 = 0;
        let mut bw_delay_total: i64 = 0;

        for i in 0..self.n_samples {
            let s = self.sample(i);
            let rtt = s.arrival_time.saturating_sub(s.departure_time) as i64;
            bw_delay_total += rtt - self.rtt_min as i64;
            bytes_total += s.bytes;
        }

        if bw_delay_total <= 0 {
            return 0.0;
        }
        bytes_total as f64 / (bw_delay_total as f64 * 1e-6)
    }

    // Under congestion the packets are back to back and the whole window is
    // one continuous transfer.
    fn estimate_congested(&self) -> f64 {
        if self.n_samples == 0 {
            return 0.0;
        }

        let first = self.sample(0);
        let last = self.sample(self.n_samples - 1);
        let bytes_total: u64 = (0..self.n_samples).map(|i| self.sample(i).bytes).sum();

        let window = last.arrival_time.saturating_sub(first.departure_time) as i64;
        let bw_delay = window - self.rtt_min as i64;
        if bw_delay <= 0 {
            return 0.0;
        }
        bytes_total as f64 / (bw_delay as f64 * 1e-6)
    }

    /// Adds a sample and refreshes the estimate.
    pub fn feed(&mut self, sample: BweSample) {
        self.samples[self.index] = sample;
        self.index = (self.index + 1) % SAMPLES_MAX;
        if self.n_samples < SAMPLES_MAX {
            self.n_samples += 1;
        }

        self.estimate = self.estimate_non_congested().max(self.estimate_congested());
    }

    /// Updates the round-trip floor used by both candidate estimates.
    pub fn update_rtt_min(&mut self, rtt_min_us: u64) {
        self.rtt_min = rtt_min_us;
    }

    /// The current estimate in bytes per second.
    #[must_use]
    pub fn estimate(&self) -> u64 {
        self.estimate.round() as u64
    }
}
