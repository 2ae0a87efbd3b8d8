// Copyright 2025 Wayfinder Authors
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

use std::sync::atomic::{AtomicU64, Ordering};

/// One bin for zero plus nine leading-digit bins for each of eleven decades.
pub const NUM_HISTOGRAM_BINS: usize = 100;

const DECADES: u32 = 11;

/// Logarithmic latency histogram with atomic bins.
///
/// Values are microseconds. Each decade from 1μs to 10^11μs is split into
/// nine bins by leading digit, so the relative bin width stays below 100%
/// and percentile estimates stay within one bin of the true value.
///
/// Recording is lock-free and uses relaxed ordering: readers only need an
/// eventually consistent view, and [`take`](Self::take) tolerates samples
/// racing with the reset landing in either window.
#[derive(Debug)]
pub struct LatencyHistogram {
    bins: [AtomicU64; NUM_HISTOGRAM_BINS],
    total_latency: AtomicU64,
    sample_count: AtomicU64,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        Self {
            bins: std::array::from_fn(|_| AtomicU64::new(0)),
            total_latency: AtomicU64::new(0),
            sample_count: AtomicU64::new(0),
        }
    }

    /// Records one latency sample in microseconds.
    pub fn record(&self, latency_us: u64) {
        self.bins[latency_to_bin(latency_us)].fetch_add(1, Ordering::Relaxed);
        self.total_latency.fetch_add(latency_us, Ordering::Relaxed);
        self.sample_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.sample_count.load(Ordering::Relaxed)
    }

    /// Copies the current contents.
    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            bins: self.bins.iter().map(|b| b.load(Ordering::Relaxed)).collect(),
            total_latency: self.total_latency.load(Ordering::Relaxed),
            sample_count: self.sample_count.load(Ordering::Relaxed),
        }
    }

    /// Copies the current contents and zeroes the histogram.
    pub fn take(&self) -> HistogramSnapshot {
        let bins = self.bins.iter().map(|b| b.swap(0, Ordering::Relaxed)).collect();
        HistogramSnapshot {
            bins,
            total_latency: self.total_latency.swap(0, Ordering::Relaxed),
            sample_count: self.sample_count.swap(0, Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        let _ = self.take();
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of a [`LatencyHistogram`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistogramSnapshot {
    bins: Vec<u64>,
    total_latency: u64,
    sample_count: u64,
}

impl HistogramSnapshot {
    pub fn count(&self) -> u64 {
        self.sample_count
    }

    /// Exact mean of the recorded samples, 0 when empty.
    pub fn average(&self) -> f64 {
        if self.sample_count == 0 {
            return 0.0;
        }
        self.total_latency as f64 / self.sample_count as f64
    }

    /// Estimates the value at `percentile` (0-100).
    ///
    /// Interpolates linearly inside the bin that holds the target rank.
    /// Returns 0 when no samples were recorded.
    pub fn percentile(&self, percentile: f64) -> u64 {
        if self.sample_count == 0 {
            return 0;
        }
        let p = percentile.clamp(0.0, 100.0);
        let target = ((self.sample_count as f64 * p / 100.0).ceil() as u64).max(1);

        let mut cumulative = 0u64;
        for (bin, &count) in self.bins.iter().enumerate() {
            if count > 0 && cumulative + count >= target {
                let (low, high) = bin_bounds(bin);
                let fraction = (target - cumulative) as f64 / count as f64;
                return low + ((high - low) as f64 * fraction) as u64;
            }
            cumulative += count;
        }
        bin_bounds(NUM_HISTOGRAM_BINS - 1).1
    }
}

fn latency_to_bin(latency_us: u64) -> usize {
    if latency_us == 0 {
        return 0;
    }
    let decade = latency_us.ilog10();
    if decade >= DECADES {
        return NUM_HISTOGRAM_BINS - 1;
    }
    let leading = latency_us / 10u64.pow(decade);
    1 + decade as usize * 9 + (leading as usize - 1)
}

/// Half-open `[low, high)` range covered by `bin`.
fn bin_bounds(bin: usize) -> (u64, u64) {
    if bin == 0 {
        return (0, 1);
    }
    let decade = ((bin - 1) / 9) as u32;
    let leading = ((bin - 1) % 9 + 1) as u64;
    let scale = 10u64.pow(decade);
    (leading * scale, (leading + 1) * scale)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bin_mapping_edges() {
        assert_eq!(latency_to_bin(0), 0);
        assert_eq!(latency_to_bin(1), 1);
        assert_eq!(latency_to_bin(9), 9);
        assert_eq!(latency_to_bin(10), 10);
        assert_eq!(latency_to_bin(99), 18);
        assert_eq!(latency_to_bin(100), 19);
        assert_eq!(latency_to_bin(u64::MAX), NUM_HISTOGRAM_BINS - 1);
    }

    #[test]
    fn test_bounds_contain_value() {
        for v in [1u64, 7, 15, 230, 4_500, 99_999, 1_000_000, 31_000_000] {
            let (low, high) = bin_bounds(latency_to_bin(v));
            assert!(low <= v && v < high, "{} not in [{}, {})", v, low, high);
        }
    }

    #[test]
    fn test_average_is_exact() {
        let histogram = LatencyHistogram::new();
        histogram.record(100);
        histogram.record(200);
        histogram.record(50);
        let snapshot = histogram.snapshot();
        assert_eq!(snapshot.count(), 3);
        assert!((snapshot.average() - 350.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_percentile_estimates() {
        let histogram = LatencyHistogram::new();
        for i in 0..1000 {
            histogram.record(i);
        }
        let snapshot = histogram.snapshot();

        let p50 = snapshot.percentile(50.0);
        assert!((400..=600).contains(&p50), "p50 = {}", p50);

        let p95 = snapshot.percentile(95.0);
        assert!((900..=1000).contains(&p95), "p95 = {}", p95);

        let p99 = snapshot.percentile(99.0);
        assert!((980..=1000).contains(&p99), "p99 = {}", p99);
    }

    #[test]
    fn test_take_resets() {
        let histogram = LatencyHistogram::new();
        histogram.record(42);
        histogram.record(43);

        let window = histogram.take();
        assert_eq!(window.count(), 2);
        assert_eq!(histogram.count(), 0);
        assert_eq!(histogram.snapshot().percentile(99.0), 0);
    }

    #[test]
    fn test_empty_snapshot() {
        let snapshot = LatencyHistogram::new().snapshot();
        assert_eq!(snapshot.average(), 0.0);
        assert_eq!(snapshot.percentile(50.0), 0);
    }
}
