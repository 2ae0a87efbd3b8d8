use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use wayfinder_common::properties::LatencyToUse;
use wayfinder_metrics::{HistogramSnapshot, LatencyHistogram};

/// Failure classes reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    ConnectError,
    ClosedChannel,
    ServerError,
    Timeout,
    /// The endpoint answered with an application-level error
    RemoteInvocation,
    Other,
}

impl ErrorType {
    /// Whether the error counts against the endpoint's health.
    pub fn is_degrading(&self) -> bool {
        matches!(
            self,
            ErrorType::ConnectError | ErrorType::ClosedChannel | ErrorType::ServerError | ErrorType::Timeout
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Error(ErrorType),
}

/// Per endpoint and partition call statistics of the current window.
///
/// Written by request tasks, drained by the property event loop once per
/// window through [`take_window`](Self::take_window).
#[derive(Debug, Default)]
pub struct CallTracker {
    calls: AtomicU64,
    errors: AtomicU64,
    latency: LatencyHistogram,
}

impl CallTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, latency: Duration, outcome: CallOutcome) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if let CallOutcome::Error(error) = outcome {
            if error.is_degrading() {
                self.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.latency.record(latency.as_micros() as u64);
    }

    /// Returns the statistics gathered since the previous call and starts a new window.
    pub fn take_window(&self) -> WindowStats {
        WindowStats {
            call_count: self.calls.swap(0, Ordering::Relaxed),
            error_count: self.errors.swap(0, Ordering::Relaxed),
            latency: self.latency.take(),
        }
    }
}

/// Statistics of one window of one [`CallTracker`].
#[derive(Debug, Clone)]
pub struct WindowStats {
    pub call_count: u64,
    /// Degrading errors only
    pub error_count: u64,
    pub latency: HistogramSnapshot,
}

impl WindowStats {
    pub fn error_rate(&self) -> f64 {
        if self.call_count == 0 {
            return 0.0;
        }
        self.error_count as f64 / self.call_count as f64
    }

    /// Selected latency statistic in milliseconds.
    pub fn latency_ms(&self, which: LatencyToUse) -> f64 {
        let us = match which {
            LatencyToUse::Average => self.latency.average(),
            LatencyToUse::P50 => self.latency.percentile(50.0) as f64,
            LatencyToUse::P90 => self.latency.percentile(90.0) as f64,
            LatencyToUse::P95 => self.latency.percentile(95.0) as f64,
            LatencyToUse::P99 => self.latency.percentile(99.0) as f64,
        };
        us / 1000.0
    }

    /// Exact mean latency in milliseconds.
    pub fn average_ms(&self) -> f64 {
        self.latency.average() / 1000.0
    }
}
