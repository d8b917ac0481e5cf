//! Query latency tracking with a rolling average.
//!
//! Owned by each engine instance and injected where needed - there is no
//! global collector.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Rolling window for the latency average (5 minutes).
///
/// Searches are comparatively infrequent, so a longer window captures a
/// meaningful average.
const WINDOW: Duration = Duration::from_secs(300);

/// Maximum retained samples, a bound independent of the time window.
const MAX_SAMPLES: usize = 1000;

#[derive(Debug)]
struct Sample {
    at: Instant,
    duration_ms: f64,
}

#[derive(Debug, Default)]
struct MetricData {
    samples: VecDeque<Sample>,
    total_count: u64,
}

/// Per-engine query latency metrics.
#[derive(Debug, Default)]
pub struct QueryMetrics {
    inner: Mutex<MetricData>,
}

impl QueryMetrics {
    /// Creates an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one query duration.
    pub fn record(&self, duration: Duration) {
        let Ok(mut data) = self.inner.lock() else {
            return;
        };
        data.total_count += 1;
        data.samples.push_back(Sample {
            at: Instant::now(),
            duration_ms: duration.as_secs_f64() * 1000.0,
        });
        while data.samples.len() > MAX_SAMPLES {
            data.samples.pop_front();
        }
    }

    /// Average latency in milliseconds over the rolling window, 0.0 when no
    /// samples fall inside it.
    pub fn average_ms(&self) -> f64 {
        let Ok(mut data) = self.inner.lock() else {
            return 0.0;
        };
        let cutoff = Instant::now().checked_sub(WINDOW);
        if let Some(cutoff) = cutoff {
            while data
                .samples
                .front()
                .is_some_and(|s| s.at < cutoff)
            {
                data.samples.pop_front();
            }
        }
        if data.samples.is_empty() {
            return 0.0;
        }
        let sum: f64 = data.samples.iter().map(|s| s.duration_ms).sum();
        sum / data.samples.len() as f64
    }

    /// Total queries recorded since construction.
    pub fn total_count(&self) -> u64 {
        self.inner.lock().map(|d| d.total_count).unwrap_or(0)
    }
}
