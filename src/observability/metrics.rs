use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

/// Default number of latency samples kept for percentile estimation.
pub const LATENCY_WINDOW: usize = 1_000;

/// Latency percentiles over the recent sample window, in milliseconds.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize)]
pub struct LatencyPercentiles {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub mean: f64,
    pub max: f64,
}

/// Read-only snapshot returned by [`ProcessingMetrics::get_summary`].
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub success_count: u64,
    pub failure_count: u64,
    pub success_rate: f64,
    pub throughput_per_second: f64,
    pub latency_percentiles: LatencyPercentiles,
    pub retry_distribution: BTreeMap<String, u64>,
    pub uptime_seconds: f64,
}

#[derive(Debug)]
struct MetricsState {
    window: usize,
    latencies_ms: VecDeque<f64>,
    success_count: u64,
    failure_count: u64,
    retry_distribution: BTreeMap<String, u64>,
}

/// Rolling success/failure/retry counters plus a bounded latency window.
#[derive(Debug)]
pub struct ProcessingMetrics {
    started_at: Instant,
    state: Mutex<MetricsState>,
}

impl Default for ProcessingMetrics {
    fn default() -> Self {
        Self::new(LATENCY_WINDOW)
    }
}

impl ProcessingMetrics {
    pub fn new(latency_window: usize) -> Self {
        let window = latency_window.max(1);
        Self {
            started_at: Instant::now(),
            state: Mutex::new(MetricsState {
                window,
                latencies_ms: VecDeque::with_capacity(window),
                success_count: 0,
                failure_count: 0,
                retry_distribution: BTreeMap::new(),
            }),
        }
    }

    pub fn record_latency(&self, ms: f64) {
        if !ms.is_finite() || ms < 0.0 {
            return;
        }
        let mut state = self.lock();
        if state.latencies_ms.len() == state.window {
            state.latencies_ms.pop_front();
        }
        state.latencies_ms.push_back(ms);
    }

    pub fn record_success(&self) {
        let mut state = self.lock();
        state.success_count = state.success_count.saturating_add(1);
    }

    pub fn record_failure(&self) {
        let mut state = self.lock();
        state.failure_count = state.failure_count.saturating_add(1);
    }

    pub fn record_retry(&self, category_label: &str) {
        *self
            .lock()
            .retry_distribution
            .entry(category_label.to_string())
            .or_insert(0) += 1;
    }

    pub fn get_summary(&self) -> MetricsSummary {
        let uptime_seconds = self.started_at.elapsed().as_secs_f64();
        let state = self.lock();
        let total = state.success_count + state.failure_count;
        let success_rate = if total == 0 {
            0.0
        } else {
            state.success_count as f64 / total as f64
        };
        let throughput_per_second = if uptime_seconds > 0.0 {
            total as f64 / uptime_seconds
        } else {
            0.0
        };
        MetricsSummary {
            success_count: state.success_count,
            failure_count: state.failure_count,
            success_rate,
            throughput_per_second,
            latency_percentiles: percentiles(&state.latencies_ms),
            retry_distribution: state.retry_distribution.clone(),
            uptime_seconds,
        }
    }

    /// Renders the current summary as Prometheus exposition text.
    pub fn render_metrics(&self) -> String {
        render_summary(&self.get_summary())
    }

    fn lock(&self) -> MutexGuard<'_, MetricsState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Prometheus text for a [`MetricsSummary`]. Durations are exported in milliseconds.
pub fn render_summary(summary: &MetricsSummary) -> String {
    let mut output = format!(
        "epu_ingest_success_total {}\nepu_ingest_failure_total {}\nepu_ingest_success_rate {:.6}\nepu_ingest_throughput_per_second {:.6}\nepu_ingest_latency_p50_ms {:.3}\nepu_ingest_latency_p95_ms {:.3}\nepu_ingest_latency_p99_ms {:.3}\nepu_ingest_latency_mean_ms {:.3}\nepu_ingest_latency_max_ms {:.3}\nepu_ingest_uptime_ms {}\n",
        summary.success_count,
        summary.failure_count,
        summary.success_rate,
        summary.throughput_per_second,
        summary.latency_percentiles.p50,
        summary.latency_percentiles.p95,
        summary.latency_percentiles.p99,
        summary.latency_percentiles.mean,
        summary.latency_percentiles.max,
        (summary.uptime_seconds * 1_000.0) as u64,
    );
    for (category, count) in &summary.retry_distribution {
        output.push_str(&format!(
            "epu_ingest_retry_total{{category=\"{category}\"}} {count}\n"
        ));
    }
    output
}

/// Nearest-rank percentiles; all zero for an empty window.
fn percentiles(samples: &VecDeque<f64>) -> LatencyPercentiles {
    if samples.is_empty() {
        return LatencyPercentiles::default();
    }
    let mut sorted: Vec<f64> = samples.iter().copied().collect();
    sorted.sort_by(f64::total_cmp);
    let rank = |p: f64| {
        let idx = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
        sorted[idx.clamp(1, sorted.len()) - 1]
    };
    let sum: f64 = sorted.iter().sum();
    LatencyPercentiles {
        p50: rank(50.0),
        p95: rank(95.0),
        p99: rank(99.0),
        mean: sum / sorted.len() as f64,
        max: sorted[sorted.len() - 1],
    }
}
