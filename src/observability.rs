pub mod logging;
pub mod metrics;

use crate::error_handler::ErrorStats;
use crate::observability::metrics::{render_summary, MetricsSummary};
use crate::orphan::OrphanStats;
use crate::processor::ProcessingStats;
use crate::runtime::queue::QueueTelemetry;
use serde::Serialize;
use thiserror::Error;

/// Point-in-time view served by the `status` instruction and the heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub stats: ProcessingStats,
    pub orphans: OrphanStats,
    pub errors: ErrorStats,
    pub metrics: MetricsSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<QueueTelemetry>,
}

impl StatusSnapshot {
    /// Full Prometheus exposition for the pipeline.
    pub fn render_metrics(&self) -> String {
        let mut output = render_summary(&self.metrics);
        output.push_str(&format!(
            "epu_ingest_events_total {}\nepu_ingest_events_successful_total {}\nepu_ingest_events_orphaned_total {}\nepu_ingest_events_failed_total {}\nepu_ingest_orphans_resolved_total {}\n",
            self.stats.total_processed,
            self.stats.successful,
            self.stats.orphaned,
            self.stats.failed,
            self.stats.orphans_resolved,
        ));
        let by_type = &self.orphans.by_type;
        for (label, count) in [
            ("gridsquare", by_type.gridsquare),
            ("foilhole", by_type.foilhole),
            ("micrograph", by_type.micrograph),
            ("atlas", by_type.atlas),
        ] {
            output.push_str(&format!(
                "epu_ingest_orphans_pending{{type=\"{label}\"}} {count}\n"
            ));
        }
        output.push_str(&format!(
            "epu_ingest_orphans_timed_out_total {}\nepu_ingest_active_errors {}\n",
            self.orphans.total_timed_out, self.errors.active_errors,
        ));
        for (category, count) in &self.errors.error_counts {
            output.push_str(&format!(
                "epu_ingest_errors_total{{category=\"{category}\"}} {count}\n"
            ));
        }
        if let Some(queue) = &self.queue {
            output.push_str(&queue.render_metrics());
        }
        output
    }
}

/// Errors raised while validating exported metrics.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ObservabilityError {
    #[error("metric '{name}' must emit `_ms` suffixed values")]
    NonMsMetric { name: String },
}

/// Rejects exposition text containing any `_seconds` metric.
pub fn ensure_ms_only_metrics(exposition: &str) -> Result<(), ObservabilityError> {
    for name in scrape_metric_names(exposition) {
        if name.ends_with("_seconds") {
            return Err(ObservabilityError::NonMsMetric { name });
        }
    }
    Ok(())
}

/// Extracts metric names (without labels) from Prometheus exposition text.
pub fn scrape_metric_names(exposition: &str) -> Vec<String> {
    exposition
        .lines()
        .filter_map(|line| {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                return None;
            }
            trimmed
                .split(|c: char| c == '{' || c.is_whitespace())
                .next()
                .filter(|name| !name.is_empty())
                .map(str::to_string)
        })
        .collect()
}
