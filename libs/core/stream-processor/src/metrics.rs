//! Prometheus metrics for processor pipelines
//!
//! Every pipeline records through a [`ProcessorMetrics`] labelled with its
//! handler name. Without an installed recorder the calls are no-ops.

use crate::error::Stage;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::info;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder.
///
/// Call this once at startup. Subsequent calls are no-ops.
pub fn init_metrics() -> Result<(), BuildError> {
    PROMETHEUS_HANDLE.get_or_try_init(|| -> Result<PrometheusHandle, BuildError> {
        let handle = PrometheusBuilder::new().install_recorder()?;
        info!("Prometheus metrics initialized");
        Ok(handle)
    })?;
    Ok(())
}

/// Render metrics in Prometheus format
pub fn render_metrics() -> String {
    PROMETHEUS_HANDLE
        .get()
        .map(|h| h.render())
        .unwrap_or_default()
}

/// Metrics helper for one handler
#[derive(Clone, Debug)]
pub struct ProcessorMetrics {
    handler: String,
}

impl ProcessorMetrics {
    pub fn new(handler: impl Into<String>) -> Self {
        Self {
            handler: handler.into(),
        }
    }

    /// Record a record pulled from the source
    pub fn record_fetched(&self) {
        counter!(
            "processor_records_fetched_total",
            "handler" => self.handler.clone()
        )
        .increment(1);
    }

    /// Record a `handle` call
    pub fn record_handled(&self, status: &'static str, duration: Duration) {
        counter!(
            "processor_records_handled_total",
            "handler" => self.handler.clone(),
            "status" => status
        )
        .increment(1);

        histogram!(
            "processor_handle_duration_seconds",
            "handler" => self.handler.clone()
        )
        .record(duration.as_secs_f64());
    }

    /// Record a flushed batch
    pub fn batch_flushed(&self, trigger: &'static str, size: usize, duration: Duration) {
        counter!(
            "processor_batches_flushed_total",
            "handler" => self.handler.clone(),
            "trigger" => trigger
        )
        .increment(1);

        histogram!(
            "processor_batch_size",
            "handler" => self.handler.clone()
        )
        .record(size as f64);

        histogram!(
            "processor_batch_duration_seconds",
            "handler" => self.handler.clone()
        )
        .record(duration.as_secs_f64());
    }

    /// Record an error, labelled with its stage and whether it was fatal
    pub fn error(&self, stage: Stage, fatal: bool) {
        let fatal = if fatal { "true" } else { "false" };
        counter!(
            "processor_errors_total",
            "handler" => self.handler.clone(),
            "stage" => stage.as_ref().to_string(),
            "fatal" => fatal
        )
        .increment(1);
    }

    /// Record a commit call
    pub fn committed(&self, coordinates: usize) {
        counter!(
            "processor_commits_total",
            "handler" => self.handler.clone()
        )
        .increment(1);

        counter!(
            "processor_committed_records_total",
            "handler" => self.handler.clone()
        )
        .increment(coordinates as u64);
    }

    /// Update the number of running workers for a stage
    pub fn workers(&self, stage: Stage, count: usize) {
        gauge!(
            "processor_workers",
            "handler" => self.handler.clone(),
            "stage" => stage.as_ref().to_string()
        )
        .set(count as f64);
    }
}
