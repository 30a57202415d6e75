use std::sync::Arc;
use std::time::Duration;

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

use crate::engine::{Outcome, PassError, PassResult};

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PassLabels {
    pub result: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ArtifactLabels {
    pub outcome: String,
    /// Failing stage, `none` for applied and skipped artifacts.
    pub stage: String,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Every metric exposed by the consumer.
pub struct Metrics {
    pub passes: Family<PassLabels, Counter>,
    pub pass_duration_seconds: Histogram,
    pub last_success_timestamp_seconds: Gauge,
    pub artifacts: Family<ArtifactLabels, Counter>,
    pub s3_download_bytes: Counter,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let passes = Family::<PassLabels, Counter>::default();
        registry.register(
            "partition_sync_passes",
            "Reconciliation passes by result",
            passes.clone(),
        );

        let pass_duration_seconds = Histogram::new(exponential_buckets(0.5, 2.0, 14));
        registry.register(
            "partition_sync_pass_duration_seconds",
            "Wall time of a reconciliation pass",
            pass_duration_seconds.clone(),
        );

        let last_success_timestamp_seconds: Gauge = Gauge::default();
        registry.register(
            "partition_sync_last_success_timestamp_seconds",
            "Unix time of the last pass without failures",
            last_success_timestamp_seconds.clone(),
        );

        let artifacts = Family::<ArtifactLabels, Counter>::default();
        registry.register(
            "partition_sync_artifacts",
            "Processed artifacts by outcome and failing stage",
            artifacts.clone(),
        );

        let s3_download_bytes = Counter::default();
        registry.register(
            "partition_sync_s3_download_bytes",
            "Bytes downloaded from the artifact bucket",
            s3_download_bytes.clone(),
        );

        Self {
            passes,
            pass_duration_seconds,
            last_success_timestamp_seconds,
            artifacts,
            s3_download_bytes,
        }
    }

    /// Account for one finished pass.
    pub fn record_pass(&self, outcome: &Result<PassResult, PassError>, elapsed: Duration) {
        let label = match outcome {
            Ok(_) => "success",
            Err(PassError::Artifacts { .. }) => "partial",
            Err(PassError::Discovery(_)) => "discovery_failed",
            Err(PassError::Cancelled) => "cancelled",
        };
        self.passes
            .get_or_create(&PassLabels {
                result: label.to_string(),
            })
            .inc();
        self.pass_duration_seconds.observe(elapsed.as_secs_f64());

        if outcome.is_ok() {
            self.last_success_timestamp_seconds
                .set(chrono::Utc::now().timestamp());
        }

        let result = match outcome {
            Ok(result) => result,
            Err(err) => match err.result() {
                Some(result) => result,
                None => return,
            },
        };
        for artifact in &result.outcomes {
            let stage = match &artifact.outcome {
                Outcome::Failed { stage, .. } => stage.as_str(),
                _ => "none",
            };
            self.artifacts
                .get_or_create(&ArtifactLabels {
                    outcome: artifact.outcome.as_str().to_string(),
                    stage: stage.to_string(),
                })
                .inc();
            self.s3_download_bytes.inc_by(artifact.downloaded);
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Registry plus metrics, shared between the run loop and the HTTP server.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// OpenMetrics text exposition of the registry.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}
