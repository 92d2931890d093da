use anyhow::{Context, Result};
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};

const NAMESPACE: &str = "viztel";

/// Prometheus metrics for the ingestion, export and analysis paths.
///
/// All metrics use the "viztel" namespace.
pub struct HealthMetrics {
    registry: Registry,

    // === Ingestion ===
    /// Frames accepted at the ingestion boundary.
    pub frames_ingested: Counter,

    // === Producer runtime ===
    /// Frames assembled and handed to an exporter.
    pub frames_emitted: Counter,
    /// Frames waiting in the outbox.
    pub frames_buffered: Gauge,
    /// Frames lost to outbox overflow.
    pub frames_dropped: Counter,
    /// Export failures by exporter.
    pub export_errors: CounterVec,
    /// Harvest + assemble duration (100us-100ms buckets).
    pub harvest_duration: Histogram,

    // === Analysis ===
    /// Diagnosis requests by outcome (ok, not_found, error).
    pub diagnoses: CounterVec,
    /// Diagnosis analysis duration (100us-1s buckets).
    pub analysis_duration: Histogram,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let frames_ingested = Counter::with_opts(
            Opts::new(
                "frames_ingested_total",
                "Total frames accepted at the ingestion boundary.",
            )
            .namespace(NAMESPACE),
        )?;
        let frames_emitted = Counter::with_opts(
            Opts::new(
                "frames_emitted_total",
                "Total frames assembled and exported.",
            )
            .namespace(NAMESPACE),
        )?;
        let frames_buffered = Gauge::with_opts(
            Opts::new("frames_buffered", "Frames waiting in the outbox.").namespace(NAMESPACE),
        )?;
        let frames_dropped = Counter::with_opts(
            Opts::new(
                "frames_dropped_total",
                "Total frames dropped on outbox overflow.",
            )
            .namespace(NAMESPACE),
        )?;
        let export_errors = CounterVec::new(
            Opts::new("export_errors_total", "Total frame export errors by exporter.")
                .namespace(NAMESPACE),
            &["exporter"],
        )?;
        let harvest_duration = Histogram::with_opts(
            HistogramOpts::new(
                "harvest_duration_seconds",
                "Time spent harvesting channels and assembling one frame.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1]),
        )?;
        let diagnoses = CounterVec::new(
            Opts::new("diagnoses_total", "Total diagnosis requests by outcome.")
                .namespace(NAMESPACE),
            &["outcome"],
        )?;
        let analysis_duration = Histogram::with_opts(
            HistogramOpts::new(
                "analysis_duration_seconds",
                "Time spent analysing one scenario.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.0001, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )?;

        registry.register(Box::new(frames_ingested.clone()))?;
        registry.register(Box::new(frames_emitted.clone()))?;
        registry.register(Box::new(frames_buffered.clone()))?;
        registry.register(Box::new(frames_dropped.clone()))?;
        registry.register(Box::new(export_errors.clone()))?;
        registry.register(Box::new(harvest_duration.clone()))?;
        registry.register(Box::new(diagnoses.clone()))?;
        registry.register(Box::new(analysis_duration.clone()))?;

        Ok(Self {
            registry,
            frames_ingested,
            frames_emitted,
            frames_buffered,
            frames_dropped,
            export_errors,
            harvest_duration,
            diagnoses,
            analysis_duration,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Renders all metrics in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .context("encoding metrics")?;
        String::from_utf8(buffer).context("converting metrics to string")
    }
}
