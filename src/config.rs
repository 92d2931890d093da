use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::analysis::topology::RankContract;

/// Top-level configuration for the viztel service.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Identifies this viztel instance in logs and exported data.
    #[serde(default)]
    pub meta_client_name: String,

    /// Producer-side signal channel and harvest cadence.
    #[serde(default)]
    pub channel: ChannelConfig,

    /// Interval correlation and audio-sync analysis.
    #[serde(default)]
    pub analysis: AnalysisConfig,

    /// Rank contracts checked against every frame batch.
    #[serde(default)]
    pub topology: TopologyConfig,

    /// Frame persistence.
    #[serde(default)]
    pub store: StoreConfig,

    /// HTTP front door.
    #[serde(default)]
    pub server: ServerConfig,

    /// Optional frame export sinks.
    #[serde(default)]
    pub export: ExportConfig,
}

/// Signal channel configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    /// Harvest/assembly cadence. Default: 100ms.
    #[serde(default = "default_harvest_interval", with = "humantime_serde")]
    pub harvest_interval: Duration,

    /// Frames held while no exporter is ready. Default: 200.
    #[serde(default = "default_outbox_capacity")]
    pub outbox_capacity: usize,

    /// Idle time after which an empty signal slot is dropped. Default: 30s.
    #[serde(default = "default_stale_threshold", with = "humantime_serde")]
    pub stale_threshold: Duration,

    /// How often stale slots are pruned. Default: 10s.
    #[serde(default = "default_prune_interval", with = "humantime_serde")]
    pub prune_interval: Duration,
}

/// Interval correlation configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisConfig {
    /// Entities whose motion counts as input. Default: `__cursor__`, `__input__`.
    #[serde(default = "default_input_entity_ids")]
    pub input_entity_ids: Vec<String>,

    /// Entities whose motion counts as output. Empty means auto-detect.
    #[serde(default)]
    pub output_entity_ids: Vec<String>,

    /// Minimum |correlation| for a coupled interval. Default: 0.35.
    #[serde(default = "default_correlation_threshold")]
    pub correlation_threshold: f64,

    /// Input variance above which input counts as active. Default: 0.01.
    #[serde(default = "default_input_variance_threshold")]
    pub input_variance_threshold: f64,

    /// Output variance above which output counts as active. Default: 0.001.
    #[serde(default = "default_output_variance_threshold")]
    pub output_variance_threshold: f64,

    /// Intervals shorter than this are skipped. Default: 50.
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: i64,

    /// Fewer frames than this yields INSUFFICIENT_DATA. Default: 2.
    #[serde(default = "default_min_interval_frames")]
    pub min_interval_frames: usize,

    /// Audio-sync analysis.
    #[serde(default)]
    pub audio: AudioConfig,
}

/// Audio-sync configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AudioConfig {
    /// Entity carrying `peak_level` / `energy_rms`. Default: `__system__/audio`.
    #[serde(default = "default_audio_entity_id")]
    pub entity_id: String,

    /// Peak energy below this is silence. Default: 0.05.
    #[serde(default = "default_silence_threshold")]
    pub silence_threshold: f64,

    /// Peak later than this after the marker is lag. Default: 200.
    #[serde(default = "default_lag_threshold_ms")]
    pub lag_threshold_ms: i64,

    /// Search window after each marker. Default: 300.
    #[serde(default = "default_search_window_ms")]
    pub search_window_ms: i64,

    /// Marker name fragments that expect a sound (case-insensitive).
    #[serde(default = "default_audio_keywords")]
    pub keywords: Vec<String>,
}

/// Topology checker configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TopologyConfig {
    #[serde(default)]
    pub contracts: Vec<RankContract>,

    #[serde(default)]
    pub severity: SeverityConfig,
}

/// Rank distance thresholds for violation severity.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SeverityConfig {
    /// Distance at or above which a misplaced element is major. Default: 2.
    #[serde(default = "default_major_distance")]
    pub major_distance: u32,

    /// Distance at or above which a misplaced element is critical. Default: 4.
    #[serde(default = "default_critical_distance")]
    pub critical_distance: u32,
}

/// Frame store backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Jsonl,
}

/// Frame persistence configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Directory for the jsonl backend.
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// Retention of the raw per-user stream. Default: 2h.
    #[serde(default = "default_stream_ttl", with = "humantime_serde")]
    pub stream_ttl: Duration,

    /// Retention of the per-scenario index. Default: 24h.
    #[serde(default = "default_scenario_ttl", with = "humantime_serde")]
    pub scenario_ttl: Duration,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen address. Default: ":8080".
    #[serde(default = "default_server_addr")]
    pub addr: String,
}

/// Export sink configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExportConfig {
    /// HTTP NDJSON export (e.g. to Vector).
    #[serde(default)]
    pub http: HttpExportConfig,
}

/// HTTP NDJSON export configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpExportConfig {
    /// Enable the HTTP exporter. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// HTTP endpoint to send frames to.
    #[serde(default)]
    pub address: String,

    /// Additional HTTP headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Compression algorithm (none, gzip, zstd, zlib, snappy). Default: gzip.
    #[serde(default = "default_compression")]
    pub compression: String,

    /// Maximum frames per request. Default: 64.
    #[serde(default = "default_http_batch_size")]
    pub batch_size: usize,

    /// Maximum wait before sending a partial batch. Default: 1s.
    #[serde(default = "default_http_batch_timeout", with = "humantime_serde")]
    pub batch_timeout: Duration,

    /// Request timeout. Default: 10s.
    #[serde(default = "default_http_export_timeout", with = "humantime_serde")]
    pub export_timeout: Duration,

    /// Maximum frames queued for sending. Default: 1024.
    #[serde(default = "default_http_max_queue_size")]
    pub max_queue_size: usize,

    /// Number of concurrent senders. Default: 1.
    #[serde(default = "default_http_workers")]
    pub workers: usize,

    /// Enable HTTP keep-alive connections. Default: true.
    #[serde(default = "default_true")]
    pub keep_alive: bool,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_harvest_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_outbox_capacity() -> usize {
    crate::telemetry::outbox::DEFAULT_OUTBOX_CAPACITY
}

fn default_stale_threshold() -> Duration {
    Duration::from_secs(30)
}

fn default_prune_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_input_entity_ids() -> Vec<String> {
    vec!["__cursor__".to_string(), "__input__".to_string()]
}

fn default_correlation_threshold() -> f64 {
    0.35
}

fn default_input_variance_threshold() -> f64 {
    0.01
}

fn default_output_variance_threshold() -> f64 {
    0.001
}

fn default_min_interval_ms() -> i64 {
    50
}

fn default_min_interval_frames() -> usize {
    2
}

fn default_audio_entity_id() -> String {
    "__system__/audio".to_string()
}

fn default_silence_threshold() -> f64 {
    0.05
}

fn default_lag_threshold_ms() -> i64 {
    200
}

fn default_search_window_ms() -> i64 {
    300
}

fn default_audio_keywords() -> Vec<String> {
    ["COLLISION", "EXPLOSION", "SUCCESS", "FAIL", "CLICK"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_major_distance() -> u32 {
    2
}

fn default_critical_distance() -> u32 {
    4
}

fn default_stream_ttl() -> Duration {
    Duration::from_secs(2 * 60 * 60)
}

fn default_scenario_ttl() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_server_addr() -> String {
    ":8080".to_string()
}

fn default_compression() -> String {
    "gzip".to_string()
}

fn default_http_batch_size() -> usize {
    64
}

fn default_http_batch_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_http_export_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_http_max_queue_size() -> usize {
    1024
}

fn default_http_workers() -> usize {
    1
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            meta_client_name: String::new(),
            channel: ChannelConfig::default(),
            analysis: AnalysisConfig::default(),
            topology: TopologyConfig::default(),
            store: StoreConfig::default(),
            server: ServerConfig::default(),
            export: ExportConfig::default(),
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            harvest_interval: default_harvest_interval(),
            outbox_capacity: default_outbox_capacity(),
            stale_threshold: default_stale_threshold(),
            prune_interval: default_prune_interval(),
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            input_entity_ids: default_input_entity_ids(),
            output_entity_ids: Vec::new(),
            correlation_threshold: default_correlation_threshold(),
            input_variance_threshold: default_input_variance_threshold(),
            output_variance_threshold: default_output_variance_threshold(),
            min_interval_ms: default_min_interval_ms(),
            min_interval_frames: default_min_interval_frames(),
            audio: AudioConfig::default(),
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            entity_id: default_audio_entity_id(),
            silence_threshold: default_silence_threshold(),
            lag_threshold_ms: default_lag_threshold_ms(),
            search_window_ms: default_search_window_ms(),
            keywords: default_audio_keywords(),
        }
    }
}

impl Default for SeverityConfig {
    fn default() -> Self {
        Self {
            major_distance: default_major_distance(),
            critical_distance: default_critical_distance(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            directory: None,
            stream_ttl: default_stream_ttl(),
            scenario_ttl: default_scenario_ttl(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_server_addr(),
        }
    }
}

impl Default for HttpExportConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: String::new(),
            headers: HashMap::new(),
            compression: default_compression(),
            batch_size: default_http_batch_size(),
            batch_timeout: default_http_batch_timeout(),
            export_timeout: default_http_export_timeout(),
            max_queue_size: default_http_max_queue_size(),
            workers: default_http_workers(),
            keep_alive: true,
        }
    }
}

// --- Normalization ---

impl AnalysisConfig {
    /// Returns a copy whose thresholds are safe to divide by.
    ///
    /// Non-finite or non-positive thresholds fall back to their defaults,
    /// the correlation threshold is capped at 1, and frame/time minimums
    /// are clamped into range.
    pub fn normalized(&self) -> Self {
        let mut out = self.clone();
        out.correlation_threshold =
            positive_or(self.correlation_threshold, default_correlation_threshold()).min(1.0);
        out.input_variance_threshold = positive_or(
            self.input_variance_threshold,
            default_input_variance_threshold(),
        );
        out.output_variance_threshold = positive_or(
            self.output_variance_threshold,
            default_output_variance_threshold(),
        );
        out.min_interval_ms = self.min_interval_ms.max(0);
        out.min_interval_frames = self.min_interval_frames.max(2);
        out.audio.silence_threshold =
            positive_or(self.audio.silence_threshold, default_silence_threshold());
        out.audio.lag_threshold_ms = self.audio.lag_threshold_ms.max(0);
        out.audio.search_window_ms = self.audio.search_window_ms.max(0);
        out
    }
}

fn positive_or(value: f64, fallback: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        fallback
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Log filter to use: the command-line value when given, else the file's.
    pub fn effective_log_level<'a>(&'a self, flag: Option<&'a str>) -> &'a str {
        flag.unwrap_or(&self.log_level)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.channel.harvest_interval.is_zero() {
            bail!("channel.harvest_interval must be positive");
        }
        if self.channel.prune_interval.is_zero() {
            bail!("channel.prune_interval must be positive");
        }
        if self.channel.outbox_capacity == 0 {
            bail!("channel.outbox_capacity must be positive");
        }

        if self.store.backend == StoreBackend::Jsonl && self.store.directory.is_none() {
            bail!("store.directory is required for the jsonl backend");
        }
        if self.store.stream_ttl.is_zero() {
            bail!("store.stream_ttl must be positive");
        }
        if self.store.scenario_ttl.is_zero() {
            bail!("store.scenario_ttl must be positive");
        }

        let mut contract_ids = HashSet::new();
        for contract in &self.topology.contracts {
            if contract.expected_order.is_empty() {
                bail!("topology contract {} has an empty expected_order", contract.id);
            }
            if !contract_ids.insert(contract.id.as_str()) {
                bail!("duplicate topology contract id: {}", contract.id);
            }
        }

        let severity = self.topology.severity;
        if severity.major_distance == 0 {
            bail!("topology.severity.major_distance must be positive");
        }
        if severity.critical_distance < severity.major_distance {
            bail!("topology.severity.critical_distance must be >= major_distance");
        }

        // Validate HTTP export config if enabled.
        let http = &self.export.http;
        if http.enabled {
            if http.address.is_empty() {
                bail!("http address is required when enabled");
            }
            if http.max_queue_size == 0 {
                bail!("http max_queue_size must be positive when enabled");
            }
            if http.batch_size == 0 {
                bail!("http batch_size must be positive when enabled");
            }
            if http.workers == 0 {
                bail!("http workers must be positive when enabled");
            }
            if http.batch_timeout.is_zero() {
                bail!("http batch_timeout must be positive when enabled");
            }
            if http.export_timeout.is_zero() {
                bail!("http export_timeout must be positive when enabled");
            }

            let compression = &http.compression;
            match compression.as_str() {
                "none" | "gzip" | "zstd" | "zlib" | "snappy" => {}
                _ => bail!("invalid compression type: {compression}"),
            }
        }

        Ok(())
    }
}
