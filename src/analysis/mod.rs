//! Offline diagnosis of recorded frame timelines.
//!
//! Everything here is a pure function of a frame batch: markers split the
//! timeline into intervals, each interval is classified by input/output
//! correlation, critical markers are checked for an audio response, and rank
//! contracts are replayed frame by frame. [`DiagnosisEngine`] runs all of it
//! and folds the results into one scored report.

pub mod audio;
pub mod interval;
pub mod markers;
pub mod stats;
pub mod topology;

use std::borrow::Cow;

use serde::Serialize;

use crate::config::{AnalysisConfig, TopologyConfig};
use crate::telemetry::frame::Frame;

use audio::{AudioSyncAnalyzer, AudioSyncReport, AudioVerdict};
use interval::{IntervalDiagnosis, IntervalEngine};
use markers::extract_markers;
use topology::{TopologyChecker, TopologyReport};

/// Result of diagnosing one scenario.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosisReport {
    pub scenario_id: String,
    /// Health score in [0, 100].
    pub score: f64,
    pub frame_count: usize,
    pub intervals: Vec<IntervalDiagnosis>,
    pub audio_sync: AudioSyncReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topology: Option<TopologyReport>,
    pub alerts: Vec<String>,
}

/// Runs every analyzer over a frame batch. Holds no mutable state, so one
/// engine can serve concurrent requests.
#[derive(Debug, Clone)]
pub struct DiagnosisEngine {
    intervals: IntervalEngine,
    audio: AudioSyncAnalyzer,
    topology: TopologyChecker,
}

impl DiagnosisEngine {
    pub fn new(analysis: &AnalysisConfig, topology: &TopologyConfig) -> Self {
        let analysis = analysis.normalized();
        Self {
            intervals: IntervalEngine::new(&analysis),
            audio: AudioSyncAnalyzer::new(&analysis.audio),
            topology: TopologyChecker::new(topology),
        }
    }

    /// Frames are analyzed in timestamp order; equal timestamps keep their
    /// stored order.
    pub fn diagnose(&self, scenario_id: &str, frames: &[Frame]) -> DiagnosisReport {
        let frames = sorted_by_time(frames);
        let markers = extract_markers(&frames);

        let intervals = self.intervals.analyze(&frames, &markers);
        let audio_sync = self.audio.analyze(&frames, &markers);
        let topology = self
            .topology
            .has_contracts()
            .then(|| self.topology.check(&frames));

        let mut report = DiagnosisReport {
            scenario_id: scenario_id.to_string(),
            score: 0.0,
            frame_count: frames.len(),
            intervals,
            audio_sync,
            topology,
            alerts: Vec::new(),
        };
        report.score = score(&report);
        report.alerts = alerts(&report);

        tracing::debug!(
            scenario_id,
            frames = report.frame_count,
            markers = markers.len(),
            intervals = report.intervals.len(),
            score = report.score,
            "scenario diagnosed",
        );
        report
    }
}

fn sorted_by_time(frames: &[Frame]) -> Cow<'_, [Frame]> {
    if frames.windows(2).all(|w| w[0].timestamp <= w[1].timestamp) {
        return Cow::Borrowed(frames);
    }
    let mut owned = frames.to_vec();
    owned.sort_by_key(|f| f.timestamp);
    Cow::Owned(owned)
}

/// `max(0, 100 - fails / max(1, intervals) * 50)`, where fails counts
/// failing intervals and non-passing audio events.
pub fn score(report: &DiagnosisReport) -> f64 {
    let interval_fails = report
        .intervals
        .iter()
        .filter(|d| d.verdict.is_failure())
        .count();
    let audio_fails = report
        .audio_sync
        .sync_events
        .iter()
        .filter(|e| e.verdict != AudioVerdict::Pass)
        .count();
    let fails = (interval_fails + audio_fails) as f64;
    let total = report.intervals.len().max(1) as f64;
    (100.0 - fails / total * 50.0).max(0.0)
}

/// One line per failing interval, non-passing audio event and topology
/// violation episode.
pub fn alerts(report: &DiagnosisReport) -> Vec<String> {
    let mut out = Vec::new();
    for d in report.intervals.iter().filter(|d| d.verdict.is_failure()) {
        out.push(format!("[{}] {}: {}", d.name, d.verdict.as_str(), d.message));
    }
    for e in &report.audio_sync.sync_events {
        if e.verdict == AudioVerdict::Pass {
            continue;
        }
        out.push(format!(
            "[{}] {}: peak {:.3} after {}ms",
            e.marker,
            e.verdict.as_str(),
            e.peak_energy,
            e.latency_ms
        ));
    }
    if let Some(topology) = &report.topology {
        for (c, v) in topology.violations() {
            out.push(format!(
                "[{}] {} violated at frame {} for {} frames: expected [{}], got [{}]",
                c.contract_id,
                c.contract_type.as_str(),
                v.frame_index,
                v.streak_frames,
                v.expected_order.join(", "),
                v.actual_order.join(", "),
            ));
        }
    }
    out
}
