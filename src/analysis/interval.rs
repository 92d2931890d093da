use std::collections::BTreeSet;

use serde::Serialize;

use crate::config::AnalysisConfig;
use crate::telemetry::frame::{ElementRecord, Frame};

use super::markers::Marker;
use super::stats::{pearson, population_variance};

/// Classification of one marker-bounded interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    /// Input and output moved together.
    Healthy,
    /// Input moved, output stayed frozen.
    NoResponse,
    /// Both moved without correlation.
    Chaotic,
    /// Output moved without input.
    Autonomous,
    /// Neither moved.
    Idle,
    /// Too few frames to tell.
    InsufficientData,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "HEALTHY",
            Self::NoResponse => "NO_RESPONSE",
            Self::Chaotic => "CHAOTIC",
            Self::Autonomous => "AUTONOMOUS",
            Self::Idle => "IDLE",
            Self::InsufficientData => "INSUFFICIENT_DATA",
        }
    }

    /// Verdicts that lower the health score and raise an alert.
    pub fn is_failure(self) -> bool {
        matches!(self, Self::NoResponse | Self::Chaotic)
    }

    fn message(self) -> &'static str {
        match self {
            Self::Healthy => "Output follows input",
            Self::NoResponse => "Deadlock detected: Input active but Output frozen",
            Self::Chaotic => "Logic fault suspected: Input and Output active but uncorrelated",
            Self::Autonomous => "Animation or Timer active",
            Self::Idle => "No activity on input or output",
            Self::InsufficientData => "Not enough frames in interval",
        }
    }
}

/// Read-only result for one interval.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntervalDiagnosis {
    /// `"<start marker> -> <end marker>"`.
    pub name: String,
    pub start_ts: i64,
    pub duration_ms: i64,
    pub frame_count: usize,
    pub input_variance: f64,
    pub output_variance: f64,
    pub correlation: f64,
    pub verdict: Verdict,
    pub confidence: f64,
    pub message: String,
}

/// Segments a frame timeline by markers and classifies each interval by
/// how its input and output activity relate.
#[derive(Debug, Clone)]
pub struct IntervalEngine {
    cfg: AnalysisConfig,
}

impl IntervalEngine {
    /// The configuration is normalized so classification never divides by zero.
    pub fn new(cfg: &AnalysisConfig) -> Self {
        Self {
            cfg: cfg.normalized(),
        }
    }

    /// Diagnoses every adjacent marker pair at least `min_interval_ms` apart.
    pub fn analyze(&self, frames: &[Frame], markers: &[Marker]) -> Vec<IntervalDiagnosis> {
        markers
            .windows(2)
            .filter(|pair| pair[1].timestamp - pair[0].timestamp >= self.cfg.min_interval_ms)
            .map(|pair| self.diagnose(frames, &pair[0], &pair[1]))
            .collect()
    }

    fn diagnose(&self, frames: &[Frame], start: &Marker, end: &Marker) -> IntervalDiagnosis {
        let slice: Vec<&Frame> = frames
            .iter()
            .filter(|f| f.timestamp >= start.timestamp && f.timestamp <= end.timestamp)
            .collect();

        let mut d = IntervalDiagnosis {
            name: format!("{} -> {}", start.name, end.name),
            start_ts: start.timestamp,
            duration_ms: end.timestamp - start.timestamp,
            frame_count: slice.len(),
            input_variance: 0.0,
            output_variance: 0.0,
            correlation: 0.0,
            verdict: Verdict::InsufficientData,
            confidence: 0.0,
            message: String::new(),
        };

        if slice.len() < self.cfg.min_interval_frames {
            d.message = format!(
                "{}: {} frame(s), need {}",
                Verdict::InsufficientData.message(),
                slice.len(),
                self.cfg.min_interval_frames
            );
            return d;
        }

        let input = self.input_series(&slice);
        let output = self.output_series(&slice);
        d.input_variance = population_variance(&input);
        d.output_variance = population_variance(&output);
        d.correlation = pearson(&input, &output);

        let (verdict, confidence) =
            self.classify(d.input_variance, d.output_variance, d.correlation);
        d.verdict = verdict;
        d.confidence = confidence;
        d.message = verdict.message().to_string();
        d
    }

    /// Decision table over input variance, output variance and correlation.
    /// Returns the verdict and a confidence in [0.5, 0.99].
    pub fn classify(&self, input_var: f64, output_var: f64, correlation: f64) -> (Verdict, f64) {
        let in_thr = self.cfg.input_variance_threshold;
        let out_thr = self.cfg.output_variance_threshold;
        let corr_thr = self.cfg.correlation_threshold;

        let has_input = input_var > in_thr;
        let has_output = output_var > out_thr;
        let corr = correlation.abs();

        let (verdict, confidence) = match (has_input, has_output) {
            (false, false) => (
                Verdict::Idle,
                0.5 + 0.49 * quietness(input_var, in_thr) * quietness(output_var, out_thr),
            ),
            (true, false) => (
                Verdict::NoResponse,
                0.5 + 0.49 * strength(input_var, in_thr) * quietness(output_var, out_thr),
            ),
            (false, true) => (
                Verdict::Autonomous,
                0.5 + 0.49 * quietness(input_var, in_thr) * strength(output_var, out_thr),
            ),
            (true, true) if corr > corr_thr => (Verdict::Healthy, (0.5 + corr).min(0.99)),
            (true, true) => (Verdict::Chaotic, 0.5 + 0.49 * (1.0 - corr / corr_thr)),
        };
        (verdict, confidence.clamp(0.0, 0.99))
    }

    fn input_series(&self, slice: &[&Frame]) -> Vec<f64> {
        let ids: BTreeSet<&str> = self.cfg.input_entity_ids.iter().map(String::as_str).collect();
        slice.iter().map(|f| mean_activity(f, &ids)).collect()
    }

    fn output_series(&self, slice: &[&Frame]) -> Vec<f64> {
        let ids: BTreeSet<&str> = if self.cfg.output_entity_ids.is_empty() {
            slice
                .iter()
                .flat_map(|f| f.data.keys())
                .map(String::as_str)
                .filter(|id| {
                    !id.starts_with("__") && !self.cfg.input_entity_ids.iter().any(|i| i == id)
                })
                .collect()
        } else {
            self.cfg
                .output_entity_ids
                .iter()
                .map(String::as_str)
                .collect()
        };
        slice.iter().map(|f| mean_activity(f, &ids)).collect()
    }
}

/// Mean activity over the motion metrics of `ids` in one frame; 0 if none.
fn mean_activity(frame: &Frame, ids: &BTreeSet<&str>) -> f64 {
    let (sum, count) = ids
        .iter()
        .filter_map(|id| frame.entity(id))
        .flat_map(ElementRecord::motion_metrics)
        .fold((0.0, 0usize), |(s, c), m| (s + m.activity(), c + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

/// How far above `thr` a variance sits, in (0, 1].
fn strength(v: f64, thr: f64) -> f64 {
    if v <= 0.0 {
        return 0.0;
    }
    (1.0 - thr / v).clamp(0.0, 1.0)
}

/// How far below `thr` a variance sits, in [0, 1].
fn quietness(v: f64, thr: f64) -> f64 {
    (1.0 - v / thr).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::markers::{extract_markers, MARKERS_ENTITY};
    use crate::telemetry::metric::Metric;

    fn engine() -> IntervalEngine {
        IntervalEngine::new(&AnalysisConfig::default())
    }

    fn marker(name: &str, ts: i64) -> Marker {
        Marker {
            name: name.to_string(),
            timestamp: ts,
        }
    }

    /// A metric whose activity equals `a`: range `a`, no open/close drift.
    fn moving(a: f64) -> Metric {
        Metric::from_ohlc(0.0, a, 0.0, 0.0, 2)
    }

    fn timeline(input: &[f64], output: &[f64]) -> Vec<Frame> {
        input
            .iter()
            .zip(output)
            .enumerate()
            .map(|(i, (a, b))| {
                Frame::new(1000 + i as i64 * 100, 100)
                    .with_attr("__cursor__", "x", moving(*a))
                    .with_weight("ship", moving(*b))
            })
            .collect()
    }

    fn markers_around(frames: &[Frame]) -> Vec<Marker> {
        let first = frames.first().map(|f| f.timestamp).unwrap_or(0);
        let last = frames.last().map(|f| f.timestamp).unwrap_or(0);
        vec![marker("START", first), marker("END", last)]
    }

    #[test]
    fn test_no_response_scenario() {
        let frames = timeline(&[0.0, 5.0, 10.0, 15.0, 20.0], &[1.0, 1.0, 1.0, 1.0, 1.0]);
        let out = engine().analyze(&frames, &markers_around(&frames));
        assert_eq!(out.len(), 1);
        let d = &out[0];
        assert_eq!(d.verdict, Verdict::NoResponse);
        assert_eq!(d.input_variance, 50.0);
        assert_eq!(d.output_variance, 0.0);
        assert_eq!(d.correlation, 0.0);
        assert_eq!(d.name, "START -> END");
        assert_eq!(d.message, "Deadlock detected: Input active but Output frozen");
        assert!(d.confidence > 0.9);
    }

    #[test]
    fn test_healthy_scenario() {
        let frames = timeline(&[0.0, 1.0, 2.0, 3.0, 4.0], &[0.0, 2.0, 4.0, 6.0, 8.0]);
        let d = &engine().analyze(&frames, &markers_around(&frames))[0];
        assert_eq!(d.verdict, Verdict::Healthy);
        assert!((d.correlation - 1.0).abs() < 1e-9);
        assert_eq!(d.confidence, 0.99);
    }

    #[test]
    fn test_chaotic_scenario() {
        // Orthogonal around the mean: correlation 0.
        let frames = timeline(&[0.0, 2.0, 0.0, 2.0], &[0.0, 0.0, 2.0, 2.0]);
        let d = &engine().analyze(&frames, &markers_around(&frames))[0];
        assert_eq!(d.verdict, Verdict::Chaotic);
        assert!(d.correlation.abs() < 1e-9);
        assert!((d.confidence - 0.99).abs() < 1e-9);
    }

    #[test]
    fn test_decision_table_cells() {
        let e = engine();
        assert_eq!(e.classify(0.0, 0.0, 0.0).0, Verdict::Idle);
        assert_eq!(e.classify(1.0, 0.0, 0.0).0, Verdict::NoResponse);
        assert_eq!(e.classify(0.0, 1.0, 0.0).0, Verdict::Autonomous);
        assert_eq!(e.classify(1.0, 1.0, 0.9).0, Verdict::Healthy);
        assert_eq!(e.classify(1.0, 1.0, -0.9).0, Verdict::Healthy);
        assert_eq!(e.classify(1.0, 1.0, 0.1).0, Verdict::Chaotic);
        // Thresholds are strict.
        assert_eq!(e.classify(0.01, 0.001, 0.0).0, Verdict::Idle);
    }

    #[test]
    fn test_confidence_in_range() {
        let e = engine();
        for (i, o, c) in [
            (0.0, 0.0, 0.0),
            (0.005, 0.0005, 0.0),
            (100.0, 0.0, 0.0),
            (0.0, 100.0, 0.0),
            (1.0, 1.0, 0.36),
            (1.0, 1.0, 0.34),
        ] {
            let (_, conf) = e.classify(i, o, c);
            assert!((0.5..=0.99).contains(&conf), "{i} {o} {c} -> {conf}");
        }
    }

    #[test]
    fn test_short_interval_skipped() {
        let frames = timeline(&[0.0, 1.0], &[0.0, 1.0]);
        let out = engine().analyze(&frames, &[marker("A", 1000), marker("B", 1049)]);
        assert!(out.is_empty());
    }

    #[test]
    fn test_insufficient_data() {
        let frames = timeline(&[0.0, 1.0, 2.0], &[0.0, 1.0, 2.0]);
        let out = engine().analyze(&frames, &[marker("A", 1150), marker("B", 1249)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].verdict, Verdict::InsufficientData);
        assert_eq!(out[0].confidence, 0.0);
        assert_eq!(out[0].frame_count, 1);
    }

    #[test]
    fn test_configured_output_ids() {
        let frames: Vec<Frame> = [0.0, 1.0, 2.0, 3.0]
            .iter()
            .enumerate()
            .map(|(i, a)| {
                Frame::new(i as i64 * 100, 100)
                    .with_attr("__input__", "key", moving(*a))
                    .with_weight("ship", moving(*a))
                    .with_weight("noise", moving(0.0))
            })
            .collect();
        let cfg = AnalysisConfig {
            output_entity_ids: vec!["noise".to_string()],
            ..Default::default()
        };
        let d = &IntervalEngine::new(&cfg).analyze(&frames, &markers_around(&frames))[0];
        assert_eq!(d.verdict, Verdict::NoResponse);
    }

    #[test]
    fn test_auto_output_excludes_reserved_and_input() {
        let frames: Vec<Frame> = [0.0, 1.0, 2.0, 3.0]
            .iter()
            .enumerate()
            .map(|(i, a)| {
                Frame::new(i as i64 * 100, 100)
                    .with_attr("__cursor__", "x", moving(*a))
                    .with_attr("__system__/audio", "peak_level", moving(*a))
                    .with_attr(MARKERS_ENTITY, "m", Metric::from_value(1.0))
            })
            .collect();
        let d = &engine().analyze(&frames, &markers_around(&frames))[0];
        assert_eq!(d.output_variance, 0.0);
        assert_eq!(d.verdict, Verdict::NoResponse);
    }

    #[test]
    fn test_rank_is_not_motion() {
        let frames: Vec<Frame> = [1.0, 5.0, 1.0, 5.0]
            .iter()
            .enumerate()
            .map(|(i, r)| {
                Frame::new(i as i64 * 100, 100)
                    .with_attr("__cursor__", "x", moving(0.0))
                    .with_rank("card", moving(*r))
            })
            .collect();
        let d = &engine().analyze(&frames, &markers_around(&frames))[0];
        assert_eq!(d.verdict, Verdict::Idle);
    }

    #[test]
    fn test_markers_drive_intervals() {
        let mut frames = timeline(&[0.0, 5.0, 10.0, 15.0, 20.0], &[1.0; 5]);
        frames[0] = frames[0]
            .clone()
            .with_attr(MARKERS_ENTITY, "CLICK_START", Metric::from_value(1000.0));
        frames[4] = frames[4]
            .clone()
            .with_attr(MARKERS_ENTITY, "CLICK_END", Metric::from_value(1400.0));
        let markers = extract_markers(&frames);
        let out = engine().analyze(&frames, &markers);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].name, "CLICK_START -> CLICK_END");
        assert_eq!(out[0].duration_ms, 400);
    }
}
