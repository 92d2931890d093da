use serde::Serialize;

use crate::config::AudioConfig;
use crate::telemetry::frame::Frame;

use super::markers::Marker;

/// Audio-energy attrs, in order of preference.
const PEAK_ATTRS: [&str; 2] = ["peak_level", "energy_rms"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AudioVerdict {
    Pass,
    FailSilent,
    FailLag,
}

impl AudioVerdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::FailSilent => "FAIL_SILENT",
            Self::FailLag => "FAIL_LAG",
        }
    }
}

/// Sound response to one critical marker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AvSyncEvent {
    pub marker: String,
    pub marker_ts: i64,
    /// Peak time minus marker time; 0 when the window held no sample.
    pub latency_ms: i64,
    pub peak_energy: f64,
    pub is_silent: bool,
    pub verdict: AudioVerdict,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AudioSyncReport {
    pub sync_events: Vec<AvSyncEvent>,
}

#[derive(Debug, Clone, Copy)]
struct AudioSample {
    ts: i64,
    peak: f64,
}

/// Checks that markers naming a critical action are followed by sound.
#[derive(Debug, Clone)]
pub struct AudioSyncAnalyzer {
    cfg: AudioConfig,
    keywords: Vec<String>,
}

impl AudioSyncAnalyzer {
    pub fn new(cfg: &AudioConfig) -> Self {
        Self {
            keywords: cfg.keywords.iter().map(|k| k.to_uppercase()).collect(),
            cfg: cfg.clone(),
        }
    }

    /// Frames without any audio entity yield an empty report.
    pub fn analyze(&self, frames: &[Frame], markers: &[Marker]) -> AudioSyncReport {
        let stream = self.audio_stream(frames);
        if stream.is_empty() {
            return AudioSyncReport::default();
        }

        let sync_events = markers
            .iter()
            .filter(|m| self.is_critical(&m.name))
            .map(|m| self.check_marker(&stream, m))
            .collect();
        AudioSyncReport { sync_events }
    }

    fn is_critical(&self, name: &str) -> bool {
        let upper = name.to_uppercase();
        self.keywords.iter().any(|k| upper.contains(k.as_str()))
    }

    fn audio_stream(&self, frames: &[Frame]) -> Vec<AudioSample> {
        frames
            .iter()
            .filter_map(|f| {
                let rec = f.entity(&self.cfg.entity_id)?;
                let metric = PEAK_ATTRS.iter().find_map(|name| rec.attr(name))?;
                Some(AudioSample {
                    ts: f.timestamp,
                    peak: metric.high()?,
                })
            })
            .collect()
    }

    fn check_marker(&self, stream: &[AudioSample], marker: &Marker) -> AvSyncEvent {
        let window_end = marker.timestamp.saturating_add(self.cfg.search_window_ms);

        // First sample wins on ties.
        let peak = stream
            .iter()
            .filter(|s| s.ts >= marker.timestamp && s.ts <= window_end)
            .fold(None::<AudioSample>, |best, s| match best {
                Some(b) if b.peak >= s.peak => Some(b),
                _ => Some(*s),
            });

        let (latency_ms, peak_energy) = match peak {
            Some(p) => (p.ts - marker.timestamp, p.peak),
            None => (0, 0.0),
        };
        let is_silent = peak_energy < self.cfg.silence_threshold;
        let verdict = if is_silent {
            AudioVerdict::FailSilent
        } else if latency_ms > self.cfg.lag_threshold_ms {
            AudioVerdict::FailLag
        } else {
            AudioVerdict::Pass
        };

        AvSyncEvent {
            marker: marker.name.clone(),
            marker_ts: marker.timestamp,
            latency_ms,
            peak_energy,
            is_silent,
            verdict,
        }
    }
}
