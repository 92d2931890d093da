use std::io::BufRead;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::frame::Source;
use super::metric::Metric;
use super::TelemetryRuntime;

/// One recorded producer sample.
///
/// Either a raw `v` value or a pre-aggregated `agg` metric; a line with both
/// pushes both.
#[derive(Debug, Clone, Deserialize)]
pub struct Sample {
    /// Offset from the start of the recording, milliseconds.
    #[serde(rename = "t", alias = "offsetMs", default)]
    pub offset_ms: u64,
    #[serde(rename = "ch", alias = "channel")]
    pub channel: Source,
    #[serde(rename = "id", alias = "entity")]
    pub entity: String,
    #[serde(rename = "m", alias = "metric")]
    pub metric: String,
    #[serde(rename = "v", alias = "value", default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub agg: Option<Metric>,
}

/// Reads a JSONL sample log. Blank lines are skipped; a malformed line fails
/// the whole read with its line number.
pub fn read_samples(reader: impl BufRead) -> Result<Vec<Sample>> {
    let mut samples = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.context("reading sample log")?;
        if line.trim().is_empty() {
            continue;
        }
        let sample: Sample = serde_json::from_str(&line)
            .with_context(|| format!("parsing sample on line {}", idx + 1))?;
        samples.push(sample);
    }
    samples.sort_by_key(|s| s.offset_ms);
    Ok(samples)
}

/// Pushes one sample into the channel it was recorded on.
pub fn push_sample(runtime: &TelemetryRuntime, sample: &Sample) {
    let channel = match sample.channel {
        Source::Dom => runtime.geometry(),
        Source::Virtual => runtime.logic(),
        Source::Audio => runtime.audio(),
    };
    if let Some(v) = sample.value {
        channel.push(&sample.entity, &sample.metric, v);
    }
    if let Some(agg) = &sample.agg {
        channel.push_aggregated(&sample.entity, &sample.metric, agg);
    }
}

/// Replays `samples` at recorded pace, scaled by `speed`. Returns the number
/// of samples pushed; stops early when `ctx` is cancelled.
pub async fn replay(
    runtime: &TelemetryRuntime,
    samples: &[Sample],
    speed: f64,
    ctx: &CancellationToken,
) -> usize {
    let speed = if speed.is_finite() && speed > 0.0 {
        speed
    } else {
        1.0
    };
    let start = tokio::time::Instant::now();
    let mut pushed = 0;

    for sample in samples {
        let due = start + Duration::from_secs_f64(sample.offset_ms as f64 / 1000.0 / speed);
        tokio::select! {
            _ = ctx.cancelled() => break,
            _ = tokio::time::sleep_until(due) => {}
        }
        push_sample(runtime, sample);
        pushed += 1;
    }

    tracing::debug!(pushed, total = samples.len(), "replay finished");
    pushed
}
