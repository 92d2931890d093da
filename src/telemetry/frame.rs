use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Deserializer, Serialize};

use super::metric::Metric;

/// Producer that contributed data to a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Dom,
    Virtual,
    Audio,
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dom => "dom",
            Self::Virtual => "virtual",
            Self::Audio => "audio",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "dom" => Some(Self::Dom),
            "virtual" => Some(Self::Virtual),
            "audio" => Some(Self::Audio),
            _ => None,
        }
    }
}

/// Per-entity data within one frame.
///
/// `weight`/`rank` come from geometry observation; `attrs` carries logical,
/// audio and UI physics signals keyed by metric name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementRecord {
    #[serde(
        rename = "w",
        alias = "weight",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub weight: Option<Metric>,
    #[serde(
        rename = "r",
        alias = "rank",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub rank: Option<Metric>,
    #[serde(
        rename = "a",
        alias = "attrs",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub attrs: BTreeMap<String, Metric>,
}

impl ElementRecord {
    pub fn is_empty(&self) -> bool {
        self.weight.is_none() && self.rank.is_none() && self.attrs.is_empty()
    }

    /// Merges `other` into this record. Geometry slots from `other` win when
    /// set; attrs are combined key by key.
    pub fn merge(&mut self, other: ElementRecord) {
        if other.weight.is_some() {
            self.weight = other.weight;
        }
        if other.rank.is_some() {
            self.rank = other.rank;
        }
        self.attrs.extend(other.attrs);
    }

    /// Metrics that describe how the entity moves: weight plus every attr.
    /// Rank is an ordering, not a motion signal, and is left out.
    pub fn motion_metrics(&self) -> impl Iterator<Item = &Metric> {
        self.weight.iter().chain(self.attrs.values())
    }

    pub fn attr(&self, name: &str) -> Option<&Metric> {
        self.attrs.get(name)
    }
}

/// One assembled telemetry window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Window start, unix milliseconds.
    #[serde(rename = "ts", alias = "timestamp")]
    pub timestamp: i64,
    /// Window length in milliseconds.
    #[serde(rename = "dur", alias = "durationMs", default)]
    pub duration_ms: u64,
    #[serde(
        default,
        deserialize_with = "deserialize_sources",
        skip_serializing_if = "BTreeSet::is_empty"
    )]
    pub sources: BTreeSet<Source>,
    pub data: BTreeMap<String, ElementRecord>,
}

impl Frame {
    pub fn new(timestamp: i64, duration_ms: u64) -> Self {
        Self {
            timestamp,
            duration_ms,
            sources: BTreeSet::new(),
            data: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn entity(&self, id: &str) -> Option<&ElementRecord> {
        self.data.get(id)
    }

    /// Builder helper: sets the weight metric of `id`.
    pub fn with_weight(mut self, id: &str, metric: Metric) -> Self {
        self.data.entry(id.to_string()).or_default().weight = Some(metric);
        self
    }

    /// Builder helper: sets the rank metric of `id`.
    pub fn with_rank(mut self, id: &str, metric: Metric) -> Self {
        self.data.entry(id.to_string()).or_default().rank = Some(metric);
        self
    }

    /// Builder helper: sets attr `name` of `id`.
    pub fn with_attr(mut self, id: &str, name: &str, metric: Metric) -> Self {
        self.data
            .entry(id.to_string())
            .or_default()
            .attrs
            .insert(name.to_string(), metric);
        self
    }

    /// Encodes the frame as one JSON line (no trailing newline).
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}

/// Unknown source tags are dropped so newer producers stay compatible.
fn deserialize_sources<'de, D>(deserializer: D) -> Result<BTreeSet<Source>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<Vec<String>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .iter()
        .filter_map(|s| Source::parse(s))
        .collect())
}
