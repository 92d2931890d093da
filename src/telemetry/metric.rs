use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};

/// Open/high/low/close values of a non-empty metric.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ohlc {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

/// OHLC ("K-line") summary of one scalar signal over a sampling window.
///
/// A metric is either empty (no samples) or carries all four values with
/// `low <= open, close <= high`. There is no sentinel value for "empty";
/// the state lives in the `Option`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "MetricIn", into = "MetricOut")]
pub struct Metric {
    bar: Option<Ohlc>,
    sample_count: u32,
}

impl Metric {
    /// Creates an empty metric.
    pub const fn empty() -> Self {
        Self {
            bar: None,
            sample_count: 0,
        }
    }

    /// Creates a metric from a single sample.
    pub fn from_value(value: f64) -> Self {
        let mut m = Self::empty();
        m.update(value);
        m
    }

    /// Creates a metric from pre-aggregated values.
    ///
    /// `high`/`low` are widened to cover `open` and `close` so the ordering
    /// invariant holds for any input. Non-finite input yields an empty metric.
    pub fn from_ohlc(open: f64, high: f64, low: f64, close: f64, sample_count: u32) -> Self {
        if ![open, high, low, close].iter().all(|v| v.is_finite()) {
            return Self::empty();
        }
        let high = high.max(open).max(close).max(low);
        let low = low.min(open).min(close).min(high);
        Self {
            bar: Some(Ohlc {
                open,
                high,
                low,
                close,
            }),
            sample_count: sample_count.max(1),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bar.is_none()
    }

    pub fn ohlc(&self) -> Option<Ohlc> {
        self.bar
    }

    pub fn open(&self) -> Option<f64> {
        self.bar.map(|b| b.open)
    }

    pub fn high(&self) -> Option<f64> {
        self.bar.map(|b| b.high)
    }

    pub fn low(&self) -> Option<f64> {
        self.bar.map(|b| b.low)
    }

    pub fn close(&self) -> Option<f64> {
        self.bar.map(|b| b.close)
    }

    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }

    /// Folds one scalar sample into the metric.
    ///
    /// Non-finite samples are dropped so a single bad reading cannot break
    /// the ordering invariant.
    pub fn update(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        match &mut self.bar {
            None => {
                self.bar = Some(Ohlc {
                    open: value,
                    high: value,
                    low: value,
                    close: value,
                });
            }
            Some(bar) => {
                bar.close = value;
                bar.high = bar.high.max(value);
                bar.low = bar.low.min(value);
            }
        }
        self.sample_count = self.sample_count.saturating_add(1);
    }

    /// Merges a metric that was already aggregated upstream.
    ///
    /// Keeps the incoming high/low range instead of treating the incoming
    /// metric as a single point. `open` stays, `close` is taken from `incoming`.
    pub fn merge_aggregated(&mut self, incoming: &Metric) {
        let Some(inc) = incoming.bar else {
            return;
        };
        match &mut self.bar {
            None => *self = *incoming,
            Some(bar) => {
                bar.low = bar.low.min(inc.low);
                bar.high = bar.high.max(inc.high);
                bar.close = inc.close;
                self.sample_count = self.sample_count.saturating_add(incoming.sample_count);
            }
        }
    }

    /// How much the signal moved in the window: `(high - low) + |close - open|`.
    pub fn activity(&self) -> f64 {
        match self.bar {
            Some(b) => (b.high - b.low) + (b.close - b.open).abs(),
            None => 0.0,
        }
    }
}

/// Accepts any value in a numeric slot; anything that is not a number
/// (null, strings, objects) is treated as missing.
#[derive(Deserialize)]
#[serde(untagged)]
enum Lenient<T> {
    Value(T),
    #[allow(dead_code)]
    Malformed(IgnoredAny),
}

impl<T> Lenient<T> {
    fn into_option(self) -> Option<T> {
        match self {
            Self::Value(v) => Some(v),
            Self::Malformed(_) => None,
        }
    }
}

#[derive(Deserialize)]
struct MetricIn {
    #[serde(default)]
    o: Option<Lenient<f64>>,
    #[serde(default)]
    h: Option<Lenient<f64>>,
    #[serde(default)]
    l: Option<Lenient<f64>>,
    #[serde(default)]
    c: Option<Lenient<f64>>,
    #[serde(default)]
    cnt: Option<Lenient<u32>>,
}

impl From<MetricIn> for Metric {
    fn from(wire: MetricIn) -> Self {
        let get = |v: Option<Lenient<f64>>| v.and_then(Lenient::into_option);
        let cnt = wire.cnt.and_then(Lenient::into_option).unwrap_or(1);
        match (get(wire.o), get(wire.h), get(wire.l), get(wire.c)) {
            (Some(o), Some(h), Some(l), Some(c)) => Metric::from_ohlc(o, h, l, c, cnt),
            _ => Metric::empty(),
        }
    }
}

#[derive(Serialize)]
struct MetricOut {
    #[serde(skip_serializing_if = "Option::is_none")]
    o: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    h: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    l: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    c: Option<f64>,
    cnt: u32,
}

impl From<Metric> for MetricOut {
    fn from(m: Metric) -> Self {
        Self {
            o: m.open(),
            h: m.high(),
            l: m.low(),
            c: m.close(),
            cnt: m.sample_count,
        }
    }
}
