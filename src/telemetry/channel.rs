use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use super::metric::Metric;

/// Harvested snapshot: entity id -> metric name -> metric.
pub type Harvest = BTreeMap<String, BTreeMap<String, Metric>>;

/// Composite buffer key: hierarchical entity path plus metric name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SignalKey {
    pub entity_id: String,
    pub metric_name: String,
}

impl SignalKey {
    pub fn new(entity_id: impl Into<String>, metric_name: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            metric_name: metric_name.into(),
        }
    }
}

/// Per-key buffer state. A slot only moves Empty -> Accumulating on write
/// and Accumulating -> Empty on harvest.
#[derive(Debug, Clone, Copy, PartialEq)]
enum SlotState {
    Empty,
    Accumulating(Metric),
}

#[derive(Debug)]
struct Slot {
    state: SlotState,
    last_write: Instant,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: SlotState::Empty,
            last_write: Instant::now(),
        }
    }

    fn record(&mut self, value: f64) {
        match &mut self.state {
            SlotState::Empty => {
                let m = Metric::from_value(value);
                if !m.is_empty() {
                    self.state = SlotState::Accumulating(m);
                }
            }
            SlotState::Accumulating(m) => m.update(value),
        }
        self.last_write = Instant::now();
    }

    fn merge(&mut self, incoming: &Metric) {
        match &mut self.state {
            SlotState::Empty => {
                if !incoming.is_empty() {
                    self.state = SlotState::Accumulating(*incoming);
                }
            }
            SlotState::Accumulating(m) => m.merge_aggregated(incoming),
        }
        self.last_write = Instant::now();
    }

    /// Returns the accumulated metric and resets the slot to Empty.
    fn take(&mut self) -> Option<Metric> {
        match std::mem::replace(&mut self.state, SlotState::Empty) {
            SlotState::Empty => None,
            SlotState::Accumulating(m) => Some(m),
        }
    }
}

/// Concurrent table of `(entity, metric) -> Metric` buffers.
///
/// Uses `DashMap` so producers writing to different keys never contend on
/// a global lock. Harvest holds each entry's shard lock across read and
/// reset, so a concurrent push to the same key lands either in this
/// harvest or in the next one, never nowhere.
#[derive(Debug, Default)]
pub struct SignalChannel {
    slots: DashMap<SignalKey, Slot>,
}

impl SignalChannel {
    pub fn new() -> Self {
        Self {
            slots: DashMap::with_capacity(64),
        }
    }

    /// Records a raw scalar sample.
    pub fn push(&self, entity_id: &str, metric_name: &str, value: f64) {
        self.slots
            .entry(SignalKey::new(entity_id, metric_name))
            .or_insert_with(Slot::new)
            .record(value);
    }

    /// Merges a metric that the producer already aggregated.
    pub fn push_aggregated(&self, entity_id: &str, metric_name: &str, metric: &Metric) {
        self.slots
            .entry(SignalKey::new(entity_id, metric_name))
            .or_insert_with(Slot::new)
            .merge(metric);
    }

    /// Drains every non-empty buffer, resetting it to empty.
    ///
    /// Slots are kept (empty) so the next window reuses them; `prune_stale`
    /// removes the ones that stop receiving writes.
    pub fn harvest(&self) -> Harvest {
        let mut out = Harvest::new();
        for mut entry in self.slots.iter_mut() {
            if let Some(metric) = entry.value_mut().take() {
                let key = entry.key();
                out.entry(key.entity_id.clone())
                    .or_default()
                    .insert(key.metric_name.clone(), metric);
            }
        }
        out
    }

    /// Removes empty slots that have not been written for `threshold`.
    /// Returns the number of removed slots.
    ///
    /// Slots still holding unharvested data are never pruned.
    pub fn prune_stale(&self, threshold: Duration) -> usize {
        let Some(cutoff) = Instant::now().checked_sub(threshold) else {
            return 0;
        };
        let before = self.slots.len();
        self.slots
            .retain(|_, slot| slot.state != SlotState::Empty || slot.last_write > cutoff);
        before.saturating_sub(self.slots.len())
    }

    /// Number of tracked keys, empty or not.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
