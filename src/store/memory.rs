use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{FrameStore, Retention, StoreError, StoreKey};
use crate::telemetry::frame::Frame;

#[derive(Debug)]
struct Entry {
    frames: Vec<Frame>,
    expires_at: Instant,
}

/// Upper bound on the time between expiry sweeps.
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct Entries {
    by_key: HashMap<StoreKey, Entry>,
    next_sweep: Instant,
}

/// In-process frame store. Contents are lost on restart.
///
/// Expired keys are dropped when touched and by a sweep that runs on
/// append at most once per the shorter TTL (capped at a minute).
#[derive(Debug)]
pub struct MemoryStore {
    retention: Retention,
    sweep_interval: Duration,
    entries: Mutex<Entries>,
}

impl MemoryStore {
    pub fn new(retention: Retention) -> Self {
        let sweep_interval = retention
            .stream_ttl
            .min(retention.scenario_ttl)
            .min(MAX_SWEEP_INTERVAL);
        Self {
            retention,
            sweep_interval,
            entries: Mutex::new(Entries {
                by_key: HashMap::new(),
                next_sweep: Instant::now() + sweep_interval,
            }),
        }
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .by_key
            .values()
            .filter(|e| e.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Retention::default())
    }
}

impl FrameStore for MemoryStore {
    fn append(&self, key: &StoreKey, frame: &Frame) -> Result<(), StoreError> {
        let now = Instant::now();
        let expires_at = now + self.retention.ttl_for(key);
        let mut entries = self.entries.lock();
        if now >= entries.next_sweep {
            let before = entries.by_key.len();
            entries.by_key.retain(|_, e| e.expires_at > now);
            entries.next_sweep = now + self.sweep_interval;
            let evicted = before - entries.by_key.len();
            if evicted > 0 {
                tracing::debug!(evicted, "swept expired frame lists");
            }
        }

        let entry = entries.by_key.entry(key.clone()).or_insert_with(|| Entry {
            frames: Vec::new(),
            expires_at,
        });
        if entry.expires_at <= now {
            entry.frames.clear();
        }
        entry.expires_at = expires_at;
        // A retried append of the current tail is already stored.
        if entry.frames.last() != Some(frame) {
            entry.frames.push(frame.clone());
        }
        Ok(())
    }

    fn range(&self, key: &StoreKey) -> Result<Vec<Frame>, StoreError> {
        let mut entries = self.entries.lock();
        match entries.by_key.get(key) {
            Some(e) if e.expires_at > Instant::now() => Ok(e.frames.clone()),
            Some(_) => {
                entries.by_key.remove(key);
                Ok(Vec::new())
            }
            None => Ok(Vec::new()),
        }
    }
}
