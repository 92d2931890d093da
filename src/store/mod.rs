//! Append-only frame lists with per-key retention.

pub mod jsonl;
pub mod memory;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use thiserror::Error;

use crate::config::{StoreBackend, StoreConfig};
use crate::telemetry::frame::Frame;

pub use jsonl::JsonlStore;
pub use memory::MemoryStore;

/// Errors surfaced by a frame store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store i/o: {0}")]
    Io(std::io::Error),
    #[error("frame codec: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<std::io::Error> for StoreError {
    /// Access and timeout failures are reported as `Unavailable`, since a
    /// later retry may succeed.
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::PermissionDenied | ErrorKind::TimedOut | ErrorKind::WouldBlock => {
                Self::Unavailable(e.to_string())
            }
            _ => Self::Io(e),
        }
    }
}

/// Addresses one frame list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StoreKey {
    /// Raw stream of every frame a user ingested.
    Stream { user: String },
    /// Frames ingested under one scenario.
    Scenario { user: String, scenario: String },
}

impl StoreKey {
    pub fn stream(user: impl Into<String>) -> Self {
        Self::Stream { user: user.into() }
    }

    pub fn scenario(user: impl Into<String>, scenario: impl Into<String>) -> Self {
        Self::Scenario {
            user: user.into(),
            scenario: scenario.into(),
        }
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stream { user } => write!(f, "telemetry/stream:{user}"),
            Self::Scenario { user, scenario } => {
                write!(f, "telemetry/scenario:{user}:{scenario}")
            }
        }
    }
}

/// Time-to-live per key kind. Every append restarts the key's TTL.
#[derive(Debug, Clone, Copy)]
pub struct Retention {
    pub stream_ttl: Duration,
    pub scenario_ttl: Duration,
}

impl Retention {
    pub fn ttl_for(&self, key: &StoreKey) -> Duration {
        match key {
            StoreKey::Stream { .. } => self.stream_ttl,
            StoreKey::Scenario { .. } => self.scenario_ttl,
        }
    }
}

impl From<&StoreConfig> for Retention {
    fn from(cfg: &StoreConfig) -> Self {
        Self {
            stream_ttl: cfg.stream_ttl,
            scenario_ttl: cfg.scenario_ttl,
        }
    }
}

impl Default for Retention {
    fn default() -> Self {
        Self::from(&StoreConfig::default())
    }
}

/// Append-only ordered frame lists.
pub trait FrameStore: Send + Sync {
    /// Appends a frame to the list at `key`, refreshing its TTL.
    ///
    /// Appending a frame identical to the list's last frame is a no-op, so a
    /// write retried after a partial failure is not stored twice.
    fn append(&self, key: &StoreKey, frame: &Frame) -> Result<(), StoreError>;

    /// Returns every live frame at `key` in append order. An unknown or
    /// expired key yields an empty list.
    fn range(&self, key: &StoreKey) -> Result<Vec<Frame>, StoreError>;
}

/// Opens the configured store backend.
pub fn open(cfg: &StoreConfig) -> Result<Arc<dyn FrameStore>> {
    let retention = Retention::from(cfg);
    match cfg.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new(retention))),
        StoreBackend::Jsonl => {
            let dir = cfg
                .directory
                .as_deref()
                .context("store.directory is required for the jsonl backend")?;
            let store = JsonlStore::open(dir, retention)
                .with_context(|| format!("opening jsonl store at {}", dir.display()))?;
            Ok(Arc::new(store))
        }
    }
}
