use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::store::{FrameStore, StoreKey};

use super::frame::Frame;
use super::http::HttpExporter;

/// Appends emitted frames to a frame store under a fixed set of keys.
///
/// A failure on one key fails the export even if earlier keys took the
/// frame; the store skips those keys' re-append when the frame is retried.
#[derive(Clone)]
pub struct StoreExporter {
    store: Arc<dyn FrameStore>,
    keys: Vec<StoreKey>,
}

impl StoreExporter {
    /// Writes to the user's raw stream and, if given, the scenario index.
    pub fn new(store: Arc<dyn FrameStore>, user: &str, scenario: Option<&str>) -> Self {
        let mut keys = vec![StoreKey::stream(user)];
        if let Some(scenario) = scenario {
            keys.push(StoreKey::scenario(user, scenario));
        }
        Self { store, keys }
    }

    pub fn name(&self) -> &str {
        "store"
    }

    pub fn export(&self, frame: &Frame) -> Result<()> {
        for key in &self.keys {
            self.store
                .append(key, frame)
                .with_context(|| format!("appending frame to {key}"))?;
        }
        Ok(())
    }
}

/// Dispatches assembled frames to a store or an HTTP endpoint.
pub enum FrameExporter {
    Store(StoreExporter),
    Http(HttpExporter),
}

impl FrameExporter {
    /// Returns the exporter name for logging.
    pub fn name(&self) -> &str {
        match self {
            Self::Store(e) => e.name(),
            Self::Http(e) => e.name(),
        }
    }

    /// Initialize the exporter.
    pub async fn start(&mut self, ctx: CancellationToken) -> Result<()> {
        match self {
            Self::Store(_) => Ok(()),
            Self::Http(e) => e.start(ctx).await,
        }
    }

    /// Export one frame. Store writes run on the blocking pool.
    pub async fn export(&self, frame: &Frame) -> Result<()> {
        match self {
            Self::Store(e) => {
                let exporter = e.clone();
                let frame = frame.clone();
                tokio::task::spawn_blocking(move || exporter.export(&frame))
                    .await
                    .context("store export task")?
            }
            Self::Http(e) => e.export(frame).await,
        }
    }

    /// Shut down the exporter.
    pub async fn stop(&mut self) -> Result<()> {
        match self {
            Self::Store(_) => Ok(()),
            Self::Http(e) => e.stop().await,
        }
    }
}
