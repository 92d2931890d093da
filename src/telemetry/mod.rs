//! Producer side: signal channels, frame assembly and delivery.

pub mod assembler;
pub mod channel;
pub mod exporter;
pub mod frame;
pub mod http;
pub mod metric;
pub mod outbox;
pub mod replay;

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::health::HealthMetrics;
use crate::config::ChannelConfig;

use assembler::HarvestSet;
use channel::SignalChannel;
use exporter::FrameExporter;
use frame::Frame;
use outbox::FrameOutbox;

/// Periodically harvests the geometry, logic and audio channels into frames
/// and hands them to the attached exporters.
///
/// Frames produced while no exporter is attached are kept in a bounded
/// outbox and flushed, oldest first, once one is.
pub struct TelemetryRuntime {
    cfg: ChannelConfig,
    geometry: Arc<SignalChannel>,
    logic: Arc<SignalChannel>,
    audio: Arc<SignalChannel>,
    outbox: Arc<Mutex<FrameOutbox>>,
    metrics: Option<Arc<HealthMetrics>>,

    /// Exporters registered before `start`.
    exporters: Vec<FrameExporter>,
    /// Exporters attached while running.
    attach_tx: mpsc::UnboundedSender<FrameExporter>,
    /// Attach receiver, taken by `start`.
    attach_rx: Option<mpsc::UnboundedReceiver<FrameExporter>>,

    /// Handle for the run task.
    run_task: Arc<tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl TelemetryRuntime {
    pub fn new(cfg: ChannelConfig) -> Self {
        let (attach_tx, attach_rx) = mpsc::unbounded_channel();
        Self {
            outbox: Arc::new(Mutex::new(FrameOutbox::new(cfg.outbox_capacity))),
            cfg,
            geometry: Arc::new(SignalChannel::new()),
            logic: Arc::new(SignalChannel::new()),
            audio: Arc::new(SignalChannel::new()),
            metrics: None,
            exporters: Vec::with_capacity(2),
            attach_tx,
            attach_rx: Some(attach_rx),
            run_task: Arc::new(tokio::sync::Mutex::new(None)),
        }
    }

    /// Reports emission and outbox figures to `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<HealthMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Geometry observer channel ("dom").
    pub fn geometry(&self) -> &Arc<SignalChannel> {
        &self.geometry
    }

    /// Logical state channel ("virtual").
    pub fn logic(&self) -> &Arc<SignalChannel> {
        &self.logic
    }

    /// Audio analysis channel ("audio").
    pub fn audio(&self) -> &Arc<SignalChannel> {
        &self.audio
    }

    /// Registers an exporter before `start`.
    pub fn add_exporter(&mut self, exporter: FrameExporter) {
        self.exporters.push(exporter);
    }

    /// Attaches an exporter to a running (or not yet started) runtime.
    /// Queued frames are flushed to it once it is started.
    pub fn attach_exporter(&self, exporter: FrameExporter) {
        if self.attach_tx.send(exporter).is_err() {
            warn!("telemetry runtime stopped, exporter not attached");
        }
    }

    /// Frames currently waiting for an exporter.
    pub fn buffered_frames(&self) -> usize {
        self.outbox.lock().len()
    }

    /// Harvests all channels once and assembles a frame covering
    /// `[window_start, now)`.
    pub fn harvest_frame(&self, window_start: i64, now: i64) -> Option<Frame> {
        harvest_frame(&self.geometry, &self.logic, &self.audio, window_start, now)
    }

    /// Waits for the run task to finish.
    pub async fn wait_for_shutdown(&self) {
        let run_task = { self.run_task.lock().await.take() };
        if let Some(run_task) = run_task {
            if let Err(e) = run_task.await {
                warn!(error = %e, "telemetry runtime task join failed");
            }
        }
    }

    /// Starts the harvest loop. Cancelling `ctx` emits one final frame with
    /// whatever was accumulated, flushes the outbox and stops exporters.
    pub async fn start(&mut self, ctx: CancellationToken) -> Result<()> {
        let Some(mut attach_rx) = self.attach_rx.take() else {
            anyhow::bail!("telemetry runtime already started");
        };

        let mut exporters = std::mem::take(&mut self.exporters);
        for exporter in &mut exporters {
            exporter.start(ctx.clone()).await?;
            info!(exporter = exporter.name(), "exporter started");
        }

        let geometry = Arc::clone(&self.geometry);
        let logic = Arc::clone(&self.logic);
        let audio = Arc::clone(&self.audio);
        let outbox = Arc::clone(&self.outbox);
        let metrics = self.metrics.clone();
        let harvest_interval = self.cfg.harvest_interval;
        let prune_interval = self.cfg.prune_interval;
        let stale_threshold = self.cfg.stale_threshold;

        let run_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(harvest_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut prune_ticker = tokio::time::interval(prune_interval);
            prune_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut window_start = now_ms();

            let mut delivery = Delivery {
                exporters,
                outbox,
                metrics,
            };

            loop {
                tokio::select! {
                    _ = ctx.cancelled() => {
                        while let Ok(exporter) = attach_rx.try_recv() {
                            delivery.attach(exporter, &ctx).await;
                        }

                        let now = now_ms();
                        if let Some(frame) = harvest_frame(&geometry, &logic, &audio, window_start, now) {
                            info!(ts = frame.timestamp, dur_ms = frame.duration_ms, "final flush");
                            delivery.emit(frame).await;
                        }
                        delivery.flush_outbox().await;

                        let (remaining, dropped) = {
                            let outbox = delivery.outbox.lock();
                            (outbox.len(), outbox.dropped())
                        };
                        if remaining > 0 || dropped > 0 {
                            warn!(
                                frames = remaining,
                                dropped,
                                "frames left undelivered at shutdown",
                            );
                        }

                        for exporter in &mut delivery.exporters {
                            if let Err(e) = exporter.stop().await {
                                tracing::error!(
                                    exporter = exporter.name(),
                                    error = %e,
                                    "exporter stop failed",
                                );
                            }
                        }
                        info!("telemetry runtime stopped");
                        return;
                    }

                    Some(exporter) = attach_rx.recv() => {
                        delivery.attach(exporter, &ctx).await;
                        delivery.flush_outbox().await;
                    }

                    _ = ticker.tick() => {
                        let started = Instant::now();
                        let now = now_ms();
                        let frame = harvest_frame(&geometry, &logic, &audio, window_start, now);
                        window_start = now;
                        if let Some(m) = &delivery.metrics {
                            m.harvest_duration.observe(started.elapsed().as_secs_f64());
                        }
                        if let Some(frame) = frame {
                            delivery.emit(frame).await;
                        }
                    }

                    _ = prune_ticker.tick() => {
                        let pruned = geometry.prune_stale(stale_threshold)
                            + logic.prune_stale(stale_threshold)
                            + audio.prune_stale(stale_threshold);
                        if pruned > 0 {
                            debug!(pruned, "pruned stale signal slots");
                        }
                    }
                }
            }
        });
        *self.run_task.lock().await = Some(run_task);

        info!(
            harvest_interval = ?self.cfg.harvest_interval,
            outbox_capacity = self.outbox.lock().capacity(),
            "telemetry runtime started"
        );

        Ok(())
    }
}

fn harvest_frame(
    geometry: &SignalChannel,
    logic: &SignalChannel,
    audio: &SignalChannel,
    window_start: i64,
    now: i64,
) -> Option<Frame> {
    let set = HarvestSet {
        geometry: geometry.harvest(),
        logic: logic.harvest(),
        audio: audio.harvest(),
    };
    let duration = u64::try_from(now.saturating_sub(window_start)).unwrap_or(0);
    assembler::assemble(window_start, duration, set)
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Exporters plus the outbox that backs them, owned by the run task.
struct Delivery {
    exporters: Vec<FrameExporter>,
    outbox: Arc<Mutex<FrameOutbox>>,
    metrics: Option<Arc<HealthMetrics>>,
}

impl Delivery {
    async fn attach(&mut self, mut exporter: FrameExporter, ctx: &CancellationToken) {
        match exporter.start(ctx.clone()).await {
            Ok(()) => {
                info!(exporter = exporter.name(), "exporter attached");
                self.exporters.push(exporter);
            }
            Err(e) => {
                tracing::error!(exporter = exporter.name(), error = %e, "exporter start failed");
            }
        }
    }

    /// Sends queued frames first so delivery order follows assembly order.
    async fn emit(&mut self, frame: Frame) {
        if !self.exporters.is_empty() {
            self.flush_outbox().await;
        }
        if self.exporters.is_empty() || self.queued() > 0 {
            self.enqueue(frame);
            return;
        }
        if !self.export(&frame).await {
            self.enqueue(frame);
        }
    }

    /// Drains the outbox oldest first, stopping at the first frame no
    /// exporter accepts.
    async fn flush_outbox(&mut self) {
        if self.exporters.is_empty() {
            return;
        }
        let mut flushed = 0usize;
        loop {
            let Some(frame) = self.pop() else {
                break;
            };
            if !self.export(&frame).await {
                self.requeue_front(frame);
                break;
            }
            flushed += 1;
        }
        self.update_buffered();
        if flushed > 0 {
            info!(frames = flushed, "flushed outbox");
        }
    }

    /// Returns true when at least one exporter accepted the frame.
    async fn export(&self, frame: &Frame) -> bool {
        let mut delivered = false;
        for exporter in &self.exporters {
            match exporter.export(frame).await {
                Ok(()) => delivered = true,
                Err(e) => {
                    warn!(exporter = exporter.name(), error = %e, "export failed");
                    if let Some(m) = &self.metrics {
                        m.export_errors.with_label_values(&[exporter.name()]).inc();
                    }
                }
            }
        }
        if delivered {
            debug!(ts = frame.timestamp, entities = frame.data.len(), "frame emitted");
            if let Some(m) = &self.metrics {
                m.frames_emitted.inc();
            }
        }
        delivered
    }

    fn enqueue(&self, frame: Frame) {
        let evicted = self.outbox.lock().push(frame);
        if let Some(old) = evicted {
            warn!(ts = old.timestamp, "outbox full, dropped oldest frame");
            if let Some(m) = &self.metrics {
                m.frames_dropped.inc();
            }
        }
        self.update_buffered();
    }

    fn pop(&self) -> Option<Frame> {
        self.outbox.lock().pop()
    }

    fn requeue_front(&self, frame: Frame) {
        self.outbox.lock().requeue_front(frame);
    }

    fn queued(&self) -> usize {
        self.outbox.lock().len()
    }

    fn update_buffered(&self) {
        if let Some(m) = &self.metrics {
            m.frames_buffered.set(self.queued() as f64);
        }
    }
}
