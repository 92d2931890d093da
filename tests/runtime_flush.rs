use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use viztel::api::health::HealthMetrics;
use viztel::config::ChannelConfig;
use viztel::store::{FrameStore, MemoryStore, StoreError, StoreKey};
use viztel::telemetry::exporter::{FrameExporter, StoreExporter};
use viztel::telemetry::frame::Frame;
use viztel::telemetry::TelemetryRuntime;

fn cfg(harvest_ms: u64, capacity: usize) -> ChannelConfig {
    ChannelConfig {
        harvest_interval: Duration::from_millis(harvest_ms),
        outbox_capacity: capacity,
        ..Default::default()
    }
}

fn store_exporter(store: &Arc<dyn FrameStore>, user: &str) -> FrameExporter {
    FrameExporter::Store(StoreExporter::new(Arc::clone(store), user, None))
}

/// Store that rejects appends while `down` is set.
struct FlakyStore {
    inner: MemoryStore,
    down: AtomicBool,
}

impl FrameStore for FlakyStore {
    fn append(&self, key: &StoreKey, frame: &Frame) -> Result<(), StoreError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("maintenance".to_string()));
        }
        self.inner.append(key, frame)
    }

    fn range(&self, key: &StoreKey) -> Result<Vec<Frame>, StoreError> {
        self.inner.range(key)
    }
}

fn assert_ascending(frames: &[Frame]) {
    assert!(frames.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
}

#[tokio::test]
async fn frames_wait_in_outbox_until_exporter_attached() {
    let mut rt = TelemetryRuntime::new(cfg(10, 200));
    let ctx = CancellationToken::new();
    rt.start(ctx.clone()).await.expect("start");

    for i in 0..3 {
        rt.logic().push("ship", "thrust", i as f64);
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    let buffered = rt.buffered_frames();
    assert!(buffered >= 1, "expected queued frames, got {buffered}");

    let store: Arc<dyn FrameStore> = Arc::new(MemoryStore::default());
    rt.attach_exporter(store_exporter(&store, "u"));
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(rt.buffered_frames(), 0);

    ctx.cancel();
    rt.wait_for_shutdown().await;

    let frames = store.range(&StoreKey::stream("u")).expect("range");
    assert!(frames.len() >= buffered);
    assert_ascending(&frames);
}

#[tokio::test]
async fn cancel_emits_final_partial_frame() {
    let store: Arc<dyn FrameStore> = Arc::new(MemoryStore::default());
    // Long interval: only the immediate first tick fires before cancel.
    let mut rt = TelemetryRuntime::new(cfg(60_000, 200));
    rt.add_exporter(store_exporter(&store, "u"));
    let ctx = CancellationToken::new();
    rt.start(ctx.clone()).await.expect("start");
    tokio::task::yield_now().await;

    rt.geometry().push("hero", "weight", 0.25);
    rt.audio().push("__system__/audio", "peak_level", 0.7);
    ctx.cancel();
    rt.wait_for_shutdown().await;

    let frames = store.range(&StoreKey::stream("u")).expect("range");
    assert_eq!(frames.len(), 1);
    let hero = frames[0].entity("hero").expect("hero");
    assert_eq!(hero.weight.as_ref().and_then(|w| w.close()), Some(0.25));
    assert!(frames[0].entity("__system__/audio").is_some());
}

#[tokio::test]
async fn cancel_before_attach_keeps_frames_buffered() {
    let metrics = Arc::new(HealthMetrics::new().expect("metrics"));
    let mut rt = TelemetryRuntime::new(cfg(10, 2)).with_metrics(Arc::clone(&metrics));
    let ctx = CancellationToken::new();
    rt.start(ctx.clone()).await.expect("start");

    for i in 0..6 {
        rt.logic().push("ship", "x", i as f64);
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    ctx.cancel();
    rt.wait_for_shutdown().await;

    assert_eq!(rt.buffered_frames(), 2);
    assert!(metrics.frames_dropped.get() >= 1.0);
    assert_eq!(metrics.frames_buffered.get(), 2.0);
}

#[tokio::test]
async fn failed_exports_are_retried_in_order() {
    let flaky = Arc::new(FlakyStore {
        inner: MemoryStore::default(),
        down: AtomicBool::new(true),
    });
    let store: Arc<dyn FrameStore> = flaky.clone();
    let metrics = Arc::new(HealthMetrics::new().expect("metrics"));

    let mut rt = TelemetryRuntime::new(cfg(10, 200)).with_metrics(Arc::clone(&metrics));
    rt.add_exporter(store_exporter(&store, "u"));
    let ctx = CancellationToken::new();
    rt.start(ctx.clone()).await.expect("start");

    rt.logic().push("ship", "x", 1.0);
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(rt.buffered_frames() >= 1);
    assert!(metrics
        .export_errors
        .with_label_values(&["store"])
        .get()
        >= 1.0);

    flaky.down.store(false, Ordering::SeqCst);
    rt.logic().push("ship", "x", 2.0);
    tokio::time::sleep(Duration::from_millis(40)).await;
    ctx.cancel();
    rt.wait_for_shutdown().await;

    assert_eq!(rt.buffered_frames(), 0);
    let frames = store.range(&StoreKey::stream("u")).expect("range");
    assert_eq!(frames.len(), 2);
    assert_ascending(&frames);
    let closes: Vec<Option<f64>> = frames
        .iter()
        .map(|f| {
            f.entity("ship")
                .and_then(|s| s.attr("x"))
                .and_then(|m| m.close())
        })
        .collect();
    assert_eq!(closes, vec![Some(1.0), Some(2.0)]);
}

/// Store whose scenario index rejects appends while `down` is set.
struct ScenarioOutage {
    inner: MemoryStore,
    down: AtomicBool,
}

impl FrameStore for ScenarioOutage {
    fn append(&self, key: &StoreKey, frame: &Frame) -> Result<(), StoreError> {
        if matches!(key, StoreKey::Scenario { .. }) && self.down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("index rebuild".to_string()));
        }
        self.inner.append(key, frame)
    }

    fn range(&self, key: &StoreKey) -> Result<Vec<Frame>, StoreError> {
        self.inner.range(key)
    }
}

#[tokio::test]
async fn partial_store_failure_does_not_duplicate_stream() {
    let outage = Arc::new(ScenarioOutage {
        inner: MemoryStore::default(),
        down: AtomicBool::new(true),
    });
    let store: Arc<dyn FrameStore> = outage.clone();

    let mut rt = TelemetryRuntime::new(cfg(10, 200));
    rt.add_exporter(FrameExporter::Store(StoreExporter::new(
        Arc::clone(&store),
        "u",
        Some("run-1"),
    )));
    let ctx = CancellationToken::new();
    rt.start(ctx.clone()).await.expect("start");

    rt.logic().push("ship", "x", 1.0);
    tokio::time::sleep(Duration::from_millis(40)).await;
    // The stream took the frame, the index did not, so it stays queued.
    assert_eq!(rt.buffered_frames(), 1);
    assert_eq!(store.range(&StoreKey::stream("u")).expect("range").len(), 1);

    // Shutdown flushes the queued frame again.
    outage.down.store(false, Ordering::SeqCst);
    ctx.cancel();
    rt.wait_for_shutdown().await;

    let stream = store.range(&StoreKey::stream("u")).expect("range");
    let scenario = store.range(&StoreKey::scenario("u", "run-1")).expect("range");
    assert_eq!(stream.len(), 1);
    assert_eq!(scenario.len(), 1);
    assert_eq!(stream[0], scenario[0]);
    assert_eq!(rt.buffered_frames(), 0);
}
