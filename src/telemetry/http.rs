use std::io::Write;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::HttpExportConfig;

use super::frame::Frame;

/// HTTP NDJSON frame exporter with worker pool and compression.
///
/// Frames are queued on a bounded channel, batched by size or timeout,
/// optionally compressed and POSTed as newline-delimited JSON. A full queue
/// is reported as an export error so the caller can keep the frame.
pub struct HttpExporter {
    cfg: HttpExportConfig,
    tx: Option<mpsc::Sender<Frame>>,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

impl HttpExporter {
    /// Creates a new HTTP exporter with the given configuration.
    pub fn new(cfg: HttpExportConfig) -> Self {
        Self {
            cfg,
            tx: None,
            cancel: None,
            task: None,
        }
    }

    /// Returns the exporter name for logging.
    pub fn name(&self) -> &str {
        "http"
    }

    /// Whether `start` has run and `stop` has not.
    pub fn is_ready(&self) -> bool {
        self.tx.is_some()
    }

    /// Start the background accumulator task.
    ///
    /// The task runs until `stop`, not until `_ctx` is cancelled, so frames
    /// from the runtime's final flush are still delivered.
    pub async fn start(&mut self, _ctx: CancellationToken) -> Result<()> {
        if self.cfg.max_queue_size == 0 {
            bail!("http max_queue_size must be positive");
        }
        if self.cfg.workers == 0 {
            bail!("http workers must be positive");
        }
        if self.cfg.batch_size == 0 {
            bail!("http batch_size must be positive");
        }
        if self.cfg.batch_timeout.is_zero() {
            bail!("http batch_timeout must be positive");
        }
        let compression = Compression::from_str(&self.cfg.compression)?;

        let mut client = reqwest::Client::builder().timeout(self.cfg.export_timeout);
        if !self.cfg.keep_alive {
            client = client.pool_max_idle_per_host(0);
        }
        let sender = BatchSender {
            client: client.build().context("building HTTP client")?,
            cfg: Arc::new(self.cfg.clone()),
            compression,
            permits: Arc::new(Semaphore::new(self.cfg.workers)),
        };

        let (tx, rx) = mpsc::channel::<Frame>(self.cfg.max_queue_size);
        let stop = CancellationToken::new();
        self.tx = Some(tx);
        self.cancel = Some(stop.clone());
        self.task = Some(tokio::spawn(accumulate(rx, sender, stop)));

        tracing::info!(
            endpoint = %self.cfg.address,
            compression = ?compression,
            workers = self.cfg.workers,
            batch_size = self.cfg.batch_size,
            "frame HTTP export running",
        );
        Ok(())
    }

    /// Queues one frame for sending. Fails when the queue is full.
    pub async fn export(&self, frame: &Frame) -> Result<()> {
        let Some(tx) = &self.tx else {
            bail!("http exporter not started");
        };
        tx.try_send(frame.clone())
            .map_err(|e| anyhow::anyhow!("http export queue: {e}"))
    }

    /// Flushes what is queued and waits, up to `export_timeout`, for the
    /// accumulator to post its last batches.
    pub async fn stop(&mut self) -> Result<()> {
        self.tx = None;
        if let Some(stop) = self.cancel.take() {
            stop.cancel();
        }
        let Some(mut task) = self.task.take() else {
            return Ok(());
        };
        match tokio::time::timeout(self.cfg.export_timeout, &mut task).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => bail!("http export accumulator failed: {e}"),
            Err(_) => {
                task.abort();
                bail!(
                    "http export did not drain within {:?}",
                    self.cfg.export_timeout
                )
            }
        }
    }
}

/// Collects frames into batches of `batch_size`, sending early when
/// `batch_timeout` passes with a partial batch.
async fn accumulate(mut rx: mpsc::Receiver<Frame>, sender: BatchSender, stop: CancellationToken) {
    let size = sender.cfg.batch_size;
    let mut pending: Vec<Frame> = Vec::with_capacity(size);
    let mut workers = JoinSet::new();
    let mut timer = tokio::time::interval(sender.cfg.batch_timeout);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                while let Ok(frame) = rx.try_recv() {
                    pending.push(frame);
                    if pending.len() >= size {
                        sender.dispatch(&mut workers, &mut pending);
                    }
                }
                break;
            }
            received = rx.recv() => match received {
                Some(frame) => {
                    pending.push(frame);
                    while pending.len() < size {
                        let Ok(next) = rx.try_recv() else { break };
                        pending.push(next);
                    }
                    if pending.len() >= size {
                        sender.dispatch(&mut workers, &mut pending);
                    }
                }
                None => break,
            },
            _ = timer.tick() => sender.dispatch(&mut workers, &mut pending),
            Some(joined) = workers.join_next(), if !workers.is_empty() => {
                if let Err(e) = joined {
                    tracing::debug!(error = %e, "http export worker panicked");
                }
            }
        }
    }

    sender.dispatch(&mut workers, &mut pending);
    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            tracing::debug!(error = %e, "http export worker panicked");
        }
    }
    tracing::debug!("http export accumulator exited");
}

/// Sends batches with at most `cfg.workers` requests in flight.
struct BatchSender {
    client: reqwest::Client,
    cfg: Arc<HttpExportConfig>,
    compression: Compression,
    permits: Arc<Semaphore>,
}

impl BatchSender {
    /// Moves `pending` into a send task. No-op when empty.
    fn dispatch(&self, workers: &mut JoinSet<()>, pending: &mut Vec<Frame>) {
        if pending.is_empty() {
            return;
        }
        let frames = std::mem::replace(pending, Vec::with_capacity(self.cfg.batch_size));
        let client = self.client.clone();
        let cfg = Arc::clone(&self.cfg);
        let compression = self.compression;
        let permits = Arc::clone(&self.permits);

        workers.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            if let Err(e) = post_frames(&client, &cfg, compression, &frames).await {
                tracing::warn!(error = %e, frames = frames.len(), "frame batch not delivered");
            }
        });
    }
}

/// Encodes frames as NDJSON, one frame per line.
fn encode_ndjson(frames: &[Frame]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(frames.len() * 512);
    for frame in frames {
        serde_json::to_writer(&mut out, frame).context("encoding frame")?;
        out.push(b'\n');
    }
    Ok(out)
}

async fn post_frames(
    client: &reqwest::Client,
    cfg: &HttpExportConfig,
    compression: Compression,
    frames: &[Frame],
) -> Result<()> {
    let ndjson = encode_ndjson(frames)?;
    let body = compression.encode(&ndjson)?;

    let mut req = client
        .post(&cfg.address)
        .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson");
    if let Some(encoding) = compression.content_encoding() {
        req = req.header(reqwest::header::CONTENT_ENCODING, encoding);
    }
    for (name, value) in &cfg.headers {
        req = req.header(name.as_str(), value.as_str());
    }

    let resp = req.body(body).send().await.context("posting frames")?;
    let status = resp.status();
    // Read the body so the connection can be reused.
    let _ = resp.bytes().await;
    if !status.is_success() {
        bail!("frame endpoint returned {status}");
    }

    tracing::debug!(frames = frames.len(), bytes = ndjson.len(), "frames posted");
    Ok(())
}

/// Request body encoding for exported NDJSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Zstd,
    Zlib,
    Snappy,
}

impl FromStr for Compression {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "" | "none" => Self::None,
            "gzip" => Self::Gzip,
            "zstd" => Self::Zstd,
            "zlib" => Self::Zlib,
            "snappy" => Self::Snappy,
            other => bail!("unsupported compression: {other}"),
        })
    }
}

impl Compression {
    /// `Content-Encoding` header value, if any.
    pub fn content_encoding(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Gzip => Some("gzip"),
            Self::Zstd => Some("zstd"),
            Self::Zlib => Some("deflate"),
            Self::Snappy => Some("snappy"),
        }
    }

    pub fn encode(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::None => Ok(data.to_vec()),
            Self::Gzip => {
                let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
                enc.write_all(data).context("gzip write")?;
                enc.finish().context("gzip finish")
            }
            Self::Zlib => {
                let mut enc =
                    flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
                enc.write_all(data).context("zlib write")?;
                enc.finish().context("zlib finish")
            }
            Self::Zstd => zstd::encode_all(data, 0).context("zstd encode"),
            Self::Snappy => snap::raw::Encoder::new()
                .compress_vec(data)
                .context("snappy encode"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::metric::Metric;

    #[test]
    fn test_gzip_roundtrip() {
        let data = b"{\"ts\":1,\"data\":{}}\n";
        let compressed = Compression::Gzip.encode(data).expect("gzip compress");

        use flate2::read::GzDecoder;
        use std::io::Read;
        let mut decoder = GzDecoder::new(compressed.as_slice());
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .expect("gzip decompress");
        assert_eq!(decompressed, data);
    }

    #[test]
    fn test_zstd_and_snappy() {
        let data = b"frames frames frames";
        let z = Compression::Zstd.encode(data).expect("zstd compress");
        assert_eq!(zstd::decode_all(z.as_slice()).expect("zstd decompress"), data);

        let s = Compression::Snappy.encode(data).expect("snappy compress");
        let mut decoder = snap::raw::Decoder::new();
        assert_eq!(
            decoder.decompress_vec(&s).expect("snappy decompress"),
            data
        );
        assert_eq!(Compression::None.encode(data).expect("none"), data);
    }

    #[test]
    fn test_parse_compression() {
        assert_eq!("zlib".parse::<Compression>().expect("zlib"), Compression::Zlib);
        assert_eq!("".parse::<Compression>().expect("empty"), Compression::None);
        assert!("brotli".parse::<Compression>().is_err());
        assert_eq!(Compression::Gzip.content_encoding(), Some("gzip"));
        assert_eq!(Compression::Zlib.content_encoding(), Some("deflate"));
        assert_eq!(Compression::None.content_encoding(), None);
    }

    #[test]
    fn test_encode_ndjson_one_frame_per_line() {
        let frames = vec![
            Frame::new(1, 100).with_weight("a", Metric::from_value(1.0)),
            Frame::new(2, 100).with_attr("b", "x", Metric::from_value(2.0)),
        ];
        let buf = encode_ndjson(&frames).expect("encode");
        let text = String::from_utf8(buf).expect("utf8");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let back = Frame::from_json(lines[1]).expect("decode line");
        assert_eq!(back, frames[1]);
    }

    #[tokio::test]
    async fn test_export_before_start_fails() {
        let exporter = HttpExporter::new(HttpExportConfig::default());
        assert!(!exporter.is_ready());
        assert!(exporter.export(&Frame::new(1, 100)).await.is_err());
    }

    #[tokio::test]
    async fn test_stop_posts_final_batch() {
        use axum::{extract::State, http::StatusCode, routing::post, Router};
        use std::sync::atomic::{AtomicUsize, Ordering};

        let received = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route(
                "/frames",
                post(|State(count): State<Arc<AtomicUsize>>, body: String| async move {
                    count.fetch_add(body.lines().count(), Ordering::SeqCst);
                    StatusCode::OK
                }),
            )
            .with_state(Arc::clone(&received));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        // Neither the batch size nor the timeout fires before stop.
        let mut exporter = HttpExporter::new(HttpExportConfig {
            enabled: true,
            address: format!("http://{addr}/frames"),
            compression: "none".to_string(),
            batch_size: 64,
            batch_timeout: std::time::Duration::from_secs(10),
            ..Default::default()
        });
        exporter
            .start(CancellationToken::new())
            .await
            .expect("start");
        exporter.export(&Frame::new(1, 100)).await.expect("export");
        exporter.export(&Frame::new(2, 100)).await.expect("export");

        exporter.stop().await.expect("stop");
        assert_eq!(received.load(Ordering::SeqCst), 2);
        assert!(!exporter.is_ready());
    }

    #[tokio::test]
    async fn test_start_rejects_zero_batch_timeout() {
        let mut exporter = HttpExporter::new(HttpExportConfig {
            batch_timeout: std::time::Duration::ZERO,
            ..Default::default()
        });
        assert!(exporter.start(CancellationToken::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_start_rejects_zero_workers() {
        let mut exporter = HttpExporter::new(HttpExportConfig {
            workers: 0,
            ..Default::default()
        });
        assert!(exporter.start(CancellationToken::new()).await.is_err());
    }
}
