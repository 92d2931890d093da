use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use parking_lot::Mutex;

use super::{FrameStore, Retention, StoreError, StoreKey};
use crate::telemetry::frame::Frame;

/// File-backed frame store: one JSON Lines file per key.
///
/// A key's TTL is measured from its file's modification time, so every
/// append refreshes it. Re-appending a key's last line is skipped.
#[derive(Debug)]
pub struct JsonlStore {
    dir: PathBuf,
    retention: Retention,
    /// Last line written per key; also serializes file access.
    tails: Mutex<HashMap<StoreKey, Vec<u8>>>,
}

impl JsonlStore {
    /// Opens (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>, retention: Retention) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            retention,
            tails: Mutex::new(HashMap::new()),
        })
    }

    fn path_for(&self, key: &StoreKey) -> PathBuf {
        self.dir.join(format!("{}.jsonl", encode_file_name(&key.to_string())))
    }

    fn is_expired(&self, key: &StoreKey, path: &Path) -> Result<bool, StoreError> {
        let modified = fs::metadata(path)?.modified()?;
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or_default();
        Ok(age > self.retention.ttl_for(key))
    }
}

impl FrameStore for JsonlStore {
    fn append(&self, key: &StoreKey, frame: &Frame) -> Result<(), StoreError> {
        let path = self.path_for(key);
        let mut line = serde_json::to_vec(frame)?;
        line.push(b'\n');

        let mut tails = self.tails.lock();
        let (exists, expired) = match self.is_expired(key, &path) {
            Ok(expired) => (true, expired),
            Err(StoreError::Io(e)) if e.kind() == ErrorKind::NotFound => (false, false),
            Err(e) => return Err(e),
        };
        if exists && !expired {
            if !tails.contains_key(key) {
                if let Some(tail) = read_last_line(&path)? {
                    tails.insert(key.clone(), tail);
                }
            }
            if tails.get(key) == Some(&line) {
                return Ok(());
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(!expired)
            .truncate(expired)
            .open(&path)?;
        file.write_all(&line)?;
        tails.insert(key.clone(), line);
        Ok(())
    }

    fn range(&self, key: &StoreKey) -> Result<Vec<Frame>, StoreError> {
        let path = self.path_for(key);
        let mut tails = self.tails.lock();

        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if self.is_expired(key, &path)? {
            tails.remove(key);
            fs::remove_file(&path)?;
            return Ok(Vec::new());
        }

        let mut frames = Vec::new();
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Frame>(&line) {
                Ok(frame) => frames.push(frame),
                Err(e) => {
                    // A torn trailing write should not hide the rest of the list.
                    tracing::warn!(key = %key, line = lineno + 1, error = %e, "skipping corrupt frame line");
                }
            }
        }
        Ok(frames)
    }
}

const TAIL_WINDOW: u64 = 64 * 1024;

/// Returns the file's last newline-terminated line, including the newline.
/// `None` when the file is empty or the line is longer than the tail window.
fn read_last_line(path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let start = len.saturating_sub(TAIL_WINDOW);
    file.seek(SeekFrom::Start(start))?;
    let mut buf = Vec::with_capacity((len - start) as usize);
    file.read_to_end(&mut buf)?;

    if buf.last() != Some(&b'\n') {
        return Ok(None);
    }
    let body = &buf[..buf.len() - 1];
    match body.iter().rposition(|&b| b == b'\n') {
        Some(nl) => Ok(Some(buf[nl + 1..].to_vec())),
        None if start == 0 => Ok(Some(buf)),
        None => Ok(None),
    }
}

/// Maps a key path to a single safe file name; bytes outside
/// `[A-Za-z0-9._-]` are percent-encoded.
fn encode_file_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for b in raw.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-') {
            out.push(char::from(b));
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn store(dir: &Path) -> JsonlStore {
        JsonlStore::open(dir, Retention::default()).expect("open store")
    }

    #[test]
    fn test_append_and_range() {
        let dir = tempfile::tempdir().expect("tempdir");
        let s = store(dir.path());
        let key = StoreKey::scenario("alice", "checkout");
        for ts in [10, 20, 30] {
            s.append(&key, &Frame::new(ts, 100)).expect("append");
        }
        let frames = s.range(&key).expect("range");
        let ts: Vec<i64> = frames.iter().map(|f| f.timestamp).collect();
        assert_eq!(ts, vec![10, 20, 30]);
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let key = StoreKey::stream("bob");
        store(dir.path())
            .append(&key, &Frame::new(1, 100))
            .expect("append");
        assert_eq!(store(dir.path()).range(&key).expect("range").len(), 1);
    }

    #[test]
    fn test_range_missing_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(store(dir.path())
            .range(&StoreKey::stream("nobody"))
            .expect("range")
            .is_empty());
    }

    #[test]
    fn test_expired_file_is_removed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let s = JsonlStore::open(
            dir.path(),
            Retention {
                stream_ttl: Duration::from_millis(1),
                scenario_ttl: Duration::from_secs(60),
            },
        )
        .expect("open store");
        let key = StoreKey::stream("u");
        s.append(&key, &Frame::new(1, 100)).expect("append");
        std::thread::sleep(Duration::from_millis(20));

        assert!(s.range(&key).expect("range").is_empty());
        assert!(!s.path_for(&key).exists());
    }

    #[test]
    fn test_corrupt_line_is_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let s = store(dir.path());
        let key = StoreKey::stream("u");
        s.append(&key, &Frame::new(1, 100)).expect("append");
        let mut f = OpenOptions::new()
            .append(true)
            .open(s.path_for(&key))
            .expect("open file");
        f.write_all(b"{\"ts\":2,\"da\n").expect("write junk");
        s.append(&key, &Frame::new(3, 100)).expect("append");

        let ts: Vec<i64> = s
            .range(&key)
            .expect("range")
            .iter()
            .map(|f| f.timestamp)
            .collect();
        assert_eq!(ts, vec![1, 3]);
    }

    #[test]
    fn test_reappending_last_frame_is_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let key = StoreKey::stream("u");
        let frame = Frame::new(5, 100);
        {
            let s = store(dir.path());
            s.append(&key, &frame).expect("append");
            s.append(&key, &frame).expect("retry");
            assert_eq!(s.range(&key).expect("range").len(), 1);
        }

        // A fresh handle recovers the tail from disk.
        let s = store(dir.path());
        s.append(&key, &frame).expect("retry after reopen");
        s.append(&key, &Frame::new(6, 100)).expect("append");
        s.append(&key, &frame).expect("append older frame again");
        let ts: Vec<i64> = s
            .range(&key)
            .expect("range")
            .iter()
            .map(|f| f.timestamp)
            .collect();
        assert_eq!(ts, vec![5, 6, 5]);
    }

    #[test]
    fn test_read_last_line() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("t.jsonl");
        fs::write(&path, b"a\nbb\n").expect("write");
        assert_eq!(read_last_line(&path).expect("tail"), Some(b"bb\n".to_vec()));
        fs::write(&path, b"only\n").expect("write");
        assert_eq!(read_last_line(&path).expect("tail"), Some(b"only\n".to_vec()));
        fs::write(&path, b"a\ntorn").expect("write");
        assert_eq!(read_last_line(&path).expect("tail"), None);
    }

    #[test]
    fn test_encode_file_name() {
        assert_eq!(
            encode_file_name("telemetry/stream:a b"),
            "telemetry%2Fstream%3Aa%20b"
        );
        assert_eq!(encode_file_name("../x"), "..%2Fx");
    }
}
