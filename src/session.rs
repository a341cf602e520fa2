// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! The persistent campaign record and its single-producer/single-consumer
//! persistence pipeline (§4.4, §5). A `Session` owns the on-disk layout
//! under `<root>/<name>/`; a bounded channel feeds captured `Frame`s to a
//! dedicated worker thread, the way this codebase threads its detect and
//! solve engines off a `Mutex`-guarded shared state rather than blocking
//! the caller on disk I/O.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::analysis::Analysis;
use crate::frame::Frame;

/// Inbound queue capacity (§4.4): backpressure mechanism that limits
/// capture rate under slow storage.
pub const QUEUE_CAPACITY: usize = 8;

/// One persisted image's `info` map, in insertion order.
pub type ImageInfo = Vec<(String, String)>;

/// The on-disk manifest, `session.json` (§3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionManifest {
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub images: Vec<Vec<(String, String)>>,
}

/// One entry of the sibling `session_list.json` (name -> summary).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionSummary {
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub image_count: usize,
}

fn session_dir(root: &Path, name: &str) -> PathBuf {
    root.join(name)
}

fn images_dir(root: &Path, name: &str) -> PathBuf {
    session_dir(root, name).join("images")
}

fn manifest_path(root: &Path, name: &str) -> PathBuf {
    session_dir(root, name).join("session.json")
}

fn csv_path(root: &Path, name: &str) -> PathBuf {
    session_dir(root, name).join("data.csv")
}

fn log_path(root: &Path, name: &str) -> PathBuf {
    session_dir(root, name).join("output.log")
}

fn session_list_path(root: &Path) -> PathBuf {
    root.join("session_list.json")
}

/// Writes `contents` to `path` crash-safely: a temp file in the same
/// directory, then an atomic rename (§3 invariant on `session.json`).
fn atomic_write(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)
}

/// Appends one line to the session's `output.log` (or, before a Session
/// exists, the caller routes to a central `error_log.log` instead — see
/// `logging::EarlyLogSink`, §7 propagation policy item 1).
fn append_log(root: &Path, name: &str, line: &str) {
    let path = log_path(root, name);
    if let Ok(mut f) = fs::OpenOptions::new().create(true).append(true).open(&path) {
        let _ = writeln!(f, "{} {}", Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"), line);
    }
}

/// A named, on-disk campaign: a directory of images, a running JSON
/// manifest, and a CSV companion (§3). Opening by name *appends*
/// (§9 Open Question, resolved in DESIGN.md).
pub struct Session {
    pub name: String,
    pub root: PathBuf,
    pub start_time: DateTime<Utc>,
    images: Vec<ImageInfo>,
    csv_columns: Option<Vec<String>>,
    next_image_number: u32,
}

impl Session {
    /// Opens an existing on-disk session by name, or creates a fresh one.
    /// Ensures the session directory exists before any write (§3
    /// invariant) and upserts `session_list.json`.
    pub fn open_or_create(root: &Path, name: &str) -> std::io::Result<Self> {
        fs::create_dir_all(images_dir(root, name))?;

        let manifest_path = manifest_path(root, name);
        let (start_time, images) = if manifest_path.exists() {
            let contents = fs::read_to_string(&manifest_path)?;
            match serde_json::from_str::<SessionManifest>(&contents) {
                Ok(manifest) => (manifest.start_time, manifest.images),
                Err(e) => {
                    warn!("session.json for '{name}' is unreadable ({e}); starting a fresh manifest");
                    (Utc::now(), Vec::new())
                }
            }
        } else {
            (Utc::now(), Vec::new())
        };

        let csv_columns = fs::read_to_string(csv_path(root, name))
            .ok()
            .and_then(|contents| contents.lines().next().map(|h| h.split(',').map(|s| s.to_string()).collect()));

        let next_image_number = images
            .iter()
            .filter_map(|info| info.iter().find(|(k, _)| k == "number").and_then(|(_, v)| v.parse::<u32>().ok()))
            .max()
            .map(|n| n + 1)
            .unwrap_or(1);

        let session = Session {
            name: name.to_string(),
            root: root.to_path_buf(),
            start_time,
            images,
            csv_columns,
            next_image_number,
        };
        session.upsert_session_list()?;
        Ok(session)
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    fn upsert_session_list(&self) -> std::io::Result<()> {
        let path = session_list_path(&self.root);
        let mut list: Vec<SessionSummary> = fs::read_to_string(&path)
            .ok()
            .and_then(|c| serde_json::from_str(&c).ok())
            .unwrap_or_default();
        let summary = SessionSummary {
            name: self.name.clone(),
            start_time: self.start_time,
            last_updated: Utc::now(),
            image_count: self.images.len(),
        };
        match list.iter_mut().find(|s| s.name == self.name) {
            Some(existing) => *existing = summary,
            None => list.push(summary),
        }
        let body = serde_json::to_vec_pretty(&list)?;
        atomic_write(&path, &body)
    }

    fn write_manifest(&self) -> std::io::Result<()> {
        let manifest = SessionManifest {
            name: self.name.clone(),
            start_time: self.start_time,
            last_updated: Utc::now(),
            images: self.images.clone(),
        };
        let body = serde_json::to_vec_pretty(&manifest)?;
        atomic_write(&manifest_path(&self.root, &self.name), &body)
    }

    /// Appends one CSV row. The header (first frame's key set, in order)
    /// is written exactly once; a later frame introducing new keys writes
    /// only the known columns and the mismatch is logged (§4.4).
    fn append_csv_row(&mut self, info: &ImageInfo) -> std::io::Result<()> {
        let path = csv_path(&self.root, &self.name);
        let is_new = self.csv_columns.is_none();
        if is_new {
            self.csv_columns = Some(info.iter().map(|(k, _)| k.clone()).collect());
        }
        let columns = self.csv_columns.clone().unwrap();

        let incoming: Vec<&str> = info.iter().map(|(k, _)| k.as_str()).collect();
        if incoming != columns.iter().map(|s| s.as_str()).collect::<Vec<_>>() {
            warn!(
                "session '{}': frame introduces a CSV schema mismatch (expected {:?}, got {:?}); writing only the known columns",
                self.name, columns, incoming
            );
        }

        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(Vec::new());
        if is_new {
            writer.write_record(&columns)?;
        }
        let row: Vec<String> = columns
            .iter()
            .map(|col| info.iter().find(|(k, _)| k == col).map(|(_, v)| v.clone()).unwrap_or_default())
            .collect();
        writer.write_record(&row)?;
        let bytes = writer.into_inner().map_err(|e| std::io::Error::other(e.to_string()))?;

        let mut f = fs::OpenOptions::new().create(true).append(true).open(&path)?;
        f.write_all(&bytes)
    }

    /// Saves `pixels` as a PNG with one text chunk per `info` key (§4.4
    /// step iii, §6 image-file contract). Mono8 and demosaiced-RGB frames
    /// both go through the direct `png` encoder so tEXt chunks are
    /// available (the `image` crate's PNG encoder does not expose them).
    fn save_png(&self, image_number: u32, info: &ImageInfo, width: u32, height: u32, pixels: &[u8], channels: u8) -> std::io::Result<()> {
        let path = images_dir(&self.root, &self.name).join(format!("{}_{:03}.png", self.name, image_number));
        let file = fs::File::create(&path)?;
        let buf_writer = std::io::BufWriter::new(file);
        let mut encoder = png::Encoder::new(buf_writer, width, height);
        encoder.set_color(if channels == 1 { png::ColorType::Grayscale } else { png::ColorType::Rgb });
        encoder.set_depth(png::BitDepth::Eight);
        for (key, value) in info {
            let keyword = key.trim().replace(' ', "_");
            if let Err(e) = encoder.add_text_chunk(keyword, value.clone()) {
                warn!("session '{}': failed to attach PNG text chunk: {e}", self.name);
            }
        }
        let mut writer = encoder
            .write_header()
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        writer
            .write_image_data(pixels)
            .map_err(|e| std::io::Error::other(e.to_string()))
    }

    /// Executes the per-frame write plan of §4.4, best-effort per field:
    /// a failure in one step is logged and the others are still
    /// attempted. Returns the assigned image number.
    fn persist(&mut self, frame: &Frame) -> u32 {
        let image_number = self.next_image_number;
        self.next_image_number += 1;

        let analysis = Analysis::new(frame);
        let mut info = frame.info();
        // `Frame::info()` leaves "number" blank since Frame is immutable and
        // numbering is assigned here, at persistence time; fill it in now.
        if let Some(entry) = info.iter_mut().find(|(k, _)| k == "number") {
            entry.1 = image_number.to_string();
        }
        info.extend(analysis.info());

        self.images.push(info.clone());

        if let Err(e) = self.upsert_session_list() {
            error!("session '{}': failed to update session_list.json: {e:#}", self.name);
        }

        let (width, height, pixels, channels) = match frame.as_gray_image() {
            Some(gray) => (gray.width(), gray.height(), gray.into_raw(), 1u8),
            None => {
                let demosaiced = crate::analysis::demosaic_average_greens(frame.width, frame.height, &frame.pixels);
                (demosaiced.width(), demosaiced.height(), demosaiced.into_raw(), 3u8)
            }
        };
        if let Err(e) = self.save_png(image_number, &info, width, height, &pixels, channels) {
            error!("session '{}': failed to save PNG for image {image_number}: {e:#}", self.name);
        }

        if let Err(e) = self.write_manifest() {
            error!("session '{}': failed to rewrite session.json: {e:#}", self.name);
        }

        if let Err(e) = self.append_csv_row(&info) {
            error!("session '{}': failed to append CSV row: {e:#}", self.name);
        }

        append_log(&self.root, &self.name, &format!("persisted image {image_number}"));
        info!("session '{}': persisted image {image_number}", self.name);

        image_number
    }
}

/// A captured Frame plus the knowledge that it has been produced (success
/// or failure) and should be accounted against `Routine::advance_next_capture`.
enum QueueEntry {
    Frame(Frame),
    /// The sentinel enqueued once the Routine reports complete, so the
    /// persistence worker can drain and the Supervisor can join cleanly.
    Sentinel,
}

/// The bounded single-producer/single-consumer pipeline: the capture
/// worker pushes `Frame`s in, a persistence worker thread drains them in
/// order into the Session (§4.4, §5).
pub struct SessionRecorder {
    sender: SyncSender<QueueEntry>,
    worker: Option<JoinHandle<()>>,
    session: Arc<Mutex<Session>>,
    queue_len: Arc<std::sync::atomic::AtomicUsize>,
}

impl SessionRecorder {
    /// Spawns the persistence worker thread over `session`, consuming from
    /// a channel of capacity `QUEUE_CAPACITY`.
    pub fn start(session: Session) -> Self {
        let session = Arc::new(Mutex::new(session));
        let (sender, receiver): (SyncSender<QueueEntry>, Receiver<QueueEntry>) = sync_channel(QUEUE_CAPACITY);
        let worker_session = session.clone();
        let queue_len = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let worker_queue_len = queue_len.clone();
        let worker = std::thread::spawn(move || {
            for entry in receiver {
                match entry {
                    QueueEntry::Frame(frame) => {
                        let mut session = worker_session.lock().unwrap();
                        session.persist(&frame);
                        worker_queue_len.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                    }
                    QueueEntry::Sentinel => break,
                }
            }
        });
        SessionRecorder { sender, worker: Some(worker), session, queue_len }
    }

    /// Pushes a captured Frame onto the inbound queue, blocking the caller
    /// (the capture worker) if the queue is full (§4.4 backpressure).
    pub fn push(&self, frame: Frame) {
        self.queue_len.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if self.sender.send(QueueEntry::Frame(frame)).is_err() {
            error!("session persistence worker has already exited; dropping frame");
            self.queue_len.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    /// Current inbound queue depth, for the Supervisor's status line (§4.5).
    pub fn queue_len(&self) -> usize {
        self.queue_len.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn image_count(&self) -> usize {
        self.session.lock().unwrap().image_count()
    }

    /// Blocks until the queue is drained and the worker thread exits
    /// (§4.4 Shutdown, §5 Cancellation). Idempotent.
    pub fn stop_processing_queue(&mut self) {
        let _ = self.sender.send(QueueEntry::Sentinel);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for SessionRecorder {
    fn drop(&mut self) {
        self.stop_processing_queue();
    }
}

/// A cheap, `Clone`, `Send` handle to a running `SessionRecorder`: the
/// capture worker's view of the pipeline (push frames, read queue depth),
/// without the ability to stop it — that stays with whichever thread owns
/// the `SessionRecorder` itself (§5: the Supervisor, not the capture
/// worker, is responsible for shutdown ordering).
#[derive(Clone)]
pub struct SessionHandle {
    sender: SyncSender<QueueEntry>,
    session: Arc<Mutex<Session>>,
    queue_len: Arc<std::sync::atomic::AtomicUsize>,
}

impl SessionHandle {
    pub fn push(&self, frame: Frame) {
        self.queue_len.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if self.sender.send(QueueEntry::Frame(frame)).is_err() {
            error!("session persistence worker has already exited; dropping frame");
            self.queue_len.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    pub fn queue_len(&self) -> usize {
        self.queue_len.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn image_count(&self) -> usize {
        self.session.lock().unwrap().image_count()
    }
}

impl SessionRecorder {
    pub fn handle(&self) -> SessionHandle {
        SessionHandle { sender: self.sender.clone(), session: self.session.clone(), queue_len: self.queue_len.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::PixelFormat;
    use std::time::SystemTime;

    fn frame(n: u8) -> Frame {
        Frame::new(8, 8, vec![n; 64], PixelFormat::Mono8, SystemTime::now(), 100_000, 1.0, false)
    }

    #[test]
    fn test_open_creates_directory_and_empty_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::open_or_create(dir.path(), "campaign").unwrap();
        assert_eq!(session.image_count(), 0);
        assert!(dir.path().join("campaign").join("images").is_dir());
        assert!(dir.path().join("session_list.json").is_file());
    }

    #[test]
    fn test_persist_assigns_monotonic_numbers_and_writes_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = SessionRecorder::start(Session::open_or_create(dir.path(), "campaign").unwrap());
        recorder.push(frame(100));
        recorder.push(frame(150));
        recorder.stop_processing_queue();

        assert_eq!(recorder.image_count(), 2);
        let manifest_contents = fs::read_to_string(dir.path().join("campaign").join("session.json")).unwrap();
        let manifest: SessionManifest = serde_json::from_str(&manifest_contents).unwrap();
        assert_eq!(manifest.images.len(), 2);
        let numbers: Vec<&str> = manifest
            .images
            .iter()
            .map(|info| info.iter().find(|(k, _)| k == "number").unwrap().1.as_str())
            .collect();
        assert_eq!(numbers, vec!["1", "2"]);

        let csv_contents = fs::read_to_string(dir.path().join("campaign").join("data.csv")).unwrap();
        assert_eq!(csv_contents.lines().count(), 3); // header + 2 rows
    }

    #[test]
    fn test_reopen_appends_rather_than_truncates() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut recorder = SessionRecorder::start(Session::open_or_create(dir.path(), "campaign").unwrap());
            recorder.push(frame(10));
            recorder.stop_processing_queue();
        }
        {
            let mut recorder = SessionRecorder::start(Session::open_or_create(dir.path(), "campaign").unwrap());
            assert_eq!(recorder.image_count(), 1);
            recorder.push(frame(20));
            recorder.stop_processing_queue();
            assert_eq!(recorder.image_count(), 2);
        }
        let manifest_contents = fs::read_to_string(dir.path().join("campaign").join("session.json")).unwrap();
        let manifest: SessionManifest = serde_json::from_str(&manifest_contents).unwrap();
        assert_eq!(manifest.images.len(), 2);
    }

    #[test]
    fn test_png_round_trips_info_as_text_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = SessionRecorder::start(Session::open_or_create(dir.path(), "campaign").unwrap());
        recorder.push(frame(200));
        recorder.stop_processing_queue();

        let png_path = dir.path().join("campaign").join("images").join("campaign_001.png");
        let file = fs::File::open(&png_path).unwrap();
        let decoder = png::Decoder::new(file);
        let reader = decoder.read_info().unwrap();
        let info = reader.info();
        let texts: std::collections::HashMap<String, String> = info
            .uncompressed_latin1_text
            .iter()
            .map(|chunk| (chunk.keyword.clone(), chunk.text.clone()))
            .collect();
        assert_eq!(texts.get("number").map(String::as_str), Some("1"));
        assert!(texts.contains_key("integration_time_us"));
    }
}
