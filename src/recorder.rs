// src/recorder.rs
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{DeviceConfig, FilterSettings};
use crate::types::{Epoch, VariabilityRecord};

pub const FORMAT_VERSION: u32 = 1;
/// How long `append` waits for room in a full queue before giving up.
pub const BACKLOG_WAIT: Duration = Duration::from_secs(5);
const RETRY_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("run store i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("could not encode run record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("run store writer has stopped")]
    WriterGone,
    #[error("run store backlog still full after {waited:?}")]
    Backlogged { waited: Duration },
    #[error("run store line {line} is unreadable: {reason}")]
    Corrupt { line: usize, reason: String },
}

/// First line of every store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunHeader {
    pub format_version: u32,
    pub started_at: DateTime<Local>,
    pub device: DeviceConfig,
    pub filter: FilterSettings,
    pub detector: String,
    #[serde(default)]
    pub info_text: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EpochEntry {
    pub epoch: Epoch,
    pub variability: VariabilityRecord,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum LineRef<'a> {
    Header(&'a RunHeader),
    Epoch {
        epoch: &'a Epoch,
        variability: &'a VariabilityRecord,
    },
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Line {
    Header(RunHeader),
    Epoch(EpochEntry),
}

/// A store read back from disk.
#[derive(Clone, Debug)]
pub struct StoredRun {
    pub header: RunHeader,
    pub entries: Vec<EpochEntry>,
    /// Fragments left behind by interrupted writes.
    pub skipped_lines: usize,
}

/// What the writer thread managed to do by the time the run ended.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WriterReport {
    pub written: u64,
    pub unresolved: u64,
    pub failures: u64,
}

/// `ecg_run_YYYY.MM.DD_HH.MM.SS.jsonl`
pub fn store_file_name(started_at: &DateTime<Local>) -> String {
    format!("ecg_run_{}.jsonl", started_at.format("%Y.%m.%d_%H.%M.%S"))
}

// 每次 flush 都落盘
struct SyncedFile(File);

impl Write for SyncedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }
    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()?;
        self.0.sync_data()
    }
}

/// Append-only JSON-lines store for one run, written behind the scheduler
/// by a dedicated thread through a bounded queue.
pub struct RunRecorder {
    path: Option<PathBuf>,
    tx: Option<SyncSender<String>>,
    handle: Option<JoinHandle<WriterReport>>,
    closing: Arc<AtomicBool>,
    backlog_wait: Duration,
    queued: u64,
    report: Option<WriterReport>,
}

impl RunRecorder {
    /// Creates a new store named after the run start inside `dir`.
    pub fn create(dir: &Path, header: &RunHeader, capacity: usize) -> Result<Self, PersistenceError> {
        fs::create_dir_all(dir)?;
        let base = store_file_name(&header.started_at);
        let mut path = dir.join(&base);
        let mut attempt = 1;
        let file = loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => break file,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists && attempt < 100 => {
                    attempt += 1;
                    let stem = base.trim_end_matches(".jsonl");
                    path = dir.join(format!("{stem}_{attempt}.jsonl"));
                }
                Err(e) => return Err(e.into()),
            }
        };
        let mut recorder = Self::with_writer(SyncedFile(file), header, capacity)?;
        info!("recording run to {}", path.display());
        recorder.path = Some(path);
        Ok(recorder)
    }

    /// Writes the header synchronously, then hands the writer to the
    /// write-behind thread. At most `capacity` lines wait in the queue and
    /// another `capacity` in the writer's retry backlog.
    pub fn with_writer<W>(mut writer: W, header: &RunHeader, capacity: usize) -> Result<Self, PersistenceError>
    where
        W: Write + Send + 'static,
    {
        let mut line = serde_json::to_string(&LineRef::Header(header))?;
        line.push('\n');
        writer.write_all(line.as_bytes())?;
        writer.flush()?;

        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::sync_channel::<String>(capacity);
        let closing = Arc::new(AtomicBool::new(false));
        let writer_closing = closing.clone();
        let handle = thread::Builder::new()
            .name("run-writer".into())
            .spawn(move || writer_loop(writer, rx, capacity, &writer_closing))?;
        Ok(Self {
            path: None,
            tx: Some(tx),
            handle: Some(handle),
            closing,
            backlog_wait: BACKLOG_WAIT,
            queued: 0,
            report: None,
        })
    }

    pub fn with_backlog_wait(mut self, wait: Duration) -> Self {
        self.backlog_wait = wait;
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Queues one completed epoch. Blocks while the queue is full, for at
    /// most the backlog wait; after that the epoch is rejected.
    pub fn append(&mut self, epoch: &Epoch, record: &VariabilityRecord) -> Result<(), PersistenceError> {
        let tx = self.tx.as_ref().ok_or(PersistenceError::WriterGone)?;
        let mut line = serde_json::to_string(&LineRef::Epoch {
            epoch,
            variability: record,
        })?;
        let deadline = Instant::now() + self.backlog_wait;
        loop {
            match tx.try_send(line) {
                Ok(()) => break,
                Err(TrySendError::Full(back)) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        warn!("epoch {} rejected, run store backlog is full", epoch.index);
                        return Err(PersistenceError::Backlogged {
                            waited: self.backlog_wait,
                        });
                    }
                    line = back;
                    thread::sleep(left.min(RETRY_BACKOFF));
                }
                Err(TrySendError::Disconnected(_)) => return Err(PersistenceError::WriterGone),
            }
        }
        self.queued += 1;
        Ok(())
    }

    /// Closes the queue and waits for the writer's last retry.
    pub fn finish(&mut self) -> WriterReport {
        if let Some(report) = self.report {
            return report;
        }
        self.closing.store(true, Ordering::Release);
        drop(self.tx.take());
        let report = match self.handle.take().map(JoinHandle::join) {
            Some(Ok(report)) => report,
            Some(Err(_)) => {
                error!("run writer thread panicked");
                WriterReport {
                    written: 0,
                    unresolved: self.queued,
                    failures: 1,
                }
            }
            None => WriterReport::default(),
        };
        if report.unresolved > 0 {
            warn!("{} epoch(s) never reached the run store", report.unresolved);
        }
        self.report = Some(report);
        report
    }
}

impl Drop for RunRecorder {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Pulls lines only while the retry backlog has room, so a stuck store
/// fills the queue and `append` feels it.
fn writer_loop<W: Write>(
    mut writer: W,
    rx: Receiver<String>,
    capacity: usize,
    closing: &AtomicBool,
) -> WriterReport {
    let mut pending: VecDeque<String> = VecDeque::new();
    let mut report = WriterReport::default();
    let mut torn = false;
    loop {
        if pending.len() < capacity {
            let next = if pending.is_empty() {
                rx.recv().map_err(|_| RecvTimeoutError::Disconnected)
            } else {
                rx.recv_timeout(RETRY_BACKOFF)
            };
            match next {
                Ok(line) => pending.push_back(line),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        } else if closing.load(Ordering::Acquire) {
            break;
        } else {
            thread::sleep(RETRY_BACKOFF);
        }
        flush_pending(&mut writer, &mut pending, &mut report, &mut torn);
    }
    // 最后一次重试
    pending.extend(rx.try_iter());
    flush_pending(&mut writer, &mut pending, &mut report, &mut torn);
    report.unresolved = pending.len() as u64;
    report
}

/// Writes queued lines in order and stops at the first failure; the rest
/// are retried on the next call. After a failed write the store may end in
/// a partial line, so the next write starts on a fresh line.
fn flush_pending<W: Write>(
    writer: &mut W,
    pending: &mut VecDeque<String>,
    report: &mut WriterReport,
    torn: &mut bool,
) {
    while let Some(line) = pending.front() {
        let mut buf = Vec::with_capacity(line.len() + 2);
        if *torn {
            buf.push(b'\n');
        }
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        match writer.write_all(&buf).and_then(|_| writer.flush()) {
            Ok(()) => {
                pending.pop_front();
                report.written += 1;
                *torn = false;
            }
            Err(e) => {
                report.failures += 1;
                *torn = true;
                warn!(
                    "run store write failed, {} epoch(s) pending retry: {e}",
                    pending.len()
                );
                return;
            }
        }
    }
}

pub fn load_run(path: &Path) -> Result<StoredRun, PersistenceError> {
    let text = fs::read_to_string(path)?;
    parse_run(&text)
}

/// Parses a store. Lines that do not decode (torn writes, a truncated last
/// line) are skipped and counted.
pub fn parse_run(text: &str) -> Result<StoredRun, PersistenceError> {
    let mut lines = text
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty());
    let header = match lines.next() {
        Some((no, line)) => match serde_json::from_str::<Line>(line) {
            Ok(Line::Header(header)) => header,
            Ok(Line::Epoch(_)) => {
                return Err(PersistenceError::Corrupt {
                    line: no + 1,
                    reason: "store does not start with a header".into(),
                })
            }
            Err(e) => {
                return Err(PersistenceError::Corrupt {
                    line: no + 1,
                    reason: e.to_string(),
                })
            }
        },
        None => {
            return Err(PersistenceError::Corrupt {
                line: 0,
                reason: "empty store".into(),
            })
        }
    };
    let mut entries = Vec::new();
    let mut skipped_lines = 0;
    for (no, line) in lines {
        match serde_json::from_str::<Line>(line) {
            Ok(Line::Epoch(entry)) => entries.push(entry),
            Ok(Line::Header(_)) => {
                return Err(PersistenceError::Corrupt {
                    line: no + 1,
                    reason: "second header inside one store".into(),
                })
            }
            Err(e) => {
                warn!("skipping unreadable store line {}: {e}", no + 1);
                skipped_lines += 1;
            }
        }
    }
    Ok(StoredRun {
        header,
        entries,
        skipped_lines,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BeatEvent, EpochStatus};
    use chrono::TimeZone;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    fn header() -> RunHeader {
        RunHeader {
            format_version: FORMAT_VERSION,
            started_at: Local.with_ymd_and_hms(2016, 7, 21, 14, 5, 9).unwrap(),
            device: DeviceConfig::default(),
            filter: FilterSettings::default(),
            detector: "peak-finder".into(),
            info_text: "subject 3, lead II".into(),
        }
    }
    fn epoch(index: u64) -> (Epoch, VariabilityRecord) {
        let started_at = header().started_at + chrono::Duration::seconds(5 * index as i64);
        let raw: Vec<f64> = (0..200).map(|i| (500 + (i * 7 + index as usize) % 50) as f64).collect();
        let epoch = Epoch {
            index,
            started_at,
            offset_s: 5.0 * index as f64,
            filtered: raw.iter().map(|v| v - 512.0).collect(),
            raw,
            beats: vec![BeatEvent {
                index: 40,
                amplitude: 12.5,
                time_s: 5.0 * index as f64 + 0.2,
            }],
            templates: vec![vec![0.0, 1.0, 0.5]],
            status: EpochStatus::Ok,
        };
        (epoch, VariabilityRecord::undefined(index))
    }
    /// Shared in-memory sink that fails a configurable number of writes,
    /// accepting a few bytes of each failed write first.
    #[derive(Clone, Default)]
    struct FlakySink {
        bytes: Arc<Mutex<Vec<u8>>>,
        fail_next: Arc<AtomicUsize>,
    }
    impl Write for FlakySink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut bytes = self.bytes.lock().unwrap();
            if self.fail_next.load(Ordering::SeqCst) > 0 {
                self.fail_next.fetch_sub(1, Ordering::SeqCst);
                bytes.extend_from_slice(&buf[..buf.len().min(10)]);
                return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
            }
            bytes.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
    #[test]
    fn file_name_follows_run_start() {
        assert_eq!(
            store_file_name(&header().started_at),
            "ecg_run_2016.07.21_14.05.09.jsonl"
        );
    }
    #[test]
    fn stored_run_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = RunRecorder::create(dir.path(), &header(), 2).unwrap();
        let mut written = Vec::new();
        for index in 0..5 {
            let (epoch, record) = epoch(index);
            recorder.append(&epoch, &record).unwrap();
            written.push(epoch);
        }
        let failed = Epoch::failed(5, Local::now(), 25.0, "device did not answer".into());
        recorder
            .append(&failed, &VariabilityRecord::undefined(5))
            .unwrap();
        let report = recorder.finish();
        assert_eq!(report.written, 6);
        assert_eq!(report.unresolved, 0);

        let path = recorder.path().unwrap().to_path_buf();
        assert!(path.ends_with("ecg_run_2016.07.21_14.05.09.jsonl"));
        let run = load_run(&path).unwrap();
        assert_eq!(run.header, header());
        assert_eq!(run.entries.len(), 6);
        for (stored, original) in run.entries.iter().zip(&written) {
            assert_eq!(stored.epoch.index, original.index);
            assert_eq!(stored.epoch.raw, original.raw);
            assert_eq!(stored.epoch.beats.len(), 1);
        }
        assert!(run.entries[5].epoch.status.is_failed());
    }
    #[test]
    fn soundcard_samples_reload_bit_for_bit() {
        let dir = tempfile::tempdir().unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        let mut recorder = RunRecorder::create(dir.path(), &header(), 4).unwrap();
        let mut written = Vec::new();
        for index in 0..20 {
            let (mut epoch, record) = epoch(index);
            epoch.raw = (0..200).map(|_| rng.gen_range(-1.0f32..1.0) as f64).collect();
            epoch.filtered = epoch.raw.iter().map(|v| v * 0.37 - 1e-3).collect();
            recorder.append(&epoch, &record).unwrap();
            written.push(epoch);
        }
        recorder.finish();
        let run = load_run(recorder.path().unwrap()).unwrap();
        assert_eq!(run.entries.len(), 20);
        for (stored, original) in run.entries.iter().zip(&written) {
            let bits = |v: &[f64]| v.iter().map(|x| x.to_bits()).collect::<Vec<_>>();
            assert_eq!(bits(&stored.epoch.raw), bits(&original.raw));
            assert_eq!(bits(&stored.epoch.filtered), bits(&original.filtered));
        }
    }
    #[test]
    fn stuck_store_pushes_back_on_append() {
        let sink = FlakySink::default();
        let mut recorder = RunRecorder::with_writer(sink.clone(), &header(), 2)
            .unwrap()
            .with_backlog_wait(Duration::from_millis(100));
        sink.fail_next.store(usize::MAX / 2, Ordering::SeqCst);
        let mut accepted = 0;
        let mut rejected = 0;
        for index in 0..12 {
            let (epoch, record) = epoch(index);
            match recorder.append(&epoch, &record) {
                Ok(()) => accepted += 1,
                Err(PersistenceError::Backlogged { .. }) => rejected += 1,
                Err(e) => panic!("unexpected {e}"),
            }
        }
        // Queue plus retry backlog, two lines each.
        assert!(accepted <= 4, "{accepted} lines held for a dead store");
        assert_eq!(accepted + rejected, 12);
        let report = recorder.finish();
        assert_eq!(report.written, 0);
        assert_eq!(report.unresolved, accepted);
    }
    #[test]
    fn second_run_in_the_same_second_gets_its_own_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = RunRecorder::create(dir.path(), &header(), 1).unwrap();
        let mut second = RunRecorder::create(dir.path(), &header(), 1).unwrap();
        assert_ne!(first.path(), second.path());
        first.finish();
        second.finish();
    }
    #[test]
    fn truncated_last_line_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = RunRecorder::create(dir.path(), &header(), 4).unwrap();
        for index in 0..3 {
            let (epoch, record) = epoch(index);
            recorder.append(&epoch, &record).unwrap();
        }
        recorder.finish();
        let path = recorder.path().unwrap().to_path_buf();
        let mut text = fs::read_to_string(&path).unwrap();
        let (epoch, record) = epoch(3);
        let line = serde_json::to_string(&LineRef::Epoch {
            epoch: &epoch,
            variability: &record,
        })
        .unwrap();
        text.push_str(&line[..line.len() / 2]);
        let run = parse_run(&text).unwrap();
        assert_eq!(run.entries.len(), 3);
        assert_eq!(run.skipped_lines, 1);
    }
    #[test]
    fn failed_writes_are_retried_on_the_next_flush() {
        let sink = FlakySink::default();
        let mut recorder = RunRecorder::with_writer(sink.clone(), &header(), 4).unwrap();
        sink.fail_next.store(2, Ordering::SeqCst);
        for index in 0..4 {
            let (epoch, record) = epoch(index);
            recorder.append(&epoch, &record).unwrap();
        }
        let report = recorder.finish();
        assert_eq!(report.written, 4);
        assert_eq!(report.unresolved, 0);
        assert_eq!(report.failures, 2);

        let text = String::from_utf8(sink.bytes.lock().unwrap().clone()).unwrap();
        let run = parse_run(&text).unwrap();
        let indices: Vec<u64> = run.entries.iter().map(|e| e.epoch.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
        assert_eq!(run.skipped_lines, 2);
    }
    #[test]
    fn unwritable_store_leaves_epochs_unresolved() {
        let sink = FlakySink::default();
        let mut recorder = RunRecorder::with_writer(sink.clone(), &header(), 4).unwrap();
        sink.fail_next.store(usize::MAX / 2, Ordering::SeqCst);
        for index in 0..3 {
            let (epoch, record) = epoch(index);
            recorder.append(&epoch, &record).unwrap();
        }
        let report = recorder.finish();
        assert_eq!(report.written, 0);
        assert_eq!(report.unresolved, 3);
    }
    #[test]
    fn store_must_start_with_a_header() {
        let (epoch, record) = epoch(0);
        let line = serde_json::to_string(&LineRef::Epoch {
            epoch: &epoch,
            variability: &record,
        })
        .unwrap();
        assert!(matches!(
            parse_run(&line),
            Err(PersistenceError::Corrupt { line: 1, .. })
        ));
    }
}
