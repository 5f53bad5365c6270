// SPDX-License-Identifier: MIT
//! Per-session gzipped JSONL span persistence.
//!
//! Finished spans arrive on a channel, get batched off the hot path, and
//! are appended one JSON line at a time to `{traces_dir}/{session_id}.jsonl.gz`.
//! Writers rotate at 100 MiB of uncompressed ingest, live in an LRU capped
//! at 50 open handles, and survive disk-full and corrupt-file conditions
//! without ever raising into agent code.

use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::context::UNKNOWN_SESSION;
use crate::events::{Event, EventStream};
use crate::sessions::sanitize_session_id;
use crate::span::Span;
use crate::span_meta;

/// Maximum number of concurrently open gzip writers.
pub const MAX_OPEN_WRITERS: usize = 50;
/// Uncompressed ingest per file before rotating to a `_chunk_{n}` file.
pub const MAX_UNCOMPRESSED_BYTES: u64 = 100 * 1024 * 1024;
/// Advisory single-writer lock file inside the traces directory.
pub const LOCK_FILE: &str = ".inspector.lock";

const EXPORT_QUEUE: usize = 2048;
const EXPORT_BATCH: usize = 512;
const EXPORT_INTERVAL: Duration = Duration::from_secs(2);

// ─── Exporter ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Active,
    /// Disk exhausted: writes are retried each batch, alert already sent.
    DiskFull,
    /// A peer process owns the advisory lock; spans are dropped.
    LockHeld,
}

struct SessionWriter {
    path: PathBuf,
    encoder: GzEncoder<File>,
    /// Uncompressed bytes ingested since this file was opened.
    uncompressed: u64,
    chunk: u32,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ExportOutcome {
    Success,
    Partial { failed: usize },
    Disabled,
}

pub struct FileSpanExporter {
    traces_dir: PathBuf,
    events: Arc<EventStream>,
    writers: HashMap<String, SessionWriter>,
    /// LRU order: front is coldest, back is most recently used.
    order: VecDeque<String>,
    mode: Mode,
    max_file_bytes: u64,
    max_open_writers: usize,
    _lock: Option<fd_lock::RwLockWriteGuard<'static, File>>,
}

impl FileSpanExporter {
    /// Open the exporter on `traces_dir`, creating it if needed.
    ///
    /// A permission failure on the requested directory falls back to a
    /// temp location rather than disabling export. If a peer process holds
    /// the advisory lock the exporter comes up disabled (spans dropped,
    /// one `ExporterDisabled` note) while readers stay functional.
    pub fn new(traces_dir: &Path, events: Arc<EventStream>) -> Result<Self> {
        let traces_dir = prepare_traces_dir(traces_dir)?;

        let lock_path = traces_dir.join(LOCK_FILE);
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&lock_path)
            .with_context(|| format!("open lock file: {}", lock_path.display()))?;

        // The lock lives for the process; leaking the RwLock lets us hold
        // its guard without a self-referential struct.
        let locker: &'static mut fd_lock::RwLock<File> =
            Box::leak(Box::new(fd_lock::RwLock::new(lock_file)));

        let (mode, guard) = match locker.try_write() {
            Ok(guard) => (Mode::Active, Some(guard)),
            Err(_) => {
                warn!(
                    lock = %lock_path.display(),
                    "writer lock held by a peer process, span export disabled"
                );
                events.publish(Event::ExporterDisabled {
                    reason: "writer lock held by another process".to_string(),
                });
                (Mode::LockHeld, None)
            }
        };

        Ok(Self {
            traces_dir,
            events,
            writers: HashMap::new(),
            order: VecDeque::new(),
            mode,
            max_file_bytes: MAX_UNCOMPRESSED_BYTES,
            max_open_writers: MAX_OPEN_WRITERS,
            _lock: guard,
        })
    }

    /// Lower the rotation threshold (exercised by tests; production keeps
    /// the 100 MiB default).
    pub fn with_rotation_limit(mut self, bytes: u64) -> Self {
        self.max_file_bytes = bytes;
        self
    }

    pub fn with_writer_cap(mut self, cap: usize) -> Self {
        self.max_open_writers = cap.max(1);
        self
    }

    pub fn traces_dir(&self) -> &Path {
        &self.traces_dir
    }

    /// Append a batch of ended spans, grouped per session, in order.
    ///
    /// One span failing never drops the batch: corrupt files are renamed
    /// `.bad` and the write retried on a fresh file; a full disk switches
    /// to drop mode with a single `DiskSpaceLow` alert and is probed again
    /// on every subsequent batch.
    pub fn export(&mut self, spans: Vec<Span>) -> ExportOutcome {
        if self.mode == Mode::LockHeld {
            return ExportOutcome::Disabled;
        }
        if spans.is_empty() {
            return ExportOutcome::Success;
        }

        // Group by session id, preserving arrival order within each group.
        let mut group_index: HashMap<String, usize> = HashMap::new();
        let mut groups: Vec<(String, Vec<Span>)> = Vec::new();
        for span in spans {
            let session_id = span
                .attributes
                .get(span_meta::SESSION_ID)
                .and_then(|v| v.as_str())
                .map(sanitize_session_id)
                .unwrap_or_else(|| UNKNOWN_SESSION.to_string());
            match group_index.get(&session_id) {
                Some(&i) => groups[i].1.push(span),
                None => {
                    group_index.insert(session_id.clone(), groups.len());
                    groups.push((session_id, vec![span]));
                }
            }
        }

        let mut failed = 0usize;
        let mut wrote_any = false;
        for (session_id, batch) in groups {
            for span in &batch {
                let line = match serde_json::to_string(span) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(err = %e, "span serialization failed, dropping span");
                        failed += 1;
                        continue;
                    }
                };
                match self.write_line(&session_id, line.as_bytes()) {
                    Ok(()) => wrote_any = true,
                    Err(e) if e.kind() == std::io::ErrorKind::StorageFull => {
                        self.enter_disk_full();
                        failed += 1;
                    }
                    Err(e) => {
                        warn!(session = %session_id, err = %e, "trace append failed, quarantining file");
                        self.quarantine(&session_id);
                        match self.write_line(&session_id, line.as_bytes()) {
                            Ok(()) => wrote_any = true,
                            Err(e) => {
                                warn!(session = %session_id, err = %e, "retry after quarantine failed");
                                failed += 1;
                            }
                        }
                    }
                }
            }
            if let Err(e) = self.flush_session(&session_id) {
                // Buffered writes surface ENOSPC here rather than at write_all.
                if e.kind() == std::io::ErrorKind::StorageFull {
                    self.enter_disk_full();
                }
                warn!(session = %session_id, err = %e, "gzip flush failed");
            }
        }

        if wrote_any && self.mode == Mode::DiskFull {
            info!("disk space recovered, span export resumed");
            self.mode = Mode::Active;
        }

        if failed == 0 {
            ExportOutcome::Success
        } else {
            ExportOutcome::Partial { failed }
        }
    }

    /// Flush and close every open writer.
    pub fn shutdown(&mut self) {
        for (session_id, mut writer) in self.writers.drain() {
            if let Err(e) = writer.encoder.try_finish() {
                warn!(session = %session_id, err = %e, "close trace writer failed");
            }
        }
        self.order.clear();
    }

    #[cfg(test)]
    fn open_writer_count(&self) -> usize {
        self.writers.len()
    }

    // ─── Private ─────────────────────────────────────────────────────────────

    fn write_line(&mut self, session_id: &str, bytes: &[u8]) -> std::io::Result<()> {
        self.ensure_writer(session_id)?;
        self.rotate_if_needed(session_id)?;
        let writer = self
            .writers
            .get_mut(session_id)
            .expect("writer just ensured");
        writer.encoder.write_all(bytes)?;
        writer.encoder.write_all(b"\n")?;
        writer.uncompressed += bytes.len() as u64 + 1;
        Ok(())
    }

    fn flush_session(&mut self, session_id: &str) -> std::io::Result<()> {
        if let Some(writer) = self.writers.get_mut(session_id) {
            writer.encoder.flush()?;
        }
        Ok(())
    }

    /// Open (or re-open) the writer for a session, evicting the coldest
    /// writer when the cache is at capacity.
    fn ensure_writer(&mut self, session_id: &str) -> std::io::Result<()> {
        if self.writers.contains_key(session_id) {
            self.touch(session_id);
            return Ok(());
        }

        while self.writers.len() >= self.max_open_writers {
            if let Some(coldest) = self.order.pop_front() {
                if let Some(mut evicted) = self.writers.remove(&coldest) {
                    if let Err(e) = evicted.encoder.try_finish() {
                        warn!(session = %coldest, err = %e, "close evicted writer failed");
                    }
                    debug!(session = %coldest, "evicted trace writer");
                }
            } else {
                break;
            }
        }

        let chunk = highest_chunk_index(&self.traces_dir, session_id);
        let writer = self.open_chunk(session_id, chunk)?;
        self.writers.insert(session_id.to_string(), writer);
        self.order.push_back(session_id.to_string());
        Ok(())
    }

    fn rotate_if_needed(&mut self, session_id: &str) -> std::io::Result<()> {
        let needs_rotation = self
            .writers
            .get(session_id)
            .is_some_and(|w| w.uncompressed >= self.max_file_bytes);
        if !needs_rotation {
            return Ok(());
        }
        let mut old = self
            .writers
            .remove(session_id)
            .expect("rotating writer exists");
        let next_chunk = old.chunk + 1;
        if let Err(e) = old.encoder.try_finish() {
            warn!(session = %session_id, err = %e, "close rotated writer failed");
        }
        drop(old);
        info!(session = %session_id, chunk = next_chunk, "rotated trace file");
        let writer = self.open_chunk(session_id, next_chunk)?;
        self.writers.insert(session_id.to_string(), writer);
        Ok(())
    }

    fn open_chunk(&self, session_id: &str, chunk: u32) -> std::io::Result<SessionWriter> {
        let path = chunk_path(&self.traces_dir, session_id, chunk);
        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o644);
        }
        let file = options.open(&path)?;
        Ok(SessionWriter {
            path,
            encoder: GzEncoder::new(file, Compression::default()),
            uncompressed: 0,
            chunk,
        })
    }

    /// Rename a failing file to `{name}.bad` and drop its writer so the
    /// next write starts a fresh file for the session.
    fn quarantine(&mut self, session_id: &str) {
        let Some(mut writer) = self.writers.remove(session_id) else {
            return;
        };
        self.order.retain(|id| id != session_id);
        let _ = writer.encoder.try_finish();
        let path = writer.path.clone();
        drop(writer);
        let bad = bad_path(&path);
        if let Err(e) = std::fs::rename(&path, &bad) {
            warn!(path = %path.display(), err = %e, "quarantine rename failed");
        } else {
            warn!(path = %path.display(), to = %bad.display(), "trace file quarantined");
        }
    }

    fn enter_disk_full(&mut self) {
        if self.mode != Mode::DiskFull {
            warn!(dir = %self.traces_dir.display(), "traces disk full, dropping spans until space frees");
            self.events.publish(Event::DiskSpaceLow {
                path: self.traces_dir.display().to_string(),
            });
            self.mode = Mode::DiskFull;
        }
    }

    fn touch(&mut self, session_id: &str) {
        if self.order.back().map(String::as_str) == Some(session_id) {
            return;
        }
        self.order.retain(|id| id != session_id);
        self.order.push_back(session_id.to_string());
    }
}

pub fn chunk_path(traces_dir: &Path, session_id: &str, chunk: u32) -> PathBuf {
    if chunk == 0 {
        traces_dir.join(format!("{session_id}.jsonl.gz"))
    } else {
        traces_dir.join(format!("{session_id}_chunk_{chunk}.jsonl.gz"))
    }
}

fn bad_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("trace");
    path.with_file_name(format!("{name}.bad"))
}

/// Highest already-present chunk index for a session, so a restarted
/// process appends where the previous one left off.
fn highest_chunk_index(traces_dir: &Path, session_id: &str) -> u32 {
    let Ok(entries) = std::fs::read_dir(traces_dir) else {
        return 0;
    };
    let prefix = format!("{session_id}_chunk_");
    let mut highest = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(rest) = name.strip_prefix(&prefix) {
            if let Some(n) = rest.strip_suffix(".jsonl.gz").and_then(|n| n.parse().ok()) {
                highest = highest.max(n);
            }
        }
    }
    highest
}

fn prepare_traces_dir(requested: &Path) -> Result<PathBuf> {
    match create_dir_0755(requested) {
        Ok(()) => Ok(requested.to_path_buf()),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            let fallback = std::env::temp_dir().join("mcp_traces");
            warn!(
                requested = %requested.display(),
                fallback = %fallback.display(),
                "traces dir not writable, falling back to temp"
            );
            create_dir_0755(&fallback)
                .with_context(|| format!("create fallback traces dir: {}", fallback.display()))?;
            Ok(fallback)
        }
        Err(e) => {
            Err(e).with_context(|| format!("create traces dir: {}", requested.display()))
        }
    }
}

fn create_dir_0755(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o755);
        let _ = std::fs::set_permissions(dir, perms);
    }
    Ok(())
}

// ─── Batch processor ──────────────────────────────────────────────────────────

/// Owns the export loop: spans funnel in over a bounded channel, batches
/// flush on size or a short timer, and all file I/O runs on the blocking
/// pool so agent tasks never stall on gzip.
pub struct SpanProcessor {
    shutdown_notify: Arc<Notify>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SpanProcessor {
    /// Start the processor and return it with the span sender for the
    /// [`Tracer`](crate::span::Tracer).
    pub fn spawn(exporter: FileSpanExporter) -> (Arc<Self>, mpsc::Sender<Span>) {
        let (tx, mut rx) = mpsc::channel::<Span>(EXPORT_QUEUE);
        let shutdown_notify = Arc::new(Notify::new());
        let exporter = Arc::new(Mutex::new(exporter));

        let shutdown_signal = shutdown_notify.clone();
        let task = tokio::spawn(async move {
            let mut batch: Vec<Span> = Vec::with_capacity(EXPORT_BATCH);
            let mut interval = tokio::time::interval(EXPORT_INTERVAL);
            interval.tick().await; // skip immediate tick

            loop {
                tokio::select! {
                    maybe = rx.recv() => match maybe {
                        Some(span) => {
                            batch.push(span);
                            if batch.len() >= EXPORT_BATCH {
                                flush_batch(&exporter, &mut batch).await;
                            }
                        }
                        None => break,
                    },
                    _ = interval.tick() => {
                        if !batch.is_empty() {
                            flush_batch(&exporter, &mut batch).await;
                        }
                    }
                    _ = shutdown_signal.notified() => {
                        while let Ok(span) = rx.try_recv() {
                            batch.push(span);
                        }
                        flush_batch(&exporter, &mut batch).await;
                        break;
                    }
                }
            }

            // Drain whatever arrived after the loop decided to stop.
            while let Ok(span) = rx.try_recv() {
                batch.push(span);
            }
            flush_batch(&exporter, &mut batch).await;

            let exporter = exporter.clone();
            let _ = tokio::task::spawn_blocking(move || {
                exporter.lock().expect("exporter lock poisoned").shutdown();
            })
            .await;
        });

        (
            Arc::new(Self {
                shutdown_notify,
                task: tokio::sync::Mutex::new(Some(task)),
            }),
            tx,
        )
    }

    /// Flush pending spans, close all writers, and wait for the loop to
    /// exit. Idempotent.
    pub async fn shutdown(&self) {
        self.shutdown_notify.notify_one();
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
    }
}

async fn flush_batch(exporter: &Arc<Mutex<FileSpanExporter>>, batch: &mut Vec<Span>) {
    if batch.is_empty() {
        return;
    }
    let spans = std::mem::take(batch);
    let count = spans.len();
    let exporter = exporter.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        exporter.lock().expect("exporter lock poisoned").export(spans)
    })
    .await;
    match outcome {
        Ok(ExportOutcome::Success) => debug!(count, "exported span batch"),
        Ok(ExportOutcome::Partial { failed }) => {
            warn!(count, failed, "span batch exported with failures");
        }
        Ok(ExportOutcome::Disabled) => debug!(count, "exporter disabled, batch dropped"),
        Err(e) => warn!(err = %e, "span export task failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::{new_span_id, new_trace_id, AttrValue, Span, SpanKind, SpanStatus};
    use chrono::Utc;
    use flate2::read::MultiGzDecoder;
    use std::collections::BTreeMap;
    use std::io::BufRead;

    fn span_for(session_id: &str, name: &str) -> Span {
        let mut attributes = BTreeMap::new();
        attributes.insert(
            span_meta::SESSION_ID.to_string(),
            AttrValue::Str(session_id.to_string()),
        );
        Span {
            trace_id: new_trace_id(),
            span_id: new_span_id(),
            parent_span_id: None,
            name: name.to_string(),
            kind: SpanKind::Internal,
            start_time: Utc::now(),
            end_time: Some(Utc::now()),
            status: SpanStatus::default(),
            attributes,
            events: Vec::new(),
            links: Vec::new(),
        }
    }

    fn read_lines(path: &Path) -> Vec<String> {
        let file = std::fs::File::open(path).unwrap();
        std::io::BufReader::new(MultiGzDecoder::new(file))
            .lines()
            .map(|l| l.unwrap())
            .collect()
    }

    #[tokio::test]
    async fn export_then_read_roundtrips_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let events = Arc::new(EventStream::new());
        let mut exporter = FileSpanExporter::new(dir.path(), events).unwrap();

        let spans: Vec<Span> = (0..5)
            .map(|i| span_for("sess-rt0001", &format!("op-{i}")))
            .collect();
        let expected: Vec<String> = spans.iter().map(|s| s.span_id.clone()).collect();
        assert_eq!(exporter.export(spans), ExportOutcome::Success);
        exporter.shutdown();

        let lines = read_lines(&dir.path().join("sess-rt0001.jsonl.gz"));
        assert_eq!(lines.len(), 5);
        let got: Vec<String> = lines
            .iter()
            .map(|l| {
                serde_json::from_str::<Span>(l).unwrap().span_id
            })
            .collect();
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn spans_without_session_go_to_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let events = Arc::new(EventStream::new());
        let mut exporter = FileSpanExporter::new(dir.path(), events).unwrap();

        let mut span = span_for("x", "orphan");
        span.attributes.clear();
        exporter.export(vec![span]);
        exporter.shutdown();

        assert!(dir.path().join("unknown.jsonl.gz").exists());
    }

    #[tokio::test]
    async fn rotation_opens_chunk_files() {
        let dir = tempfile::tempdir().unwrap();
        let events = Arc::new(EventStream::new());
        let mut exporter = FileSpanExporter::new(dir.path(), events)
            .unwrap()
            .with_rotation_limit(512);

        for i in 0..20 {
            exporter.export(vec![span_for("sess-rot001", &format!("op-{i}"))]);
        }
        exporter.shutdown();

        assert!(dir.path().join("sess-rot001.jsonl.gz").exists());
        assert!(dir.path().join("sess-rot001_chunk_1.jsonl.gz").exists());
    }

    #[tokio::test]
    async fn writer_cache_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let events = Arc::new(EventStream::new());
        let mut exporter = FileSpanExporter::new(dir.path(), events)
            .unwrap()
            .with_writer_cap(2);

        for sid in ["sess-a00001", "sess-b00001", "sess-c00001", "sess-d00001"] {
            exporter.export(vec![span_for(sid, "op")]);
        }
        assert!(exporter.open_writer_count() <= 2);
        exporter.shutdown();

        // Evicted writers still flushed their content.
        for sid in ["sess-a00001", "sess-b00001", "sess-c00001", "sess-d00001"] {
            let lines = read_lines(&dir.path().join(format!("{sid}.jsonl.gz")));
            assert_eq!(lines.len(), 1, "{sid}");
        }
    }

    #[tokio::test]
    async fn peer_lock_disables_export() {
        let dir = tempfile::tempdir().unwrap();
        let events = Arc::new(EventStream::new());
        let _holder = FileSpanExporter::new(dir.path(), events.clone()).unwrap();
        let mut second = FileSpanExporter::new(dir.path(), events).unwrap();

        assert_eq!(
            second.export(vec![span_for("sess-lk0001", "op")]),
            ExportOutcome::Disabled
        );
        assert!(!dir.path().join("sess-lk0001.jsonl.gz").exists());
    }

    #[tokio::test]
    async fn processor_flushes_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let events = Arc::new(EventStream::new());
        let exporter = FileSpanExporter::new(dir.path(), events).unwrap();
        let (processor, tx) = SpanProcessor::spawn(exporter);

        tx.send(span_for("sess-pr0001", "op")).await.unwrap();
        processor.shutdown().await;

        let lines = read_lines(&dir.path().join("sess-pr0001.jsonl.gz"));
        assert_eq!(lines.len(), 1);
    }
}
