// SPDX-License-Identifier: MIT
//! Session registry and unified session listing.
//!
//! A session is visible from two sources: the live in-memory registry of
//! running workflows, and the per-session trace files on disk. An optional
//! external durable-workflow service contributes a third. `list` merges all
//! three with live state taking precedence, degrading gracefully when the
//! external query fails.

use std::collections::{HashMap, VecDeque};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use flate2::read::MultiGzDecoder;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::InspectorConfig;

/// Valid session-id shape: URL-safe, at least six characters.
pub static SESSION_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{6,}$").expect("session id regex"));

pub fn valid_session_id(id: &str) -> bool {
    SESSION_ID_RE.is_match(id)
}

/// Map a raw session id to a filesystem-safe one: every character outside
/// `[A-Za-z0-9_-]` becomes `_`.
pub fn sanitize_session_id(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

// ─── View types ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Paused,
    Failed,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Engine {
    #[default]
    Local,
    ExternalWorkflow,
    InboundRequest,
}

impl Engine {
    pub fn parse(s: &str) -> Engine {
        match s {
            "external-workflow" | "temporal" => Engine::ExternalWorkflow,
            "inbound-request" => Engine::InboundRequest,
            _ => Engine::Local,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Local => "local",
            Engine::ExternalWorkflow => "external-workflow",
            Engine::InboundRequest => "inbound-request",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    pub id: String,
    pub status: SessionStatus,
    #[serde(default)]
    pub engine: Engine,
    pub started_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<String>,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_count: Option<u64>,
}

impl SessionMeta {
    pub fn fallback_title(id: &str) -> String {
        let short: String = id.chars().take(8).collect();
        format!("Session {short}")
    }
}

/// Response body of `GET /_inspector/sessions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionList {
    pub sessions: Vec<SessionMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temporal_error: Option<String>,
}

// ─── Live registry ────────────────────────────────────────────────────────────

/// A signal delivered to a paused workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalDelivery {
    pub signal: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// Framework-side handle returned by [`SessionRegistry::register_workflow`].
/// The workflow listens on `signals` and watches `cancelled`.
pub struct WorkflowHandle {
    pub signals: mpsc::Receiver<SignalDelivery>,
    pub cancelled: Arc<Notify>,
}

#[derive(Debug, Default)]
pub struct SessionCounters {
    pub llm_calls: AtomicU64,
    pub tokens: AtomicU64,
    pub tool_calls: AtomicU64,
    pub spans: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterTotals {
    pub llm_calls: u64,
    pub tokens: u64,
    pub tool_calls: u64,
    pub spans: u64,
}

struct LiveEntry {
    status: SessionStatus,
    engine: Engine,
    title: String,
    started_at: String,
    counters: Arc<SessionCounters>,
    signal_tx: mpsc::Sender<SignalDelivery>,
    cancelled: Arc<Notify>,
    heartbeat: Option<JoinHandle<()>>,
}

struct FinishedEntry {
    status: SessionStatus,
    ended_at: String,
    duration_ms: Option<u64>,
}

const FINISHED_CAP: usize = 1000;

#[derive(Debug)]
pub enum SignalError {
    UnknownSession,
    Closed,
}

/// In-memory registry of workflows that have not yet drained to disk.
///
/// All methods are synchronous with short lock sections so they can be
/// called from hook subscribers and HTTP handlers alike.
#[derive(Default)]
pub struct SessionRegistry {
    live: RwLock<HashMap<String, LiveEntry>>,
    finished: Mutex<FinishedMap>,
}

#[derive(Default)]
struct FinishedMap {
    entries: HashMap<String, FinishedEntry>,
    order: VecDeque<String>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow root and hand back its signal/cancel handle.
    /// A re-registration under the same id replaces the previous handle.
    pub fn register_workflow(
        &self,
        session_id: &str,
        engine: Engine,
        title: Option<String>,
    ) -> WorkflowHandle {
        let (signal_tx, signals) = mpsc::channel(16);
        let cancelled = Arc::new(Notify::new());
        let entry = LiveEntry {
            status: SessionStatus::Running,
            engine,
            title: title.unwrap_or_else(|| SessionMeta::fallback_title(session_id)),
            started_at: Utc::now().to_rfc3339(),
            counters: Arc::new(SessionCounters::default()),
            signal_tx,
            cancelled: cancelled.clone(),
            heartbeat: None,
        };
        if let Some(old) = self
            .live
            .write()
            .expect("registry lock poisoned")
            .insert(session_id.to_string(), entry)
        {
            if let Some(task) = old.heartbeat {
                task.abort();
            }
        }
        WorkflowHandle { signals, cancelled }
    }

    pub fn set_heartbeat_task(&self, session_id: &str, task: JoinHandle<()>) {
        if let Some(entry) = self
            .live
            .write()
            .expect("registry lock poisoned")
            .get_mut(session_id)
        {
            entry.heartbeat = Some(task);
        }
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.live
            .read()
            .expect("registry lock poisoned")
            .contains_key(session_id)
    }

    pub fn set_status(&self, session_id: &str, status: SessionStatus) {
        if let Some(entry) = self
            .live
            .write()
            .expect("registry lock poisoned")
            .get_mut(session_id)
        {
            entry.status = status;
        }
    }

    /// Remove a session from the live map and remember its final status for
    /// listings until the trace file catches up.
    pub fn finish(&self, session_id: &str, status: SessionStatus) {
        let removed = self
            .live
            .write()
            .expect("registry lock poisoned")
            .remove(session_id);
        let duration_ms = removed.as_ref().and_then(|e| {
            let started = DateTime::parse_from_rfc3339(&e.started_at).ok()?;
            let ms = (Utc::now() - started.with_timezone(&Utc)).num_milliseconds();
            u64::try_from(ms).ok()
        });
        if let Some(entry) = removed {
            if let Some(task) = entry.heartbeat {
                task.abort();
            }
        }

        let mut finished = self.finished.lock().expect("finished lock poisoned");
        if !finished.entries.contains_key(session_id) {
            finished.order.push_back(session_id.to_string());
        }
        finished.entries.insert(
            session_id.to_string(),
            FinishedEntry {
                status,
                ended_at: Utc::now().to_rfc3339(),
                duration_ms,
            },
        );
        while finished.order.len() > FINISHED_CAP {
            if let Some(oldest) = finished.order.pop_front() {
                finished.entries.remove(&oldest);
            }
        }
    }

    pub fn counters(&self, session_id: &str) -> Option<Arc<SessionCounters>> {
        self.live
            .read()
            .expect("registry lock poisoned")
            .get(session_id)
            .map(|e| e.counters.clone())
    }

    pub fn totals(&self, session_id: &str) -> Option<CounterTotals> {
        self.counters(session_id).map(|c| CounterTotals {
            llm_calls: c.llm_calls.load(Ordering::Relaxed),
            tokens: c.tokens.load(Ordering::Relaxed),
            tool_calls: c.tool_calls.load(Ordering::Relaxed),
            spans: c.spans.load(Ordering::Relaxed),
        })
    }

    /// Deliver a signal to a live workflow.
    pub fn signal(
        &self,
        session_id: &str,
        delivery: SignalDelivery,
    ) -> std::result::Result<(), SignalError> {
        let tx = {
            let live = self.live.read().expect("registry lock poisoned");
            match live.get(session_id) {
                Some(entry) => entry.signal_tx.clone(),
                None => return Err(SignalError::UnknownSession),
            }
        };
        tx.try_send(delivery).map_err(|_| SignalError::Closed)
    }

    /// Request cancellation of a live workflow. Returns false when unknown.
    /// The notification is stored, so a workflow that has not reached its
    /// await point yet still observes it.
    pub fn cancel(&self, session_id: &str) -> bool {
        let live = self.live.read().expect("registry lock poisoned");
        match live.get(session_id) {
            Some(entry) => {
                entry.cancelled.notify_one();
                true
            }
            None => false,
        }
    }

    pub fn live_metas(&self) -> Vec<SessionMeta> {
        self.live
            .read()
            .expect("registry lock poisoned")
            .iter()
            .map(|(id, entry)| SessionMeta {
                id: id.clone(),
                status: entry.status,
                engine: entry.engine,
                started_at: entry.started_at.clone(),
                ended_at: None,
                title: entry.title.clone(),
                tags: None,
                duration_ms: None,
                span_count: Some(entry.counters.spans.load(Ordering::Relaxed)),
            })
            .collect()
    }

    fn finished_entry(&self, session_id: &str) -> Option<(SessionStatus, String, Option<u64>)> {
        self.finished
            .lock()
            .expect("finished lock poisoned")
            .entries
            .get(session_id)
            .map(|e| (e.status, e.ended_at.clone(), e.duration_ms))
    }
}

// ─── Trace-file metadata scan ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct FileMeta {
    first: Option<Value>,
    last: Option<Value>,
    line_count: u64,
}

struct CacheSlot {
    mtime: SystemTime,
    meta: FileMeta,
}

const SCAN_CACHE_CAP: usize = 1000;

/// Bounded (path, mtime)-keyed cache of per-file metadata extraction.
#[derive(Default)]
pub struct TraceScanCache {
    inner: Mutex<HashMap<PathBuf, CacheSlot>>,
}

impl TraceScanCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, path: &Path, mtime: SystemTime) -> Option<FileMeta> {
        let cache = self.inner.lock().expect("scan cache poisoned");
        cache
            .get(path)
            .filter(|slot| slot.mtime == mtime)
            .map(|slot| slot.meta.clone())
    }

    fn put(&self, path: PathBuf, mtime: SystemTime, meta: FileMeta) {
        let mut cache = self.inner.lock().expect("scan cache poisoned");
        if cache.len() >= SCAN_CACHE_CAP && !cache.contains_key(&path) {
            if let Some(evict) = cache.keys().next().cloned() {
                cache.remove(&evict);
            }
        }
        cache.insert(path, CacheSlot { mtime, meta });
    }
}

/// Read first/last JSON lines and line count from one gzipped JSONL file.
/// Multi-member gzip (append-mode writers) is handled transparently.
fn extract_file_meta(path: &Path) -> Result<FileMeta> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("open trace file: {}", path.display()))?;
    let reader = std::io::BufReader::new(MultiGzDecoder::new(file));

    let mut first = None;
    let mut last = None;
    let mut line_count = 0u64;
    for line in reader.lines() {
        let line = line.with_context(|| format!("read trace file: {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        line_count += 1;
        match serde_json::from_str::<Value>(&line) {
            Ok(value) => {
                if first.is_none() {
                    first = Some(value.clone());
                }
                last = Some(value);
            }
            // Keep the previous valid line; a torn tail must not hide the file.
            Err(e) => debug!(path = %path.display(), err = %e, "skipping malformed trace line"),
        }
    }

    Ok(FileMeta {
        first,
        last,
        line_count,
    })
}

fn meta_for_file(cache: &TraceScanCache, path: &Path) -> Option<FileMeta> {
    let mtime = std::fs::metadata(path).and_then(|m| m.modified()).ok()?;
    if let Some(hit) = cache.get(path, mtime) {
        return Some(hit);
    }
    match extract_file_meta(path) {
        Ok(meta) => {
            cache.put(path.to_path_buf(), mtime, meta.clone());
            Some(meta)
        }
        Err(e) => {
            warn!(path = %path.display(), err = %e, "corrupt trace file, skipping");
            None
        }
    }
}

fn attr_str<'a>(span: &'a Value, key: &str) -> Option<&'a str> {
    span.get("attributes")?.get(key)?.as_str()
}

/// Split `abcdef.jsonl.gz` / `abcdef_chunk_3.jsonl.gz` into (id, chunk).
fn parse_trace_filename(name: &str) -> Option<(String, u32)> {
    let base = name.strip_suffix(".jsonl.gz")?;
    if let Some((id, n)) = base.rsplit_once("_chunk_") {
        let chunk: u32 = n.parse().ok()?;
        return Some((id.to_string(), chunk));
    }
    Some((base.to_string(), 0))
}

/// Enumerate trace files and derive one [`SessionMeta`] per session id,
/// combining rotated chunks. Corrupt files are skipped, never fatal.
pub fn scan_traces_dir(traces_dir: &Path, cache: &TraceScanCache) -> Vec<SessionMeta> {
    let entries = match std::fs::read_dir(traces_dir) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };

    // session id -> sorted chunk paths
    let mut groups: HashMap<String, Vec<(u32, PathBuf)>> = HashMap::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some((id, chunk)) = parse_trace_filename(name) else {
            continue;
        };
        groups.entry(id).or_default().push((chunk, entry.path()));
    }

    let mut sessions = Vec::with_capacity(groups.len());
    for (id, mut chunks) in groups {
        chunks.sort_by_key(|(n, _)| *n);

        let mut first = None;
        let mut last = None;
        let mut span_count = 0u64;
        for (_, path) in &chunks {
            let Some(meta) = meta_for_file(cache, path) else {
                continue;
            };
            if first.is_none() {
                first = meta.first.clone();
            }
            if meta.last.is_some() {
                last = meta.last;
            }
            span_count += meta.line_count;
        }

        let Some(first) = first else {
            continue; // nothing parseable in any chunk
        };

        let started_at = first
            .get("start_time")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let ended_at = last
            .as_ref()
            .and_then(|s| s.get("end_time"))
            .and_then(Value::as_str)
            .map(String::from);

        let status = match &last {
            Some(span) if span.get("end_time").is_none() => SessionStatus::Running,
            Some(span)
                if span
                    .get("status")
                    .and_then(|s| s.get("code"))
                    .and_then(Value::as_str)
                    == Some("ERROR") =>
            {
                SessionStatus::Failed
            }
            _ => SessionStatus::Completed,
        };

        let engine = attr_str(&first, crate::span_meta::ENGINE_TYPE)
            .map(Engine::parse)
            .unwrap_or_default();

        let title = attr_str(&first, crate::span_meta::SESSION_TITLE)
            .map(String::from)
            .or_else(|| {
                attr_str(&first, crate::span_meta::WORKFLOW_TYPE).map(|w| {
                    let short: String = id.chars().take(8).collect();
                    format!("{w} - {short}")
                })
            })
            .unwrap_or_else(|| SessionMeta::fallback_title(&id));

        let duration_ms = match (&started_at, &ended_at) {
            (start, Some(end)) => {
                let start = DateTime::parse_from_rfc3339(start).ok();
                let end = DateTime::parse_from_rfc3339(end).ok();
                match (start, end) {
                    (Some(s), Some(e)) => {
                        u64::try_from((e - s).num_milliseconds()).ok()
                    }
                    _ => None,
                }
            }
            _ => None,
        };

        sessions.push(SessionMeta {
            id,
            status,
            engine,
            started_at,
            ended_at,
            title,
            tags: None,
            duration_ms,
            span_count: Some(span_count),
        });
    }
    sessions
}

// ─── External workflow service ────────────────────────────────────────────────

/// Client for the optional external durable-workflow service. Every call
/// carries a short timeout; failures degrade the listing, never break it.
pub struct ExternalWorkflowClient {
    base_url: String,
    client: reqwest::Client,
}

impl ExternalWorkflowClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(2))
            .build()
            .context("build workflow service client")?;
        Ok(Self {
            base_url: base_url.into(),
            client,
        })
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionMeta>> {
        let url = format!("{}/sessions", self.base_url.trim_end_matches('/'));
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("query workflow service")?
            .error_for_status()
            .context("workflow service status")?;
        let body: SessionList = resp.json().await.context("decode workflow sessions")?;
        Ok(body.sessions)
    }
}

// ─── Unified listing ──────────────────────────────────────────────────────────

fn sort_key(meta: &SessionMeta) -> i64 {
    DateTime::parse_from_rfc3339(&meta.started_at)
        .map(|dt| dt.timestamp_millis())
        .unwrap_or(i64::MIN)
}

/// Produce the merged, `started_at`-descending session list.
///
/// The filesystem scan runs on the blocking pool; live registry entries
/// override file-derived state; the external service contributes sessions
/// not seen locally. An external failure yields `temporal_error` alongside
/// the local results, never an error status.
pub async fn list(
    config: &InspectorConfig,
    registry: &SessionRegistry,
    cache: &Arc<TraceScanCache>,
    external: Option<&ExternalWorkflowClient>,
) -> SessionList {
    let traces_dir = config.traces_dir.clone();
    let cache = cache.clone();
    let scanned = tokio::task::spawn_blocking(move || scan_traces_dir(&traces_dir, &cache))
        .await
        .unwrap_or_default();

    let mut by_id: HashMap<String, SessionMeta> = HashMap::new();
    for mut meta in scanned {
        if let Some((status, ended_at, duration_ms)) = registry.finished_entry(&meta.id) {
            meta.status = status;
            if meta.ended_at.is_none() {
                meta.ended_at = Some(ended_at);
            }
            if meta.duration_ms.is_none() {
                meta.duration_ms = duration_ms;
            }
        }
        by_id.insert(meta.id.clone(), meta);
    }

    // Live workflows take precedence for status; keep file-derived counts.
    for live in registry.live_metas() {
        match by_id.get_mut(&live.id) {
            Some(existing) => {
                existing.status = live.status;
                existing.ended_at = None;
            }
            None => {
                by_id.insert(live.id.clone(), live);
            }
        }
    }

    let mut temporal_error = None;
    if let Some(client) = external {
        match client.list_sessions().await {
            Ok(remote) => {
                for meta in remote {
                    by_id.entry(meta.id.clone()).or_insert(meta);
                }
            }
            Err(e) => {
                warn!(err = %e, "external workflow query failed, serving local sessions");
                temporal_error = Some(format!("{e:#}"));
            }
        }
    }

    let mut sessions: Vec<SessionMeta> = by_id.into_values().collect();
    sessions.sort_by_key(|m| std::cmp::Reverse(sort_key(m)));

    SessionList {
        sessions,
        temporal_error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_validation() {
        assert!(valid_session_id("abcdef"));
        assert!(valid_session_id("Sess_01-xyz"));
        assert!(!valid_session_id("short"));
        assert!(!valid_session_id("../../etc/passwd"));
        assert!(!valid_session_id("has space here"));
    }

    #[test]
    fn sanitize_maps_bad_chars() {
        assert_eq!(sanitize_session_id("a/b\\c:d"), "a_b_c_d");
        assert_eq!(sanitize_session_id("fine-id_01"), "fine-id_01");
    }

    #[test]
    fn trace_filename_parsing() {
        assert_eq!(
            parse_trace_filename("abcdef.jsonl.gz"),
            Some(("abcdef".to_string(), 0))
        );
        assert_eq!(
            parse_trace_filename("abcdef_chunk_3.jsonl.gz"),
            Some(("abcdef".to_string(), 3))
        );
        assert_eq!(parse_trace_filename("notes.txt"), None);
    }

    #[test]
    fn engine_wire_values() {
        assert_eq!(
            serde_json::to_string(&Engine::ExternalWorkflow).unwrap(),
            "\"external-workflow\""
        );
        assert_eq!(Engine::parse("temporal"), Engine::ExternalWorkflow);
        assert_eq!(Engine::parse("anything-else"), Engine::Local);
    }

    #[tokio::test]
    async fn signal_unknown_session_errors() {
        let registry = SessionRegistry::new();
        let err = registry
            .signal(
                "nobody",
                SignalDelivery {
                    signal: "resume".to_string(),
                    payload: None,
                },
            )
            .unwrap_err();
        assert!(matches!(err, SignalError::UnknownSession));
    }

    #[tokio::test]
    async fn signal_reaches_workflow_handle() {
        let registry = SessionRegistry::new();
        let mut handle = registry.register_workflow("sess-sig001", Engine::Local, None);
        registry
            .signal(
                "sess-sig001",
                SignalDelivery {
                    signal: "human_input_answer".to_string(),
                    payload: Some(serde_json::json!({"ok": true})),
                },
            )
            .unwrap();
        let got = handle.signals.recv().await.unwrap();
        assert_eq!(got.signal, "human_input_answer");
    }

    #[tokio::test]
    async fn cancel_notifies_waiters() {
        let registry = SessionRegistry::new();
        let handle = registry.register_workflow("sess-can001", Engine::Local, None);
        let cancelled = handle.cancelled.clone();
        let waiter = tokio::spawn(async move { cancelled.notified().await });
        tokio::task::yield_now().await;
        assert!(registry.cancel("sess-can001"));
        waiter.await.unwrap();
        assert!(!registry.cancel("sess-unknown1"));
    }

    #[tokio::test]
    async fn finish_moves_to_finished_map() {
        let registry = SessionRegistry::new();
        let _handle = registry.register_workflow("sess-fin001", Engine::Local, None);
        assert!(registry.is_active("sess-fin001"));
        registry.finish("sess-fin001", SessionStatus::Completed);
        assert!(!registry.is_active("sess-fin001"));
        let (status, _, _) = registry.finished_entry("sess-fin001").unwrap();
        assert_eq!(status, SessionStatus::Completed);
    }
}
