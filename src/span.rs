// SPDX-License-Identifier: MIT
//! Span model and the in-process tracer.
//!
//! The agent framework opens spans through [`Tracer`]; hook subscribers
//! enrich whichever span is current on the emitting task; ended spans are
//! handed to the export channel exactly once. One trace per session, ids
//! in the W3C 32/16 hex shape.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::context;
use crate::span_meta;

/// Maximum span name length in characters.
pub const MAX_NAME_LEN: usize = 256;

/// Fresh 32-hex trace id.
pub fn new_trace_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Fresh 16-hex span id.
pub fn new_span_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    hex[..16].to_string()
}

// ─── Data model ───────────────────────────────────────────────────────────────

/// Scalar attribute value. Complex payloads are serialized to JSON strings
/// under `*_json` keys instead of nesting here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u64> for AttrValue {
    fn from(v: u64) -> Self {
        Self::Int(v as i64)
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl AttrValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SpanKind {
    #[default]
    Internal,
    Server,
    Client,
    Producer,
    Consumer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StatusCode {
    #[default]
    Unset,
    Ok,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpanStatus {
    pub code: StatusCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Timestamped point event attached to a span.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanEvent {
    pub name: String,
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, AttrValue>,
}

/// Reference to a span in another trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanLink {
    pub trace_id: String,
    pub span_id: String,
}

/// One structured operation record, written as a JSONL line on export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    pub trace_id: String,
    pub span_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub kind: SpanKind,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: SpanStatus,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, AttrValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<SpanEvent>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<SpanLink>,
}

impl Span {
    pub fn duration_ms(&self) -> Option<i64> {
        self.end_time
            .map(|end| (end - self.start_time).num_milliseconds())
    }
}

// ─── ActiveSpan ───────────────────────────────────────────────────────────────

struct ActiveInner {
    span: Span,
    recording: bool,
}

/// Shared recording handle for a span that has not ended yet.
///
/// Cheap to clone; subscribers hold it only for the duration of one hook
/// invocation. After [`ActiveSpan::end`] the handle stops recording and all
/// mutation becomes a no-op.
#[derive(Clone)]
pub struct ActiveSpan {
    inner: Arc<Mutex<ActiveInner>>,
}

tokio::task_local! {
    static CURRENT_SPAN: ActiveSpan;
}

impl ActiveSpan {
    fn new(span: Span) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ActiveInner {
                span,
                recording: true,
            })),
        }
    }

    /// The span currently entered on this task, if any.
    pub fn current() -> Option<ActiveSpan> {
        CURRENT_SPAN.try_with(Clone::clone).ok()
    }

    pub fn is_recording(&self) -> bool {
        self.inner.lock().expect("span lock poisoned").recording
    }

    pub fn trace_id(&self) -> String {
        self.inner.lock().expect("span lock poisoned").span.trace_id.clone()
    }

    pub fn span_id(&self) -> String {
        self.inner.lock().expect("span lock poisoned").span.span_id.clone()
    }

    /// Set one attribute. Ignored after the span has ended.
    pub fn set_attribute(&self, key: impl Into<String>, value: impl Into<AttrValue>) {
        let mut inner = self.inner.lock().expect("span lock poisoned");
        if inner.recording {
            inner.span.attributes.insert(key.into(), value.into());
        }
    }

    /// Append a point event.
    pub fn add_event(
        &self,
        name: impl Into<String>,
        attributes: BTreeMap<String, AttrValue>,
    ) {
        let mut inner = self.inner.lock().expect("span lock poisoned");
        if inner.recording {
            inner.span.events.push(SpanEvent {
                name: name.into(),
                time: Utc::now(),
                attributes,
            });
        }
    }

    pub fn set_status(&self, code: StatusCode, description: Option<String>) {
        let mut inner = self.inner.lock().expect("span lock poisoned");
        if inner.recording {
            inner.span.status = SpanStatus { code, description };
        }
    }

    pub fn add_link(&self, trace_id: String, span_id: String) {
        let mut inner = self.inner.lock().expect("span lock poisoned");
        if inner.recording {
            inner.span.links.push(SpanLink { trace_id, span_id });
        }
    }

    /// Read one attribute back.
    pub fn attribute(&self, key: &str) -> Option<AttrValue> {
        self.inner
            .lock()
            .expect("span lock poisoned")
            .span
            .attributes
            .get(key)
            .cloned()
    }

    /// Stamp the end time and stop recording. Returns the finished span the
    /// first time only, so a span is exported exactly once.
    fn end(&self) -> Option<Span> {
        let mut inner = self.inner.lock().expect("span lock poisoned");
        if !inner.recording {
            return None;
        }
        inner.recording = false;
        inner.span.end_time = Some(Utc::now());
        Some(inner.span.clone())
    }
}

// ─── Tracer ───────────────────────────────────────────────────────────────────

/// Opens spans and routes finished ones into the export channel.
///
/// The channel send is non-blocking; when the batch processor falls behind
/// the span is dropped with a WARN rather than stalling agent code.
#[derive(Clone)]
pub struct Tracer {
    tx: mpsc::Sender<Span>,
}

impl Tracer {
    pub fn new(tx: mpsc::Sender<Span>) -> Self {
        Self { tx }
    }

    /// Open a span. The parent is the task's current span; a root span
    /// starts a fresh trace. `session.id` is stamped when a session scope
    /// is active.
    pub fn start_span(&self, name: &str) -> ActiveSpan {
        let (trace_id, parent_span_id) = match ActiveSpan::current() {
            Some(parent) => (parent.trace_id(), Some(parent.span_id())),
            None => (new_trace_id(), None),
        };

        let mut name = name.to_string();
        if name.chars().count() > MAX_NAME_LEN {
            name = name.chars().take(MAX_NAME_LEN).collect();
        }

        let mut attributes = BTreeMap::new();
        let session_id = context::get();
        if session_id != context::UNKNOWN_SESSION {
            attributes.insert(
                span_meta::SESSION_ID.to_string(),
                AttrValue::Str(session_id),
            );
        }

        ActiveSpan::new(Span {
            trace_id,
            span_id: new_span_id(),
            parent_span_id,
            name,
            kind: SpanKind::Internal,
            start_time: Utc::now(),
            end_time: None,
            status: SpanStatus::default(),
            attributes,
            events: Vec::new(),
            links: Vec::new(),
        })
    }

    /// End a span and hand it to the exporter.
    pub fn finish(&self, span: &ActiveSpan) {
        if let Some(finished) = span.end() {
            if let Err(e) = self.tx.try_send(finished) {
                warn!(err = %e, "span export queue full, dropping span");
            }
        }
    }

    /// Run `fut` inside a new span that is current for the duration, then
    /// end and export it.
    pub async fn in_span<T>(
        &self,
        name: &str,
        fut: impl std::future::Future<Output = T>,
    ) -> T {
        let span = self.start_span(name);
        let out = CURRENT_SPAN.scope(span.clone(), fut).await;
        self.finish(&span);
        out
    }
}
