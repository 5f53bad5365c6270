// SPDX-License-Identifier: MIT
//! mcp-agent-inspector — embedded observability sidecar for MCP agent
//! workflows.
//!
//! The telemetry plane in one crate: a hook bus decoupling emit sites from
//! observers, span enrichment and gzipped JSONL export, session-scoped
//! context propagation, a live event bus with SSE fan-out, and the HTTP
//! gateway that serves it all under `/_inspector`.

pub mod config;
pub mod context;
pub mod decorators;
pub mod events;
pub mod exporter;
pub mod gateway;
pub mod instrument;
pub mod retention;
pub mod sessions;
pub mod span;
pub mod span_meta;
pub mod subscribers;

use std::sync::Arc;

use anyhow::Result;

use config::InspectorConfig;
use events::EventStream;
use exporter::{FileSpanExporter, SpanProcessor};
use sessions::{ExternalWorkflowClient, SessionRegistry, TraceScanCache};
use span::Tracer;
use subscribers::SubscriberSet;

/// Shared state handed to every gateway handler and background task.
pub struct InspectorContext {
    pub config: Arc<InspectorConfig>,
    pub events: Arc<EventStream>,
    pub registry: Arc<SessionRegistry>,
    pub tracer: Tracer,
    pub processor: Arc<SpanProcessor>,
    pub scan_cache: Arc<TraceScanCache>,
    pub external: Option<ExternalWorkflowClient>,
    pub started_at: std::time::Instant,
    /// Keeps the hook registrations alive for the context lifetime.
    _subscribers: SubscriberSet,
}

impl InspectorContext {
    /// Wire up the full telemetry plane: exporter + batch processor,
    /// tracer, event bus, live registry, and all hook subscribers.
    ///
    /// Must run inside a tokio runtime (the processor spawns its loop).
    pub fn new(config: InspectorConfig) -> Result<Arc<Self>> {
        let config = Arc::new(config);
        let events = Arc::new(EventStream::new());
        let registry = Arc::new(SessionRegistry::new());

        let exporter = FileSpanExporter::new(&config.traces_dir, events.clone())?;
        let (processor, span_tx) = SpanProcessor::spawn(exporter);
        let tracer = Tracer::new(span_tx);

        let subscribers = subscribers::register_all(
            registry.clone(),
            events.clone(),
            config.heartbeat_interval,
        );

        let external = match &config.external_workflow_url {
            Some(url) => Some(ExternalWorkflowClient::new(url.clone())?),
            None => None,
        };

        Ok(Arc::new(Self {
            config,
            events,
            registry,
            tracer,
            processor,
            scan_cache: Arc::new(TraceScanCache::new()),
            external,
            started_at: std::time::Instant::now(),
            _subscribers: subscribers,
        }))
    }

    /// Drain and close the span exporter and end every SSE stream. Called
    /// by the standalone server on shutdown; co-embedded hosts call it
    /// from their own teardown.
    pub async fn shutdown(&self) {
        self.events.close_all();
        self.processor.shutdown().await;
    }
}

/// Attach the inspector routes to a host application's router
/// (co-embedded mode).
pub fn mount(router: axum::Router, ctx: Arc<InspectorContext>) -> axum::Router {
    router.merge(gateway::build_router(ctx))
}
